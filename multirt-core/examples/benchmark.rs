//! multirt Throughput Benchmark
//!
//! Compares one engine instance against a pool of N for the same
//! concurrent workload:
//! - Pool startup time
//! - Model load time
//! - Forward throughput as instances are added

use multirt_core::{InstanceSelector, PoolConfig, Runtime, Tensor};
use std::time::{Duration, Instant};

const THREADS: usize = 8;
const CALLS_PER_THREAD: usize = 25;
const WORK_MS: u64 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    multirt_core::init_tracing();

    let dir = std::env::temp_dir().join(format!("multirt-bench-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    std::fs::write(
        dir.join("work.json"),
        format!(r#"{{"kind": "scale", "factor": 2.0, "delay_ms": {}, "requires": ["tensor._C"]}}"#, WORK_MS),
    )?;

    println!("multirt throughput benchmark");
    println!("===========================================================");
    println!("{} threads x {} forwards, {} ms of work per call\n", THREADS, CALLS_PER_THREAD, WORK_MS);

    let mut baseline = None;
    for instances in [1, 2, 4, 8] {
        let elapsed = run(&dir, instances).await?;
        let speedup = baseline.map_or(1.0, |b: Duration| b.as_secs_f64() / elapsed.as_secs_f64());
        baseline.get_or_insert(elapsed);
        println!("  {} instance(s): {:>8.1?}  ({:.2}x)\n", instances, elapsed, speedup);
    }

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

async fn run(dir: &std::path::Path, instances: usize) -> anyhow::Result<Duration> {
    let config = PoolConfig {
        instance_count: instances,
        search_paths: vec![dir.to_path_buf()],
        ..PoolConfig::default()
    };

    let start = Instant::now();
    let runtime = Runtime::manifest(&config)?;
    let startup = start.elapsed();

    let mut handles = Vec::with_capacity(THREADS);
    for _ in 0..THREADS {
        handles.push(runtime.load_model(InstanceSelector::RoundRobin, "work").await?);
    }

    let start = Instant::now();
    for _ in 0..CALLS_PER_THREAD {
        let requests = handles
            .iter()
            .map(|&h| (h, Tensor::filled(vec![16], 1.0)))
            .collect();
        for output in runtime.forward_batch(requests).await {
            output?;
        }
    }
    let elapsed = start.elapsed();

    let snapshot = runtime.metrics();
    println!("  startup {:?}, avg load {:.2} ms, avg forward {:.2} ms", startup, snapshot.avg_load_ms, snapshot.avg_forward_ms);
    runtime.teardown().await?;
    Ok(elapsed)
}
