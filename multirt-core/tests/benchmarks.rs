//! Performance benchmarks for multirt Core.
//!
//! These tests measure timing for key operations and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p multirt-core --test benchmarks -- --ignored --nocapture
//! ```

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use multirt_core::engine::manifest::register_builtin_modules;
use multirt_core::{InstancePool, InstanceSelector, ManifestEngine, NativeModuleRegistry, PoolConfig, Tensor};
use tempfile::TempDir;

/// Helper to build a pool over a directory holding the benchmark models.
fn bench_pool(instances: usize, parallel_startup: bool) -> (TempDir, InstancePool<ManifestEngine>) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("identity.json"), r#"{"kind": "identity"}"#).unwrap();
    fs::write(
        dir.path().join("scale.json"),
        r#"{"kind": "scale", "factor": 0.5, "requires": ["tensor._C"]}"#,
    )
    .unwrap();
    fs::write(dir.path().join("busy.json"), r#"{"kind": "identity", "delay_ms": 5}"#).unwrap();

    let mut registry = NativeModuleRegistry::new();
    register_builtin_modules(&mut registry).unwrap();
    let config = PoolConfig {
        instance_count: instances,
        parallel_startup,
        search_paths: vec![dir.path().to_path_buf()],
        ..PoolConfig::default()
    };
    let pool = InstancePool::initialize(&config, registry, |i| Ok(ManifestEngine::new(i))).unwrap();
    (dir, pool)
}

// ---------------------------------------------------------------------------
// Pool startup benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_pool_startup() {
    const ITERATIONS: usize = 200;
    const INSTANCES: usize = 8;

    for parallel in [false, true] {
        let start = Instant::now();
        for _ in 0..ITERATIONS {
            let (_dir, pool) = bench_pool(INSTANCES, parallel);
            pool.teardown().unwrap();
        }
        let avg = start.elapsed() / ITERATIONS as u32;
        println!(
            "Pool startup ({} instances, parallel={}): avg {:?} over {} iterations",
            INSTANCES, parallel, avg, ITERATIONS
        );
        assert!(avg < Duration::from_millis(100), "pool startup too slow: {:?}", avg);
    }
}

// ---------------------------------------------------------------------------
// Model loading benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_model_load() {
    const ITERATIONS: usize = 2_000;
    let (_dir, pool) = bench_pool(4, true);

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        pool.load_model(InstanceSelector::RoundRobin, "scale").unwrap();
    }
    let elapsed = start.elapsed();
    let avg = elapsed / ITERATIONS as u32;
    println!("Model load: {} loads in {:?} (avg {:?})", ITERATIONS, elapsed, avg);
    assert!(avg < Duration::from_millis(5), "model load too slow: {:?}", avg);
}

// ---------------------------------------------------------------------------
// Forward latency benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_forward_latency() {
    const ITERATIONS: usize = 100_000;
    let (_dir, pool) = bench_pool(1, false);
    let handle = pool.load_model(InstanceSelector::Index(0), "identity").unwrap();
    let input = Tensor::filled(vec![64], 1.0);

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        pool.forward(handle, &input).unwrap();
    }
    let elapsed = start.elapsed();
    let avg_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("Forward: {} calls in {:?} (avg {} ns)", ITERATIONS, elapsed, avg_ns);
    assert!(avg_ns < 50_000, "forward overhead too high: {} ns", avg_ns);
}

// ---------------------------------------------------------------------------
// Instance scaling benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_instance_scaling() {
    const CALLS_PER_THREAD: usize = 40;
    const THREADS: usize = 4;

    let mut single = Duration::ZERO;
    for instances in [1, THREADS] {
        let (_dir, pool) = bench_pool(instances, true);
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..THREADS)
            .map(|_| pool.load_model(InstanceSelector::RoundRobin, "busy").unwrap())
            .collect();

        let start = Instant::now();
        let workers: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let input = Tensor::from_vec(vec![1.0]);
                    for _ in 0..CALLS_PER_THREAD {
                        pool.forward(handle, &input).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let elapsed = start.elapsed();
        println!(
            "{} threads on {} instance(s): {:?}\n{}",
            THREADS,
            instances,
            elapsed,
            pool.metrics().snapshot()
        );

        if instances == 1 {
            single = elapsed;
        } else {
            let speedup = single.as_secs_f64() / elapsed.as_secs_f64();
            println!("Speedup with {} instances: {:.2}x", THREADS, speedup);
            assert!(speedup > 2.0, "instances did not scale: {:.2}x", speedup);
        }
    }
}
