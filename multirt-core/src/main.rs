//! multirt - Multi-Instance Engine Runtime
//!
//! Starts a pool of reference engines, loads the given model manifests
//! round-robin across the instances and runs every model on one input.

use anyhow::{bail, Context, Result};
use multirt_core::{init_tracing, InstanceSelector, PoolConfig, Runtime, Tensor, FATAL_EXIT_CODE};
use std::path::PathBuf;
use tracing::{error, info};

fn print_help() {
    println!("multirt - Multi-Instance Engine Runtime v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  multirt [OPTIONS] --model <PATH>...");
    println!();
    println!("OPTIONS:");
    println!("  -n, --instances <N>    Number of engine instances (default 2)");
    println!("  -c, --config <PATH>    JSON pool configuration file");
    println!("  -m, --model <PATH>     Model manifest to load (repeatable)");
    println!("  -i, --input <VALUES>   Comma-separated input tensor (default 1,2,3)");
    println!("  -h, --help             Print this help message");
    println!("  -v, --version          Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  MULTIRT_INSTANCES      Overrides the configured instance count");
    println!("  RUST_LOG               Log filter (default info)");
}

#[derive(Debug, Default)]
struct Args {
    instances: Option<usize>,
    config: Option<PathBuf>,
    models: Vec<PathBuf>,
    input: Option<String>,
}

enum Command {
    Run(Args),
    Help,
    Version,
}

fn parse_args(raw: &[String]) -> Result<Command> {
    let mut args = Args::default();
    let mut iter = raw.iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} requires a value", flag))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-n" | "--instances" => {
                let n = value(arg)?;
                args.instances = Some(n.parse().with_context(|| format!("invalid instance count '{}'", n))?);
            }
            "-c" | "--config" => args.config = Some(PathBuf::from(value(arg)?)),
            "-m" | "--model" => args.models.push(PathBuf::from(value(arg)?)),
            "-i" | "--input" => args.input = Some(value(arg)?),
            other => bail!("unrecognized argument '{}'", other),
        }
    }
    Ok(Command::Run(args))
}

fn parse_tensor(text: &str) -> Result<Tensor> {
    let data = text
        .split(',')
        .map(|v| v.trim().parse::<f32>().with_context(|| format!("invalid tensor value '{}'", v)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::from_vec(data))
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PoolConfig::from_file(path)?,
        None => PoolConfig::default(),
    };
    config.apply_env()?;
    if let Some(n) = args.instances {
        config.instance_count = n;
    }
    let input = parse_tensor(args.input.as_deref().unwrap_or("1,2,3"))?;

    info!(instances = config.instance_count, "Starting multirt v{}", env!("CARGO_PKG_VERSION"));
    let runtime = Runtime::manifest(&config).context("Failed to initialize instance pool")?;

    let mut handles = Vec::with_capacity(args.models.len());
    for model in &args.models {
        match runtime.load_model(InstanceSelector::RoundRobin, model.clone()).await {
            Ok(handle) => handles.push((model, handle)),
            Err(e) => error!(model = ?model, error = %e, "Skipping model"),
        }
    }

    let requests = handles.iter().map(|(_, h)| (*h, input.clone())).collect();
    let outputs = runtime.forward_batch(requests).await;
    for ((model, handle), output) in handles.iter().zip(outputs) {
        let instance = runtime.pool().instance_of(*handle).unwrap_or_default();
        match output {
            Ok(tensor) => println!("{} {} (instance {}): {:?}", handle, model.display(), instance, tensor.data()),
            Err(e) => println!("{} {} (instance {}): error: {}", handle, model.display(), instance, e),
        }
    }

    println!();
    println!("{}", runtime.metrics());

    runtime.teardown().await.context("Teardown failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("multirt {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprintln!("Run 'multirt --help' for usage information.");
            std::process::exit(1);
        }
    };

    init_tracing();
    if let Err(e) = run(args).await {
        error!("{:#}", e);
        let fatal = e
            .downcast_ref::<multirt_core::RuntimeError>()
            .map_or(false, |e| e.is_fatal());
        if fatal {
            std::process::exit(FATAL_EXIT_CODE);
        }
        return Err(e);
    }
    Ok(())
}
