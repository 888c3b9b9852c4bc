//! Nexus - in-process execution engine demo
//!
//! Streams synthetic work from a producer thread through the SPSC queue into
//! the engine, then prints the collected metrics.

use anyhow::{anyhow, Context, Result};
use nexus_core::{Engine, EngineConfig, LockFreeQueue, NexusError, Priority};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const DEFAULT_TASKS: u64 = 10_000;
const FEED_CAPACITY: usize = 1024;

struct Options {
    threads: Option<usize>,
    tasks: u64,
    config: Option<PathBuf>,
    json: bool,
}

impl Options {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(threads) = self.threads {
            config.num_threads = threads;
            config.min_threads = config.min_threads.min(threads);
            config.max_threads = config.max_threads.max(threads);
            config.validate().context("invalid --threads")?;
        }
        Ok(config)
    }
}

fn print_help() {
    println!("nexus - in-process execution engine v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  nexus [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -t, --threads <N>     Worker threads (default: available cores)");
    println!("  -n, --tasks <N>       Synthetic tasks to run (default: {DEFAULT_TASKS})");
    println!("  -c, --config <PATH>   JSON engine configuration");
    println!("      --json            Print metrics as JSON instead of a report");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!();
    println!("Set RUST_LOG (e.g. RUST_LOG=debug) to control log verbosity.");
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}");
    eprintln!("Run 'nexus --help' for usage information.");
    std::process::exit(1);
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> T {
    let Some(raw) = value else {
        usage_error(&format!("'{flag}' requires a value"));
    };
    raw.parse()
        .unwrap_or_else(|_| usage_error(&format!("invalid value '{raw}' for '{flag}'")))
}

/// `None` when the invocation only asked for help or the version.
fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Options> {
    let mut options = Options {
        threads: None,
        tasks: DEFAULT_TASKS,
        config: None,
        json: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("nexus {}", env!("CARGO_PKG_VERSION"));
                return None;
            }
            "-t" | "--threads" => options.threads = Some(parse_value(&arg, args.next())),
            "-n" | "--tasks" => options.tasks = parse_value(&arg, args.next()),
            "-c" | "--config" => options.config = Some(parse_value(&arg, args.next())),
            "--json" => options.json = true,
            _ => usage_error(&format!("unrecognized argument '{arg}'")),
        }
    }
    Some(options)
}

/// Deterministic CPU-bound payload; roughly one seed in a hundred fails.
fn simulate_work(seed: u64) -> std::result::Result<u64, String> {
    if seed % 97 == 96 {
        return Err(format!("seed {seed} rejected"));
    }
    let mut acc = seed;
    for _ in 0..(1_000 + seed % 4_000) {
        acc = acc
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
    }
    Ok(acc)
}

fn priority_for(seed: u64) -> Priority {
    match seed % 10 {
        0 => Priority::High,
        1 | 2 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn submit_seed(engine: &Engine, seed: u64) -> Result<()> {
    loop {
        match engine.submit_fallible(priority_for(seed), move || simulate_work(seed)) {
            Ok(_) => return Ok(()),
            Err(NexusError::QueueFull { .. }) => thread::sleep(Duration::from_micros(50)),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Producer thread -> SPSC queue -> engine.  Returns the number of tasks
/// submitted.
fn feed_engine(engine: &Engine, tasks: u64) -> Result<u64> {
    let (mut producer, mut consumer) = LockFreeQueue::new(FEED_CAPACITY)?.split();

    let feeder = thread::Builder::new()
        .name("nexus-feeder".into())
        .spawn(move || {
            for seed in 0..tasks {
                let mut item = seed;
                while let Err(rejected) = producer.enqueue(item) {
                    item = rejected;
                    thread::yield_now();
                }
            }
        })
        .context("failed to spawn feeder thread")?;

    let mut submitted = 0;
    loop {
        match consumer.dequeue() {
            Some(seed) => {
                submit_seed(engine, seed)?;
                submitted += 1;
            }
            None if consumer.is_abandoned() => break,
            None => thread::yield_now(),
        }
    }
    feeder
        .join()
        .map_err(|_| anyhow!("feeder thread panicked"))?;
    Ok(submitted)
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(options) = parse_args(std::env::args().skip(1)) else {
        return Ok(());
    };

    nexus_core::init_tracing();
    let config = options.engine_config()?;
    info!(
        "Starting Nexus engine v{} ({} threads, {} tasks)",
        env!("CARGO_PKG_VERSION"),
        config.num_threads,
        options.tasks
    );

    let engine = Arc::new(Engine::new(config)?);
    engine.start()?;

    let feeder_engine = Arc::clone(&engine);
    let tasks = options.tasks;
    let submitted = tokio::task::spawn_blocking(move || feed_engine(&feeder_engine, tasks))
        .await
        .context("feeder task panicked")??;

    // One block-backed task, awaited rather than blocked on.
    let checksum = engine
        .submit_with_block(Priority::High, |block| {
            for (i, byte) in block.iter_mut().enumerate() {
                *byte = (i % 251) as u8;
            }
            block.iter().map(|&b| u64::from(b)).sum::<u64>()
        })?
        .await?;

    let waiter = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || waiter.wait_all())
        .await
        .context("wait task panicked")?;

    let snapshot = engine.metrics_snapshot();
    let stats = engine.task_stats();
    engine.stop();
    info!(submitted, checksum, "Workload complete");

    if options.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        snapshot.print_report();
        println!(
            "tasks: {} total, {} completed, {} failed, {} cancelled, {:.1} us avg",
            stats.total_tasks,
            stats.completed_tasks,
            stats.failed_tasks,
            stats.cancelled_tasks,
            stats.avg_task_time_us
        );
    }
    Ok(())
}
