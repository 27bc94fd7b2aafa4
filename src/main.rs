// Demo binary - drives a synthetic workload through the scheduler
//
// The binary builds a scheduler from command-line flags (optionally layered over a JSON config
// file), keeps a few recurring tasks and bursts of deadline-bearing one-shot tasks flowing until
// the run duration elapses or Ctrl+C is received, then prints the latency snapshot as JSON.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use task_scheduler::{Scheduler, SchedulerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options parsed from program arguments.
struct CliOptions {
    config: SchedulerConfig,
    /// How long the workload runs before shutting down.
    duration: Duration,
}

/// Parse command-line arguments into `CliOptions`.
///
/// Supports `--flag=value` and `--flag value`:
/// - `--config <path>`: JSON `SchedulerConfig`, applied before the other flags
/// - `--workers <n>`: worker pool size
/// - `--dispatchers <n>`: dispatch thread count
/// - `--duration-ms <n>`: run length (default 2000)
fn parse_cli_options() -> Result<CliOptions, Box<dyn std::error::Error>> {
    let mut pairs = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some((key, value)) = arg.split_once('=') {
            pairs.push((key.to_string(), value.to_string()));
        } else if arg.starts_with("--") {
            let value = args
                .next()
                .ok_or_else(|| format!("missing value for {arg}"))?;
            pairs.push((arg, value));
        }
    }

    let mut config = match pairs.iter().find(|(key, _)| key == "--config") {
        Some((_, path)) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => SchedulerConfig::default(),
    };
    let mut duration = Duration::from_millis(2000);

    for (key, value) in &pairs {
        match key.as_str() {
            "--workers" => config.worker_threads = value.parse()?,
            "--dispatchers" => config.dispatch_threads = value.parse()?,
            "--duration-ms" => duration = Duration::from_millis(value.parse()?),
            "--config" => {}
            other => return Err(format!("unknown flag {other}").into()),
        }
    }

    Ok(CliOptions { config, duration })
}

/// Burn a little CPU so tasks take measurable time.
fn simulate_work(micros: u64) {
    let until = Instant::now() + Duration::from_micros(micros);
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = parse_cli_options()?;
    let scheduler = Scheduler::with_config(options.config)?;
    info!(
        workers = scheduler.worker_threads(),
        duration_ms = options.duration.as_millis() as u64,
        "scheduler demo starting"
    );

    let executed = Arc::new(AtomicU64::new(0));
    for (priority, interval_ms) in [(10, 5u64), (5, 20), (1, 50)] {
        let executed = Arc::clone(&executed);
        scheduler.schedule_recurring(
            move || {
                simulate_work(200);
                executed.fetch_add(1, Ordering::Relaxed);
            },
            priority,
            Duration::from_millis(interval_ms),
        )?;
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        shutdown_flag_clone.store(true, Ordering::Relaxed);
    })?;

    let started = Instant::now();
    let mut burst = 0u64;
    while started.elapsed() < options.duration && !shutdown_flag.load(Ordering::Relaxed) {
        let now = Instant::now();
        for i in 0..16u64 {
            let executed = Arc::clone(&executed);
            let deadline = (i % 4 == 0).then(|| now + Duration::from_millis(1 + i));
            scheduler.schedule(
                move || {
                    simulate_work(50);
                    executed.fetch_add(1, Ordering::Relaxed);
                },
                (burst % 7) as i32,
                deadline,
            )?;
        }
        burst += 1;
        std::thread::sleep(Duration::from_millis(10));
    }

    scheduler.shutdown();
    info!(
        executed = executed.load(Ordering::Relaxed),
        bursts = burst,
        "scheduler demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&scheduler.latency_snapshot())?);

    Ok(())
}
