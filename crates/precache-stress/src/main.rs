use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use precache::config::Config;

mod logging;
mod stresstest;
mod workload;

use stresstest::perform_stresstest;
use workload::Workload;

/// Hammers a cache of simulated fetches and reports throughput and latencies.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of distinct keys that are requested.
    #[arg(long, short, default_value_t = 64)]
    keys: usize,

    /// Number of concurrent operations.
    #[arg(long = "concurrency", short = 'n', default_value_t = 16)]
    concurrency: usize,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration, default_value = "10s")]
    duration: Duration,

    /// How long a single fetch takes.
    #[arg(long, value_parser = parse_duration, default_value = "10ms")]
    fetch_time: Duration,

    /// Share of keys whose fetch fails, between 0 and 1.
    #[arg(long, default_value_t = 0.0)]
    error_rate: f64,

    /// Request values through the throttled deferred queue.
    #[arg(long)]
    deferred: bool,

    /// Enable tracing, with all output discarded.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, sent to a local sink that discards them.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if !(0.0..=1.0).contains(&cli.error_rate) {
        anyhow::bail!("error rate must be between 0 and 1");
    }

    let guard = logging::init(logging::Config {
        tracing: cli.tracing,
        metrics: cli.metrics,
    })?;
    if !cli.tracing {
        // SAFETY: The runtime has not been started yet, so there is only a single thread.
        unsafe { precache::logging::init_logging(&config.logging) };
    }
    if !cli.metrics {
        precache::metrics::configure(&config.metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    if let Some(udp_sink) = guard.udp_sink {
        runtime.spawn(udp_sink);
    }

    let workload = Workload {
        keys: cli.keys,
        fetch_time: cli.fetch_time,
        error_rate: cli.error_rate,
    };

    runtime.block_on(async {
        // warmup: a short run to make sure the runtime and allocator are warm
        {
            let start = Instant::now();
            let warmup = cli.duration.min(Duration::from_secs(1)) / 10;
            perform_stresstest(&config.cache, workload, cli.concurrency, warmup, cli.deferred)
                .await;
            println!("Warmup: {:?}", start.elapsed());
        }
        println!();

        let report = perform_stresstest(
            &config.cache,
            workload,
            cli.concurrency,
            cli.duration,
            cli.deferred,
        )
        .await;
        report.print(cli.concurrency, cli.duration);
    });

    Ok(())
}
