//! `resilience-kernel` command line.
//!
//! Validates configs, prints the defaults, or runs a kernel over the
//! in-process store until SIGINT/SIGTERM, reloading on config changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use resilience_kernel::config::{load_config, ConfigWatcher, KernelConfig};
use resilience_kernel::lifecycle::wait_for_shutdown;
use resilience_kernel::observability::{logging, metrics};
use resilience_kernel::store::MemoryStore;
use resilience_kernel::Kernel;

#[derive(Parser)]
#[command(name = "resilience-kernel")]
#[command(about = "Circuit breakers, retries, locks, rate limits and dead letters", long_about = None)]
struct Cli {
    /// TOML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file and exit
    Check,
    /// Print the default config as TOML
    Defaults,
    /// Run the kernel until interrupted
    Run {
        /// Seconds between health log lines
        #[arg(long, default_value_t = 30)]
        health_interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            let config = load(cli.config.as_ref())?;
            println!(
                "config OK (circuit threshold {}, {} retries, dead-letter capacity {})",
                config.circuit.failure_threshold, config.retry.max_retries, config.dead_letter.capacity
            );
        }
        Commands::Defaults => {
            print!("{}", toml::to_string_pretty(&KernelConfig::default())?);
        }
        Commands::Run { health_interval_secs } => {
            let config = load(cli.config.as_ref())?;
            run(config, cli.config, Duration::from_secs(health_interval_secs.max(1))).await?;
        }
    }
    Ok(())
}

fn load(path: Option<&PathBuf>) -> Result<KernelConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(KernelConfig::default()),
    }
}

async fn run(
    config: KernelConfig,
    config_path: Option<PathBuf>,
    health_interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability.log_level)?;
    tracing::info!("resilience-kernel v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let kernel = Arc::new(Kernel::start(config, Arc::new(MemoryStore::new()))?);

    // Keep the watcher alive for the lifetime of the process.
    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            let watcher = watcher.run()?;
            let kernel = kernel.clone();
            tokio::spawn(async move {
                while let Some(next) = updates.recv().await {
                    if let Err(e) = kernel.reload(next) {
                        tracing::error!(error = %e, "Rejected reloaded config");
                    }
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let reporter = {
        let kernel = kernel.clone();
        let stop = kernel.shutdown().token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = kernel.health().await;
                        tracing::info!(
                            status = ?report.status,
                            circuits = report.circuits.len(),
                            tripped = ?report.tripped_circuits().collect::<Vec<_>>(),
                            rate_limiter_degraded = report.rate_limiter_degraded,
                            dead_letter_depth = ?report.dead_letter_depth,
                            "Health"
                        );
                    }
                }
            }
        })
    };

    wait_for_shutdown().await;
    kernel.drain().await;
    let _ = reporter.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
