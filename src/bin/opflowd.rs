//! Opflow daemon binary.
//!
//! Runs the context manager and its keep-alive reaper until interrupted.
//! The wire transport plugs in around `CoordinatorService`; this binary only
//! owns process lifecycle.

use clap::Parser;
use opflow::config::ConfigLoader;
use opflow::context::ContextManager;
use opflow::devices::LocalCpuProvider;
use opflow::engine::ArithmeticEngine;
use opflow::logging::init_logging;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "opflowd", about = "Remote execution coordinator daemon", version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Override the reaper sweep interval in milliseconds
    #[arg(long)]
    sweep_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match ConfigLoader::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(interval) = cli.sweep_interval_ms {
        config.system.sweep_interval_ms = interval;
    }

    if let Err(e) = init_logging(Some(&config.logging)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!(
        sweep_interval_ms = config.system.sweep_interval_ms,
        cpu_devices = config.system.cpu_devices,
        "opflowd starting"
    );

    let manager = Arc::new(ContextManager::new(
        Arc::new(ArithmeticEngine::new()),
        Arc::new(LocalCpuProvider::new(config.system.cpu_devices)),
        Duration::from_millis(config.system.sweep_interval_ms),
    ));
    manager.start_reaper();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    manager.stop_reaper().await;
    manager.close_all().await;
    info!("opflowd stopped");
    Ok(())
}
