//! BMU viewer helper
//!
//! Launched by the viewer through pkexec. Not meant to be started by hand.
//!
//! # Usage
//!
//! ```bash
//! pkexec bmu-viewer-helper --endpoint /tmp/bmu_viewer_helper
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bmu_helper::config::{DEFAULT_BITRATE, DEFAULT_DRIVER_MODULE, DEFAULT_RESTART_MS};
use bmu_helper::{run_connected, HelperConfig, SystemActions};

#[derive(Parser, Debug)]
#[command(name = "bmu-viewer-helper")]
#[command(about = "Privileged CAN interface helper for the BMU viewer")]
struct Args {
    /// Viewer endpoint (Unix socket path)
    #[arg(short, long)]
    endpoint: Option<PathBuf>,

    /// Kernel module loaded on `pcan init driver`
    #[arg(long, default_value = DEFAULT_DRIVER_MODULE)]
    driver_module: String,

    /// CAN bitrate in bit/s
    #[arg(long, default_value_t = DEFAULT_BITRATE)]
    bitrate: u32,

    /// Bus-off auto-restart delay in milliseconds
    #[arg(long, default_value_t = DEFAULT_RESTART_MS)]
    restart_ms: u32,

    /// Watchdog interval in milliseconds
    #[arg(long, default_value_t = bmu_ipc::WATCHDOG_INTERVAL.as_millis() as u64)]
    watchdog_ms: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stderr stays visible when running under pkexec
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("bmu_helper=debug,bmu_ipc=debug")
        } else {
            EnvFilter::new("bmu_helper=info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();

    let defaults = HelperConfig::default();
    let config = HelperConfig {
        endpoint: args.endpoint.unwrap_or(defaults.endpoint),
        driver_module: args.driver_module,
        bitrate: args.bitrate,
        restart_ms: args.restart_ms,
        watchdog: Duration::from_millis(args.watchdog_ms),
    };

    info!(
        endpoint = %config.endpoint.display(),
        driver = %config.driver_module,
        bitrate = config.bitrate,
        "Starting BMU viewer helper"
    );

    let actions = SystemActions::new(&config);
    let exit = run_connected(&config, actions).await?;

    std::process::exit(exit.exit_code());
}
