//! BMU viewer
//!
//! Brings a CAN interface up through the privileged helper and exchanges raw
//! calibration payloads with the BMU over ISO-TP.
//!
//! # Usage
//!
//! ```bash
//! # List CAN devices after loading the driver
//! bmu-viewer devices
//!
//! # Send one payload and print the response
//! bmu-viewer --interface can0 send 22f190
//!
//! # Print every complete message until Ctrl-C
//! bmu-viewer monitor
//!
//! # Try the ISO-TP path without hardware
//! bmu-viewer --mock send 0102030405060708090a
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bmu_isotp::transport::mock::MockBus;
use bmu_isotp::transport::SystemTransportFactory;
use bmu_isotp::{FrameTransport, IsoTpSession, LinkConfig, SessionEvent};
use bmu_viewer::{
    Coordinator, CoordinatorHandle, CoordinatorSettings, EchoPeer, ElevatedLauncher,
    SysfsEnumerator, ViewerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "bmu-viewer")]
#[command(about = "BMU viewer: CAN interface lifecycle and ISO-TP calibration channel")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BMU_VIEWER_CONFIG")]
    config: Option<PathBuf>,

    /// CAN interface, overrides the configuration file
    #[arg(short, long)]
    interface: Option<String>,

    /// Use an in-memory bus with an echoing BMU instead of real hardware
    #[arg(long)]
    mock: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the driver and list CAN devices
    Devices,

    /// Send one payload and print the response
    Send {
        /// Payload as hex, e.g. "22f190" or "22 f1 90"
        payload: String,

        /// Response timeout in milliseconds
        #[arg(short, long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Print every complete message until Ctrl-C
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("bmu_viewer=debug,bmu_isotp=debug,bmu_ipc=debug")
        } else {
            EnvFilter::new("bmu_viewer=warn")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let mut config = match &args.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::default(),
    };
    if let Some(interface) = args.interface.clone() {
        config.can.interface = interface;
    }
    let link = config.isotp.to_link_config()?;

    if args.mock {
        return run_mock(&args, &config, link).await;
    }

    let launcher = ElevatedLauncher::new(&config.helper.elevation, &config.helper.path)
        .with_verbose(args.verbose);
    let coordinator = Coordinator::new(
        CoordinatorSettings::from_config(&config),
        Arc::new(launcher),
        Arc::new(SysfsEnumerator::new()),
        Arc::new(SystemTransportFactory),
    )
    .spawn()
    .await?;

    let result = run_with_helper(&args, &config, link, &coordinator).await;
    coordinator.shutdown().await;
    result
}

async fn run_with_helper(
    args: &Args,
    config: &ViewerConfig,
    link: LinkConfig,
    coordinator: &CoordinatorHandle,
) -> Result<()> {
    let devices = coordinator.devices().await?;

    if let Command::Devices = args.command {
        if devices.is_empty() {
            println!("No CAN devices found");
        }
        for device in &devices {
            println!("{}", device);
        }
        return Ok(());
    }

    let interface = &config.can.interface;
    if !devices.contains(interface) {
        warn!(interface = %interface, ?devices, "Interface not among enumerated devices");
    }
    let transport = coordinator.connect(interface).await?;
    let result = exchange(&args.command, transport, link, config.isotp.poll_interval()).await;

    if let Err(e) = coordinator.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    result
}

async fn run_mock(args: &Args, config: &ViewerConfig, link: LinkConfig) -> Result<()> {
    let bus = MockBus::new();
    let poll = config.isotp.poll_interval();

    if let Command::Devices = args.command {
        println!("{} (mock)", config.can.interface);
        return Ok(());
    }

    let _peer = EchoPeer::spawn(&bus, &link, poll)?;
    info!(interface = %config.can.interface, "Using mock CAN bus");
    exchange(&args.command, bus.attach(&config.can.interface), link, poll).await
}

async fn exchange(
    command: &Command,
    transport: Arc<dyn FrameTransport>,
    link: LinkConfig,
    poll: Duration,
) -> Result<()> {
    let session = IsoTpSession::open(transport, link, poll)?;

    let result = match command {
        Command::Devices => Ok(()),
        Command::Send {
            payload,
            timeout_ms,
        } => {
            let payload = parse_payload(payload)?;
            let response = session
                .send_receive(&payload, Duration::from_millis(*timeout_ms))
                .await
                .context("No response from BMU")?;
            println!("{}", hex::encode(response));
            Ok(())
        }
        Command::Monitor => monitor(&session).await,
    };

    session.close().await;
    result
}

async fn monitor(session: &IsoTpSession) -> Result<()> {
    let mut events = session.subscribe();
    println!("Monitoring {} (Ctrl-C to stop)", session.transport().interface());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Message(data)) => println!("{}", hex::encode(data)),
                Ok(SessionEvent::ReceiveFailed(err)) => warn!(error = %err, "Receive failed"),
                Ok(SessionEvent::TransportFailed(err)) => bail!("CAN transport failed: {}", err),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Monitor lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn parse_payload(payload: &str) -> Result<Vec<u8>> {
    let digits: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&digits).with_context(|| format!("Invalid hex payload: {}", payload))?;
    if bytes.is_empty() {
        bail!("Payload is empty");
    }
    Ok(bytes)
}
