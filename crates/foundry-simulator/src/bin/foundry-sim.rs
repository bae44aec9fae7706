//! # Foundry Simulator
//!
//! Operator console that feeds synthetic telemetry into a foundry server.
//!
//! ## Usage
//!
//! ```bash
//! # Connect to a local server and type commands
//! foundry-sim
//!
//! # Drive every machine with noise as soon as the list arrives
//! foundry-sim --url ws://plant:3000/ws --all --autostart
//!
//! # Manual control of one machine
//! foundry-sim --mode manual --select machine-3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use foundry_protocol::Encoding;
use foundry_simulator::{console, link, ControlState, Mode, SharedControls, Simulator, SimulatorConfig};
use foundry_transport::WebSocketConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long `--autostart` waits for the machine list.
const AUTOSTART_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "foundry-sim", version, about = "Synthetic machine telemetry generator")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server WebSocket URL.
    #[arg(long)]
    url: Option<String>,

    /// Wire encoding (json or msgpack).
    #[arg(long)]
    format: Option<Encoding>,

    /// Generation mode (random or manual).
    #[arg(long, default_value = "random")]
    mode: Mode,

    /// Target every machine instead of the selected one.
    #[arg(long)]
    all: bool,

    /// Machine to select initially.
    #[arg(long, value_name = "ID")]
    select: Option<String>,

    /// Start generating once the machine list has arrived.
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foundry_sim=info,foundry_simulator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = SimulatorConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = args.url {
        config.server_url = url;
    }
    if let Some(format) = args.format {
        config.format = format;
    }

    let mut initial = ControlState::new(args.mode);
    initial.set_target_all(args.all);
    if let Some(id) = args.select {
        initial.select(id);
    }
    let controls = initial.shared();

    info!(url = %config.server_url, format = %config.format, "Starting simulator");

    let cancel = CancellationToken::new();
    let (server, link_task) = link::spawn(
        WebSocketConfig::new(config.server_url.clone()).with_encoding(config.format),
        config.reconnect.clone(),
        Arc::clone(&controls),
        cancel.clone(),
    );

    let mut sim = Simulator::new(Arc::new(server), Arc::clone(&controls))
        .with_interval(config.tick_interval())
        .with_params(config.generator_params());

    if args.autostart {
        if wait_for_machines(&controls, AUTOSTART_TIMEOUT).await {
            if let Err(e) = sim.start().await {
                error!(error = %e, "Autostart failed");
            }
        } else {
            warn!("No machine list received, not starting");
        }
    }

    eprintln!("{}", console::HELP);

    let interrupted = tokio::select! {
        result = console::run(&mut sim, BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            result.context("Console failed")?;
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            true
        }
    };

    if let Err(e) = sim.stop().await {
        error!(error = %e, "Failed to stop simulation cleanly");
    }

    cancel.cancel();
    if let Err(e) = link_task.await {
        error!("Server link task failed: {}", e);
    }

    if interrupted {
        // A pending stdin read would otherwise hold runtime shutdown.
        std::process::exit(0);
    }
    Ok(())
}

async fn wait_for_machines(controls: &SharedControls, timeout: Duration) -> bool {
    let poll = async {
        while controls.read().await.targets().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}
