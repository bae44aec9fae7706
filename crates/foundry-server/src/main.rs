//! # Foundry Server
//!
//! Realtime hub for industrial machine telemetry.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! foundry
//!
//! # Run with custom config
//! foundry --config /path/to/foundry.toml
//!
//! # Run with environment variables
//! FOUNDRY_PORT=8080 FOUNDRY_HOST=0.0.0.0 foundry
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "foundry", version, about = "Realtime machine telemetry hub")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foundry=debug,foundry_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!("Starting Foundry server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
