//! # Delivery Engine Service
//!
//! Runs the delivery engine in-process against an in-memory store and a
//! simulated client, for soak testing and configuration checks.
//!
//! - `check` loads and validates the configuration and prints the result
//! - `soak` publishes a batch of messages through one channel and consumes
//!   them on another, acknowledging or requeuing each delivery

mod connection;
mod soak;

use anyhow::Context;
use clap::{Parser, Subcommand};
use delivery_engine::{telemetry, DeliveryConfig};
use std::path::PathBuf;
use tracing::{error, info};

// ============================================================================
// CLI Structure
// ============================================================================

/// Delivery engine soak service
#[derive(Parser)]
#[command(name = "delivery-engine-service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the delivery engine against an in-memory broker")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DELIVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Logging level, overriding the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print it
    Check,

    /// Publish and consume a batch of messages
    Soak(soak::SoakArgs),
}

fn load_config(cli: &Cli) -> anyhow::Result<DeliveryConfig> {
    let mut config =
        DeliveryConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json_format = true;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    telemetry::init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting delivery engine service");

    let result = match cli.command {
        Commands::Check => {
            println!("{:#?}", config);
            Ok(())
        }
        Commands::Soak(args) => soak::run(&config, args).await.map(|report| report.log()),
    };

    if let Err(e) = &result {
        error!(error = %e, "Service failed");
    }
    result
}
