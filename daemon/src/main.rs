//! Easel Daemon
//!
//! The server-side component that orders, persists and fans out every canvas
//! mutation, tracks presence, and serves media over HTTP.

use anyhow::Result;
use clap::Parser;
use easel_daemon::config::DaemonConfig;
use easel_daemon::server;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Easel Daemon - collaborative canvas server
#[derive(Parser, Debug)]
#[command(name = "easeld")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, default_value = "/etc/easel/easeld.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Easel Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; a missing file falls back to defaults so a bare
    // `easeld` run works out of the box.
    let config = match DaemonConfig::load(&args.config).await {
        Ok(config) => {
            info!("Loaded configuration from {}", args.config);
            config
        }
        Err(e) => {
            warn!("Could not read {} ({e}), using defaults", args.config);
            DaemonConfig::default()
        }
    };

    let handle = server::start(config).await?;

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;

    Ok(())
}
