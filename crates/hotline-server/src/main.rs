//! Hotline server daemon.
//!
//! Binds the main protocol port and the file-transfer port, loads
//! persisted state from the data directory, and serves until
//! interrupted.

use anyhow::Result;
use clap::Parser;
use hotline_core::server::{Config, HotlineServer};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Hotline server
#[derive(Parser)]
#[command(name = "hotline-server")]
#[command(author, version, about)]
struct Args {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Main protocol port (the transfer port is the next one up)
    #[arg(short, long, default_value = "5500")]
    port: u16,

    /// Server name shown to clients
    #[arg(short, long, default_value = "Hotline Server")]
    name: String,

    /// Data directory (accounts, news, agreement)
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Root of the served file tree
    #[arg(short, long, default_value = "Files")]
    file_root: PathBuf,

    /// Maximum concurrent users
    #[arg(long, default_value = "100")]
    max_users: usize,

    /// Seconds before an inactive user is flagged away
    #[arg(long, default_value = "600")]
    idle_threshold: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config {
        name: args.name,
        bind_addr: args.bind,
        port: args.port,
        file_root: args.file_root,
        data_dir: args.data_dir,
        max_users: args.max_users,
        idle_threshold_secs: args.idle_threshold,
        ..Config::default()
    };

    let server = HotlineServer::bootstrap(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}
