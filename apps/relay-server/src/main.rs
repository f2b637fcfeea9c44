//! Caption Relay Server - standalone binary for the live-captioning relay.
//!
//! Ingests an RTMP source, transcodes it for an ASR uplink, and relays the
//! ASR's captions to downlink WebSocket subscribers. Runs as a background
//! daemon with no UI.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::bootstrap::bootstrap;
use tokio::signal;

use crate::config::RelayConfig;

/// Caption Relay Server - headless RTMP-to-captions relay.
#[derive(Parser, Debug)]
#[command(name = "caption-relay-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "RELAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Log forwarded captions instead of broadcasting them to subscribers.
    #[arg(long, env = "RELAY_DEBUG")]
    debug: bool,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "RELAY_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Caption Relay Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    log::info!(
        "Configuration: rtmp_url={}, asr_url={}, bind={}:{}",
        config.rtmp_url,
        config.asr_url,
        config.bind_ip,
        config.bind_port
    );

    let handle = bootstrap(config.to_bootstrap_config(args.debug))
        .context("Failed to bootstrap relay")?;

    log::info!("Relay bootstrapped successfully");

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    handle.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
