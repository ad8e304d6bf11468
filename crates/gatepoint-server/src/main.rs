//! gatepoint: collector gateway daemon.
//!
//! Starts the points enabled in the config file, links them, and runs until
//! SIGINT or SIGTERM.

use clap::Parser;
use gatepoint_server::{GatewayServer, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// gatepoint: TCP collector gateway
#[derive(Parser, Debug)]
#[command(name = "gatepoint", version, about = "TCP collector gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.gatepoint/config.toml")]
    config: String,

    /// Override the framed point's listen port
    #[arg(long)]
    framed_port: Option<u16>,

    /// Override the name-registration point's listen port
    #[arg(long)]
    registration_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting gatepoint");

    // Load config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.framed_port,
        cli.registration_port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let mut server = match GatewayServer::new(&config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build gateway points");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.start_all().await {
        error!(error = %e, "failed to start gateway points");
        server.stop_all().await;
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    server.stop_all().await;
    info!("gatepoint stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
