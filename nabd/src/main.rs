//! nabd - Main Entry Point
//!
//! The resident rabbit daemon: loads configuration, wires the hardware
//! backend, scheduler, sensor dispatcher and TCP front-end, then waits for
//! a shutdown packet or a termination signal.

use std::env;
use std::sync::Arc;

use nabd::config::{ConfigManager, DEFAULT_CONFIG_PATH};
use nabd::{Daemon, ShutdownMode};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).cloned().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config_manager = Arc::new(ConfigManager::new(&config_path).await?);
    let config = config_manager.get().await;

    // Initialize logging
    let level: tracing::Level = config.daemon.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("starting nabd v{}", env!("CARGO_PKG_VERSION"));

    let mut daemon = Daemon::start(Arc::clone(&config_manager)).await?;
    info!("daemon listening on {}", daemon.addr);
    if let Some(view_addr) = daemon.view_addr {
        info!("virtual rabbit view on {}", view_addr);
    }

    // Wait for a shutdown packet or a termination signal
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let mode = tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down gracefully");
            None
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down gracefully");
            None
        }
        mode = daemon.shutdown_rx.recv() => mode,
    };

    daemon.stop().await;

    match mode {
        Some(ShutdownMode::Halt) => {
            info!("shutdown complete, halting system");
            if let Err(e) = system_power("poweroff").await {
                error!("halt failed: {}", e);
            }
        }
        Some(ShutdownMode::Reboot) => {
            info!("shutdown complete, rebooting system");
            if let Err(e) = system_power("reboot").await {
                error!("reboot failed: {}", e);
            }
        }
        None => info!("nabd shutdown complete"),
    }

    Ok(())
}

/// Hand power control to systemd. On development machines this simply
/// fails and the daemon exits normally.
async fn system_power(verb: &str) -> std::io::Result<()> {
    let status = tokio::process::Command::new("systemctl").arg(verb).status().await?;
    if !status.success() {
        warn!("systemctl {} exited with {}", verb, status);
    }
    Ok(())
}
