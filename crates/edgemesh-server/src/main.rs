//! edgemesh-server - edgemesh tunnel server
//!
//! Publishes the relay's public address and serves circuit relay requests
//! until interrupted.

use clap::Parser;
use edgemesh_server::{init_logging, Config};
use edgemesh_tunnel::{AddressDirectory, EstablishError, Establisher, FileBackend, FileCertManager};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config.log_format);

    info!("edgemesh-server v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }
    if config.public_ip.is_none() {
        warn!("No --public-ip given; agents outside this network will not reach the relay");
    }

    let backend = match FileBackend::open(&config.directory) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to open directory {}: {}", config.directory.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let directory = Arc::new(AddressDirectory::new(backend));
    let certs = Arc::new(FileCertManager::new(config.certificate()));
    let cancel = CancellationToken::new();
    let establisher = Establisher::new(config.tunnel_config(), directory, certs, cancel.clone());

    let signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal.cancel();
    });

    let node = match establisher.bring_up().await {
        Ok(node) => node,
        Err(EstablishError::Cancelled) => return ExitCode::SUCCESS,
        Err(e) => {
            error!("Tunnel bring-up failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Relay ready as {} at {:?}", node.host.peer_id(), node.published);

    let stats_host = node.host.clone();
    let stats_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stats_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(stats) = stats_host.relay_stats() {
                        info!(
                            "Relay: {} reservations, {} circuits active, {} opened, {} refused, {} bytes",
                            stats.active_reservations,
                            stats.active_circuits,
                            stats.circuits_opened,
                            stats.circuits_refused,
                            stats.bytes_relayed
                        );
                    }
                }
            }
        }
    });

    if let Err(e) = establisher.serve(&node).await {
        error!("Tunnel error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
