//! edgemesh-agent - edgemesh tunnel agent
//!
//! Brings the node's tunnel up through the tunnel server and serves proxied
//! streams until interrupted.

use clap::Parser;
use edgemesh_agent::{init_logging, Config};
use edgemesh_tunnel::{AddressDirectory, EstablishError, Establisher, FileBackend, FileCertManager};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config.log_format);

    info!("edgemesh-agent v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }
    if !config.enable {
        info!("Tunnel module disabled");
        return ExitCode::SUCCESS;
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
    info!("Tunnel ready as {} at {:?}", node.host.peer_id(), node.published);

    if let Some(proxy) = &node.proxy {
        for rule in &config.forward {
            let listener = match TcpListener::bind(rule.local).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind forward {}: {}", rule, e);
                    node.host.close();
                    return ExitCode::FAILURE;
                }
            };
            tokio::spawn(proxy.clone().serve(
                listener,
                rule.node.clone(),
                rule.target.clone(),
                cancel.clone(),
            ));
        }
    }

    if let Err(e) = establisher.serve(&node).await {
        error!("Tunnel error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
