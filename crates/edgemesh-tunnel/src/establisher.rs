//! Connectivity bring-up
//!
//! Drives a node from nothing to a published, reachable peer:
//!
//! ```text
//! Init -> ResolveRelay -> BuildHost -> WaitForRelayCircuit -> PublishSelf -> Ready
//! ```
//!
//! Servers skip relay resolution and the relay wait. Every failure before
//! `Ready` is fatal to the process; once `Ready`, the node keeps its directory
//! record current until cancelled.

use crate::cert::{CertError, CertEvent, CertManager};
use crate::config::{ConfigError, Role, TunnelConfig};
use crate::directory::{AddressDirectory, DirectoryBackend, DirectoryError, SetOutcome};
use crate::proxy::ProxyService;
use edgemesh_tunnel_core::{Multiaddr, MultiaddrExt, PeerAddrInfo, PeerId};
use edgemesh_tunnel_net::backoff::Backoff;
use edgemesh_tunnel_net::{Host, HostConfig, HostError, KeyPair, Reachability};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bring-up errors
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to obtain identity: {0}")]
    Identity(#[from] CertError),
    #[error("Failed to resolve relay {name}: {source}")]
    RelayResolution {
        name: String,
        #[source]
        source: DirectoryError,
    },
    #[error("Failed to build host: {0}")]
    BuildHost(#[source] HostError),
    #[error("Failed to publish addresses: {0}")]
    Publish(#[source] DirectoryError),
    #[error("Cancelled")]
    Cancelled,
}

/// Bring-up phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    ResolveRelay,
    BuildHost,
    WaitForRelayCircuit,
    PublishSelf,
    Ready,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::ResolveRelay => "resolve-relay",
            Phase::BuildHost => "build-host",
            Phase::WaitForRelayCircuit => "wait-for-relay-circuit",
            Phase::PublishSelf => "publish-self",
            Phase::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Anything that can report a node's current addresses
pub trait AddrSource {
    fn addrs(&self) -> Vec<Multiaddr>;
}

impl AddrSource for Host {
    fn addrs(&self) -> Vec<Multiaddr> {
        Host::addrs(self)
    }
}

/// Poll `source` every `interval` until it reports a relay-circuit address
///
/// Sleeps before every check, so the first inspection happens one interval
/// after the call. Returns the address set that contained the circuit.
pub async fn wait_for_relay_circuit<S: AddrSource + ?Sized>(
    source: &S,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<Multiaddr>, EstablishError> {
    let mut polls = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(EstablishError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
        polls += 1;

        let addrs = source.addrs();
        if addrs.iter().any(|a| a.is_relayed()) {
            info!("Relay circuit address available after {} poll(s)", polls);
            return Ok(addrs);
        }
        debug!("No relay circuit address yet (poll {})", polls);
    }
}

/// A node that completed bring-up
pub struct MeshNode<B> {
    pub host: Host,
    /// Present on agents
    pub proxy: Option<Arc<ProxyService<B>>>,
    /// Addresses written to the directory during bring-up
    pub published: Vec<Multiaddr>,
}

/// Connectivity establisher for one node
pub struct Establisher<B, C> {
    config: TunnelConfig,
    directory: Arc<AddressDirectory<B>>,
    certs: Arc<C>,
    cancel: CancellationToken,
    phase: Mutex<Phase>,
}

impl<B: DirectoryBackend, C: CertManager> Establisher<B, C> {
    pub fn new(
        config: TunnelConfig,
        directory: Arc<AddressDirectory<B>>,
        certs: Arc<C>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            directory,
            certs,
            cancel,
            phase: Mutex::new(Phase::Init),
        }
    }

    /// Phase reached so far
    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    fn enter(&self, phase: Phase) {
        let mut current = self.phase.lock();
        info!(node = %self.config.node_name, "Tunnel phase {} -> {}", *current, phase);
        *current = phase;
    }

    /// Bring-up then serve until cancelled
    pub async fn run(&self) -> Result<(), EstablishError> {
        let node = self.bring_up().await?;
        self.serve(&node).await
    }

    /// Run every phase up to `Ready`
    pub async fn bring_up(&self) -> Result<MeshNode<B>, EstablishError> {
        self.config.validate()?;
        self.enter(Phase::Init);
        self.certs.start()?;
        let keypair = self.certs.private_key(&self.config.node_name)?;
        info!("Tunnel identity {}", keypair.peer_id());

        let relay = match self.config.role {
            Role::Agent { .. } => {
                self.enter(Phase::ResolveRelay);
                Some(self.resolve_relay().await?)
            }
            Role::Server { .. } => None,
        };

        self.enter(Phase::BuildHost);
        let host = Host::new(keypair, self.host_config(relay))
            .await
            .map_err(EstablishError::BuildHost)?;

        let result = self.finish_bring_up(&host).await;
        if result.is_err() {
            host.close();
        }
        result
    }

    async fn finish_bring_up(&self, host: &Host) -> Result<MeshNode<B>, EstablishError> {
        if !self.config.is_server() {
            self.enter(Phase::WaitForRelayCircuit);
            wait_for_relay_circuit(host, self.config.relay_poll_interval, &self.cancel).await?;
        }

        self.enter(Phase::PublishSelf);
        let published = self.publish_addrs(host);
        self.publish(host.peer_id(), &published).await?;

        let proxy = match self.config.role {
            Role::Agent { .. } => {
                let proxy = ProxyService::new(host.clone(), self.directory.clone(), &self.config.node_name);
                proxy.register();
                Some(proxy)
            }
            Role::Server { .. } => None,
        };

        self.enter(Phase::Ready);
        Ok(MeshNode {
            host: host.clone(),
            proxy,
            published,
        })
    }

    /// Keep the record current until cancelled, then shut the host down
    pub async fn serve(&self, node: &MeshNode<B>) -> Result<(), EstablishError> {
        let mut cert_events = self.certs.subscribe();
        let mut cert_events_open = true;
        let republish = !self.config.republish_interval.is_zero();
        let mut ticker = tokio::time::interval(if republish {
            self.config.republish_interval
        } else {
            Duration::from_secs(3600)
        });
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick(), if republish => {
                    let addrs = self.publish_addrs(&node.host);
                    if let Err(e) = self.directory.set(self.config.publish_name(), node.host.peer_id(), &addrs).await {
                        warn!("Republish failed: {}", e);
                    }
                }
                event = cert_events.recv(), if cert_events_open => match event {
                    Ok(CertEvent::Rotated { path }) => {
                        // identity stays bound to the key read at startup
                        warn!(
                            "Certificate key {} rotated; tunnel identity is not re-derived until restart",
                            path.display()
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => debug!("Missed {} certificate events", n),
                    Err(broadcast::error::RecvError::Closed) => cert_events_open = false,
                },
            }
        }

        info!("Tunnel shutting down");
        if let Some(proxy) = &node.proxy {
            proxy.unregister();
        }
        node.host.close();
        Ok(())
    }

    async fn resolve_relay(&self) -> Result<PeerAddrInfo, EstablishError> {
        let name = &self.config.relay_name;
        match self.directory.get(name).await {
            Ok(relay) => {
                info!("Resolved relay {} as {} ({} address(es))", name, relay.id, relay.addrs.len());
                Ok(relay)
            }
            Err(source) => {
                error!("Relay {} is not resolvable; is the server running? ({})", name, source);
                Err(EstablishError::RelayResolution {
                    name: name.clone(),
                    source,
                })
            }
        }
    }

    fn host_config(&self, relay: Option<PeerAddrInfo>) -> HostConfig {
        let listen_addrs = vec![self.config.listen_addr()];
        match &self.config.role {
            Role::Agent {
                enable_hole_punching,
            } => HostConfig {
                listen_addrs,
                static_relays: relay.into_iter().collect(),
                enable_auto_relay: true,
                enable_hole_punching: *enable_hole_punching,
                reachability: Reachability::Private,
                ..Default::default()
            },
            Role::Server { limits, .. } => HostConfig {
                listen_addrs,
                announce_addrs: self.server_public_addrs(),
                enable_relay_service: true,
                reachability: Reachability::Public,
                relay_limits: limits.clone(),
                ..Default::default()
            },
        }
    }

    fn server_public_addrs(&self) -> Vec<Multiaddr> {
        match self.config.role {
            Role::Server {
                public_ip: Some(ip),
                public_port,
                ..
            } => {
                let port = public_port.unwrap_or(self.config.listen_port);
                vec![Multiaddr::from_socket_addr(SocketAddr::new(ip, port))]
            }
            _ => Vec::new(),
        }
    }

    fn publish_addrs(&self, host: &Host) -> Vec<Multiaddr> {
        if self.config.is_server() {
            let public = self.server_public_addrs();
            if !public.is_empty() {
                return public;
            }
            warn!("No public IP configured; publishing the host's own addresses");
        }
        host.addrs()
    }

    /// Write our record, retrying transient failures until cancelled
    async fn publish(&self, peer: PeerId, addrs: &[Multiaddr]) -> Result<SetOutcome, EstablishError> {
        let name = self.config.publish_name();
        let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(10));
        loop {
            match self.directory.set(name, peer, addrs).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!("Publishing {} failed ({}), retrying in {:?}", name, e, delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EstablishError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(EstablishError::Publish(e)),
            }
        }
    }
}
