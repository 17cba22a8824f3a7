//! The peer-to-peer host
//!
//! A [`Host`] owns the identity key, the TCP listeners and every connection
//! to other peers. It dials peers directly when it can, falls back to
//! relay-circuit addresses otherwise, keeps reservations with static relays
//! when configured for auto relay, and upgrades relayed connections to direct
//! ones through hole punching.

use crate::crypto::KeyPair;
use crate::holepunch;
use crate::mux::{Connection, ConnectionInfo, Direction, MuxError, Protocols, Stream};
use crate::relay::{self, RelayError, RelayLimits, RelayService, RelayStats};
use crate::secure::{handshake_with_timeout, SecureError, HANDSHAKE_TIMEOUT};
use edgemesh_tunnel_core::{Multiaddr, MultiaddrExt, PeerAddrInfo, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observed addresses remembered per host
const MAX_OBSERVED_ADDRS: usize = 8;

/// How the host presents itself to the network
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reachability {
    #[default]
    Unknown,
    /// Directly dialable; observed addresses are advertised
    Public,
    /// Behind NAT; only listen and relay-circuit addresses are advertised
    Private,
}

/// Host configuration
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Local addresses to listen on
    pub listen_addrs: Vec<SocketAddr>,
    /// Addresses advertised instead of the listen addresses
    pub announce_addrs: Vec<Multiaddr>,
    /// Relays to keep reservations with
    pub static_relays: Vec<PeerAddrInfo>,
    pub enable_auto_relay: bool,
    /// Serve as a circuit relay for other peers
    pub enable_relay_service: bool,
    pub enable_hole_punching: bool,
    pub reachability: Reachability,
    pub relay_limits: RelayLimits,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            announce_addrs: Vec::new(),
            static_relays: Vec::new(),
            enable_auto_relay: false,
            enable_relay_service: false,
            enable_hole_punching: false,
            reachability: Reachability::Unknown,
            relay_limits: RelayLimits::default(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Host errors
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Handshake failed: {0}")]
    Secure(#[from] SecureError),
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("No usable address for peer {0:?}")]
    NoAddresses(PeerId),
    #[error("Unsupported address {0}")]
    UnsupportedAddress(Multiaddr),
    #[error("Dial to {0} timed out")]
    DialTimeout(Multiaddr),
    #[error("Refusing to dial self")]
    SelfDial,
    #[error("Host is shut down")]
    Shutdown,
}

struct HostInner {
    keypair: KeyPair,
    peer_id: PeerId,
    config: HostConfig,
    listen_addrs: Vec<SocketAddr>,
    /// Our address as reported by remote peers
    observed_addrs: RwLock<Vec<Multiaddr>>,
    /// Local interface addresses learned from outbound connections
    interface_addrs: RwLock<Vec<Multiaddr>>,
    /// Circuit addresses per relay we hold a reservation with
    relay_addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    connections: RwLock<HashMap<PeerId, Vec<Connection>>>,
    peerstore: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    dial_locks: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    protocols: Arc<Protocols>,
    relay_service: Option<Arc<RelayService>>,
    port_claims: Mutex<Vec<PortClaim>>,
    cancel: CancellationToken,
}

/// Cloneable handle to the process' host
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

/// Non-owning handle held by background tasks and protocol handlers
#[derive(Clone)]
pub struct WeakHost {
    inner: Weak<HostInner>,
}

impl WeakHost {
    pub fn upgrade(&self) -> Option<Host> {
        self.inner.upgrade().map(|inner| Host { inner })
    }
}

impl Host {
    /// Bind the listeners and start the host's background tasks
    pub async fn new(keypair: KeyPair, config: HostConfig) -> Result<Self, HostError> {
        let mut listeners = Vec::new();
        let mut listen_addrs = Vec::new();
        let mut port_claims: Vec<PortClaim> = Vec::new();
        for addr in &config.listen_addrs {
            let bind_err = |source: io::Error| HostError::Bind { addr: *addr, source };
            // a fixed port is claimed before binding, an ephemeral one after
            if addr.port() != 0 && !port_claims.iter().any(|c| c.port == addr.port()) {
                port_claims.push(PortClaim::acquire(addr.port()).map_err(bind_err)?);
            }
            let listener = bind_listener(*addr).map_err(bind_err)?;
            let local = listener.local_addr()?;
            if !port_claims.iter().any(|c| c.port == local.port()) {
                port_claims.push(PortClaim::acquire(local.port()).map_err(bind_err)?);
            }
            listen_addrs.push(local);
            listeners.push(listener);
        }

        let relay_service = config
            .enable_relay_service
            .then(|| Arc::new(RelayService::new(config.relay_limits.clone())));

        let peer_id = keypair.peer_id();
        let host = Self {
            inner: Arc::new(HostInner {
                keypair,
                peer_id,
                config,
                listen_addrs,
                observed_addrs: RwLock::new(Vec::new()),
                interface_addrs: RwLock::new(Vec::new()),
                relay_addrs: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                peerstore: RwLock::new(HashMap::new()),
                dial_locks: Mutex::new(HashMap::new()),
                protocols: Arc::new(Protocols::new()),
                relay_service,
                port_claims: Mutex::new(port_claims),
                cancel: CancellationToken::new(),
            }),
        };

        for listener in listeners {
            tokio::spawn(accept_loop(host.downgrade(), listener, host.inner.cancel.clone()));
        }
        host.register_builtin_protocols();

        if host.inner.config.enable_auto_relay {
            for relay in host.inner.config.static_relays.clone() {
                tokio::spawn(relay::maintain_reservation(
                    host.downgrade(),
                    relay,
                    host.inner.cancel.clone(),
                ));
            }
        }

        info!(
            "Host {} listening on {:?} (reachability {:?})",
            peer_id.short(),
            host.inner.listen_addrs,
            host.inner.config.reachability
        );
        Ok(host)
    }

    fn register_builtin_protocols(&self) {
        let weak = self.downgrade();
        self.inner.protocols.register(relay::STOP_PROTOCOL, move |stream| {
            let weak = weak.clone();
            async move {
                if let Some(host) = weak.upgrade() {
                    host.accept_relayed(stream).await;
                }
            }
        });

        if let Some(service) = self.inner.relay_service.clone() {
            let weak = self.downgrade();
            self.inner.protocols.register(relay::HOP_PROTOCOL, move |stream| {
                let weak = weak.clone();
                let service = service.clone();
                async move {
                    if let Some(host) = weak.upgrade() {
                        service.handle_hop(&host, stream).await;
                    }
                }
            });
        }

        if self.inner.config.enable_hole_punching {
            let weak = self.downgrade();
            self.inner.protocols.register(holepunch::PROTOCOL, move |stream| {
                let weak = weak.clone();
                async move {
                    if let Some(host) = weak.upgrade() {
                        holepunch::handle_inbound(host, stream).await;
                    }
                }
            });
        }
    }

    pub fn downgrade(&self) -> WeakHost {
        WeakHost {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Addresses the listeners are actually bound to
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listen_addrs.clone()
    }

    /// Addresses other peers can use to reach this host
    ///
    /// Announce addresses (or concrete listen addresses), observed addresses
    /// unless the host is private, then relay-circuit addresses.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let mut out: Vec<Multiaddr> = if self.inner.config.announce_addrs.is_empty() {
            self.inner
                .listen_addrs
                .iter()
                .filter(|a| !a.ip().is_unspecified())
                .map(|a| Multiaddr::from_socket_addr(*a))
                .chain(self.inner.interface_addrs.read().iter().cloned())
                .collect()
        } else {
            self.inner.config.announce_addrs.clone()
        };

        if self.inner.config.reachability != Reachability::Private {
            out.extend(self.observed_addrs());
        }
        for addrs in self.inner.relay_addrs.read().values() {
            out.extend(addrs.iter().cloned());
        }

        dedup(out)
    }

    /// Our address as seen by connected peers
    pub fn observed_addrs(&self) -> Vec<Multiaddr> {
        self.inner.observed_addrs.read().clone()
    }

    /// Direct addresses offered to a peer during hole punching
    pub fn hole_punch_addrs(&self) -> Vec<Multiaddr> {
        let listen = self
            .inner
            .listen_addrs
            .iter()
            .filter(|a| !a.ip().is_unspecified())
            .map(|a| Multiaddr::from_socket_addr(*a));
        let addrs: Vec<Multiaddr> = self
            .observed_addrs()
            .into_iter()
            .chain(self.inner.interface_addrs.read().iter().cloned())
            .chain(listen)
            .filter(|a| !a.is_relayed())
            .collect();
        dedup(addrs)
    }

    pub(crate) fn record_observed(&self, addr: Multiaddr) {
        let Some(socket) = addr.socket_addr() else { return };
        if addr.is_relayed() || socket.ip().is_unspecified() {
            return;
        }
        let mut observed = self.inner.observed_addrs.write();
        if observed.contains(&addr) {
            return;
        }
        debug!("Observed address {}", addr);
        observed.push(addr);
        if observed.len() > MAX_OBSERVED_ADDRS {
            observed.remove(0);
        }
    }

    /// Replace the circuit addresses obtained through `relay`; true if new
    pub(crate) fn set_relay_addrs(&self, relay: PeerId, addrs: Vec<Multiaddr>) -> bool {
        self.inner.relay_addrs.write().insert(relay, addrs).is_none()
    }

    pub(crate) fn clear_relay_addrs(&self, relay: &PeerId) {
        self.inner.relay_addrs.write().remove(relay);
    }

    /// Remember addresses for a peer
    pub fn add_addrs(&self, peer: PeerId, addrs: &[Multiaddr]) {
        let mut store = self.inner.peerstore.write();
        let known = store.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    /// Known addresses for a peer
    pub fn peer_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner.peerstore.read().get(peer).cloned().unwrap_or_default()
    }

    /// Register the handler for inbound streams of `protocol`
    pub fn set_stream_handler<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.protocols.register(protocol, handler);
    }

    pub fn remove_stream_handler(&self, protocol: &str) -> bool {
        self.inner.protocols.remove(protocol)
    }

    /// Open connections to a peer
    pub fn connections(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner
            .connections
            .read()
            .get(peer)
            .map(|conns| conns.iter().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        !self.connections(peer).is_empty()
    }

    pub fn has_direct_connection(&self, peer: &PeerId) -> bool {
        self.direct_connection(peer).is_some()
    }

    /// Number of peers with at least one open connection
    pub fn peer_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub(crate) fn direct_connection(&self, peer: &PeerId) -> Option<Connection> {
        self.connections(peer).into_iter().find(|c| !c.is_relayed())
    }

    fn best_connection(&self, peer: &PeerId) -> Option<Connection> {
        let conns = self.connections(peer);
        conns
            .iter()
            .find(|c| !c.is_relayed())
            .or_else(|| conns.first())
            .cloned()
    }

    /// Relay service counters when this host relays for others
    pub fn relay_stats(&self) -> Option<RelayStats> {
        self.inner.relay_service.as_ref().map(|s| s.stats())
    }

    /// Connect to a peer, reusing an open connection when there is one
    ///
    /// Direct addresses are tried first, then relay-circuit addresses.
    pub async fn connect(&self, peer: &PeerAddrInfo) -> Result<Connection, HostError> {
        let result = self.try_connect(peer).await;
        if result.is_err() {
            self.prune_peer(&peer.id);
        }
        result
    }

    async fn try_connect(&self, peer: &PeerAddrInfo) -> Result<Connection, HostError> {
        if self.inner.cancel.is_cancelled() {
            return Err(HostError::Shutdown);
        }
        if peer.id == self.inner.peer_id {
            return Err(HostError::SelfDial);
        }

        self.add_addrs(peer.id, &peer.addrs);
        if let Some(conn) = self.best_connection(&peer.id) {
            return Ok(conn);
        }

        let addrs = self.peer_addrs(&peer.id);
        let (relayed, direct): (Vec<Multiaddr>, Vec<Multiaddr>) =
            addrs.into_iter().partition(|a| a.is_relayed());

        let mut last_err = None;
        if !direct.is_empty() {
            match self.connect_direct(&PeerAddrInfo::new(peer.id, direct)).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }

        let lock = self.dial_lock(peer.id);
        let _guard = lock.lock().await;
        if let Some(conn) = self.best_connection(&peer.id) {
            return Ok(conn);
        }
        for addr in &relayed {
            match self.dial_relayed(addr, peer.id).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Relayed dial {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(HostError::NoAddresses(peer.id)))
    }

    /// Connect using only direct addresses
    pub(crate) async fn connect_direct(&self, peer: &PeerAddrInfo) -> Result<Connection, HostError> {
        if peer.id == self.inner.peer_id {
            return Err(HostError::SelfDial);
        }
        self.add_addrs(peer.id, &peer.addrs);
        if let Some(conn) = self.direct_connection(&peer.id) {
            return Ok(conn);
        }

        let lock = self.dial_lock(peer.id);
        let _guard = lock.lock().await;
        if let Some(conn) = self.direct_connection(&peer.id) {
            return Ok(conn);
        }

        let mut last_err = None;
        for addr in peer.direct_addrs() {
            match self.dial_direct(addr, peer.id).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Dial {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(HostError::NoAddresses(peer.id)))
    }

    /// Open a stream to a peer, connecting first if needed
    pub async fn new_stream(&self, peer: &PeerAddrInfo, protocol: &str) -> Result<Stream, HostError> {
        let conn = self.connect(peer).await?;
        match conn.open_stream(protocol).await {
            Err(MuxError::ConnectionClosed) => {
                self.forget(&conn);
                let conn = self.connect(peer).await?;
                Ok(conn.open_stream(protocol).await?)
            }
            other => Ok(other?),
        }
    }

    /// Shut down listeners, background tasks and every connection
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let conns: Vec<Connection> = self
            .inner
            .connections
            .write()
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect();
        for conn in conns {
            conn.close();
        }
        self.inner.port_claims.lock().clear();
        info!("Host {} closed", self.inner.peer_id.short());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn dial_lock(&self, peer: PeerId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.dial_locks.lock().entry(peer).or_default().clone()
    }

    /// Dial one direct address, bypassing existing connections
    pub(crate) async fn dial_direct(&self, addr: &Multiaddr, expected: PeerId) -> Result<Connection, HostError> {
        let Some(target) = addr.socket_addr() else {
            return Err(HostError::UnsupportedAddress(addr.clone()));
        };
        let tcp = tokio::time::timeout(self.inner.config.dial_timeout, self.dial_tcp(target))
            .await
            .map_err(|_| HostError::DialTimeout(addr.clone()))??;
        self.upgrade_tcp(tcp, target, Direction::Outbound, Some(expected))
            .await
    }

    async fn dial_relayed(&self, addr: &Multiaddr, dst: PeerId) -> Result<Connection, HostError> {
        let Some((relay_addr, relay_id)) = addr.relay() else {
            return Err(HostError::UnsupportedAddress(addr.clone()));
        };
        if relay_id == dst || relay_id == self.inner.peer_id {
            return Err(HostError::UnsupportedAddress(addr.clone()));
        }

        let relay_conn = self
            .connect_direct(&PeerAddrInfo::new(relay_id, vec![relay_addr]))
            .await?;
        let mut stream = relay::connect_via(&relay_conn, dst).await?;
        let secured = handshake_with_timeout(
            &mut stream,
            &self.inner.keypair,
            Some(dst),
            None,
            self.inner.config.handshake_timeout,
        )
        .await?;

        let info = ConnectionInfo {
            remote_peer: dst,
            remote_addr: Some(addr.clone()),
            direction: Direction::Outbound,
            relayed: true,
        };
        Ok(self.register(Connection::new(
            stream,
            secured.session,
            info,
            self.inner.peer_id,
            self.inner.protocols.clone(),
        )))
    }

    /// Inbound half of a relayed connection, delivered on the stop protocol
    async fn accept_relayed(&self, mut stream: Stream) {
        let relay = stream.remote_peer();
        let src = match relay::accept_stop(&mut stream).await {
            Ok(src) => src,
            Err(e) => {
                debug!("Rejected relayed connection via {}: {}", relay.short(), e);
                return;
            }
        };

        let secured = match handshake_with_timeout(
            &mut stream,
            &self.inner.keypair,
            Some(src),
            None,
            self.inner.config.handshake_timeout,
        )
        .await
        {
            Ok(secured) => secured,
            Err(e) => {
                warn!("Relayed handshake with {} failed: {}", src.short(), e);
                return;
            }
        };

        let remote_addr = stream
            .remote_addr()
            .and_then(|a| Multiaddr::circuit_via(a, relay).ok());
        let info = ConnectionInfo {
            remote_peer: src,
            remote_addr,
            direction: Direction::Inbound,
            relayed: true,
        };
        let conn = self.register(Connection::new(
            stream,
            secured.session,
            info,
            self.inner.peer_id,
            self.inner.protocols.clone(),
        ));

        if self.inner.config.enable_hole_punching {
            tokio::spawn(holepunch::initiate(self.clone(), conn));
        }
    }

    async fn dial_tcp(&self, target: SocketAddr) -> io::Result<TcpStream> {
        // Dial from the listen port so NATs map outbound and inbound traffic alike
        let local = self.inner.listen_addrs.iter().find(|l| {
            l.is_ipv4() == target.is_ipv4()
                && (l.ip().is_unspecified() || l.ip().is_loopback() == target.ip().is_loopback())
        });
        let Some(local) = local else {
            return TcpStream::connect(target).await;
        };

        let socket = match reuse_socket(*local) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Port reuse unavailable on {}: {}", local, e);
                return TcpStream::connect(target).await;
            }
        };
        match socket.connect(target).await {
            Ok(stream) => Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse
                        | io::ErrorKind::AddrNotAvailable
                        | io::ErrorKind::InvalidInput
                ) =>
            {
                debug!("Port-reuse dial to {} failed ({}), using ephemeral port", target, e);
                TcpStream::connect(target).await
            }
            Err(e) => Err(e),
        }
    }

    async fn upgrade_tcp(
        &self,
        mut tcp: TcpStream,
        remote: SocketAddr,
        direction: Direction,
        expected: Option<PeerId>,
    ) -> Result<Connection, HostError> {
        let _ = tcp.set_nodelay(true);
        let remote_addr = Multiaddr::from_socket_addr(remote);

        let secured = handshake_with_timeout(
            &mut tcp,
            &self.inner.keypair,
            expected,
            Some(remote_addr.clone()),
            self.inner.config.handshake_timeout,
        )
        .await?;

        if let Some(observed) = secured.observed_addr {
            self.record_observed(observed);
        }
        if direction == Direction::Outbound {
            self.record_interface(&tcp);
        }

        let info = ConnectionInfo {
            remote_peer: secured.remote_peer,
            remote_addr: Some(remote_addr),
            direction,
            relayed: false,
        };
        Ok(self.register(Connection::new(
            tcp,
            secured.session,
            info,
            self.inner.peer_id,
            self.inner.protocols.clone(),
        )))
    }

    fn record_interface(&self, tcp: &TcpStream) {
        let Ok(local) = tcp.local_addr() else { return };
        let bound_to_listener = self
            .inner
            .listen_addrs
            .iter()
            .any(|l| l.port() == local.port() && l.ip().is_unspecified());
        if !bound_to_listener || local.ip().is_loopback() {
            return;
        }
        let addr = Multiaddr::from_socket_addr(local);
        let mut interfaces = self.inner.interface_addrs.write();
        if !interfaces.contains(&addr) {
            debug!("Learned interface address {}", addr);
            interfaces.push(addr);
        }
    }

    fn register(&self, conn: Connection) -> Connection {
        let peer = conn.remote_peer();
        self.inner
            .connections
            .write()
            .entry(peer)
            .or_default()
            .push(conn.clone());
        info!(
            "Connected to peer {} ({:?}, relayed: {})",
            peer.short(),
            conn.info().direction,
            conn.is_relayed()
        );

        let weak = self.downgrade();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(host) = weak.upgrade() {
                host.forget(&watched);
            }
        });
        conn
    }

    fn forget(&self, conn: &Connection) {
        let peer = conn.remote_peer();
        let mut conns = self.inner.connections.write();
        let Some(list) = conns.get_mut(&peer) else { return };
        list.retain(|c| c.id() != conn.id());
        if list.is_empty() {
            conns.remove(&peer);
            drop(conns);
            debug!("Disconnected from peer {}", peer.short());
            self.prune_peer(&peer);
        }
    }

    /// Drop the addresses and dial lock of a peer that is neither connected
    /// nor being dialed
    fn prune_peer(&self, peer: &PeerId) {
        if self.inner.connections.read().contains_key(peer) {
            return;
        }
        let mut locks = self.inner.dial_locks.lock();
        if locks.get(peer).is_some_and(|lock| Arc::strong_count(lock) > 1) {
            return;
        }
        locks.remove(peer);
        drop(locks);
        self.inner.peerstore.write().remove(peer);
    }
}

async fn accept_loop(host: WeakHost, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, remote)) => {
                let Some(host) = host.upgrade() else { break };
                tokio::spawn(async move {
                    if let Err(e) = host.upgrade_tcp(tcp, remote, Direction::Inbound, None).await {
                        debug!("Inbound connection from {} failed: {}", remote, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn reuse_socket(local: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(local)?;
    Ok(socket)
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    reuse_socket(addr)?.listen(1024)
}

/// Exclusive hold on a listen port
///
/// Listeners share their port with port-reuse dials, so `SO_REUSEPORT` would
/// let a second host bind it too. An advisory lock file per port rules that
/// out; it is released when the claim drops.
struct PortClaim {
    port: u16,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<std::fs::File>,
}

impl PortClaim {
    #[cfg(unix)]
    fn acquire(port: u16) -> io::Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let path = std::env::temp_dir().join(format!("edgemesh-tcp-{port}.lock"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self { port, _lock: lock }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("port {port} is held by another host"),
            )),
            Err((_, errno)) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn acquire(port: u16) -> io::Result<Self> {
        Ok(Self { port })
    }
}

fn dedup(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    let mut seen = HashSet::new();
    addrs.into_iter().filter(|a| seen.insert(a.clone())).collect()
}
