//! TCP proxying over tunnel streams
//!
//! Every proxied TCP connection maps to exactly one stream on the
//! [`PROXY_PROTOCOL`]. The opener sends a [`ProxyRequest`] naming the target
//! `host:port`; the acceptor dials it and answers with a [`ProxyResponse`].
//! After that the stream carries the connection's bytes unchanged in both
//! directions until either side closes.

use crate::directory::{AddressDirectory, DirectoryBackend, DirectoryError};
use edgemesh_tunnel_core::PeerId;
use edgemesh_tunnel_net::framing::{read_message, write_message, FrameError};
use edgemesh_tunnel_net::{Direction, Host, HostError, Stream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

/// Protocol id of proxied TCP streams
pub const PROXY_PROTOCOL: &str = "/edgemesh/tcp-proxy/1.0.0";

/// Bound on dialing the target and on the request/response exchange
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Host error: {0}")]
    Host(#[from] HostError),
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Remote refused {target}: {reason}")]
    Refused { target: String, reason: String },
    #[error("Invalid target {0:?}, expected host:port")]
    InvalidTarget(String),
    #[error("Timed out")]
    Timeout,
    #[error("Closed")]
    Closed,
}

/// First message on a proxy stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// `host:port` to dial on the remote side
    pub target: String,
    /// Node name of the opener
    pub origin: String,
}

/// Reply to a [`ProxyRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyResponse {
    Connected,
    Refused { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Established,
    Closed,
}

/// Snapshot of one proxied connection
#[derive(Clone, Debug)]
pub struct TunnelConnection {
    pub id: u64,
    pub peer: Option<PeerId>,
    /// Remote node name for outbound, origin node for inbound
    pub node: String,
    pub target: String,
    pub direction: Direction,
    pub state: TunnelState,
    pub opened_at: Instant,
}

/// Proxy counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub inbound_opened: u64,
    pub outbound_opened: u64,
    pub refused: u64,
    pub failed: u64,
    pub closed: u64,
    /// Bytes from local connections into the tunnel
    pub bytes_sent: u64,
    /// Bytes from the tunnel to local connections
    pub bytes_received: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    inbound_opened: AtomicU64,
    outbound_opened: AtomicU64,
    refused: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct Entry {
    info: TunnelConnection,
    cancel: CancellationToken,
}

/// Connection table and counters, shared with the streams handed out by
/// [`ProxyService::open`]
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<u64, Entry>>,
    counters: Counters,
}

impl Registry {
    fn track(&self, peer: Option<PeerId>, node: &str, target: &str, direction: Direction) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let info = TunnelConnection {
            id,
            peer,
            node: node.to_string(),
            target: target.to_string(),
            direction,
            state: TunnelState::Connecting,
            opened_at: Instant::now(),
        };
        self.connections.write().insert(
            id,
            Entry {
                info,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    fn established(&self, id: u64, peer: Option<PeerId>) {
        if let Some(entry) = self.connections.write().get_mut(&id) {
            entry.info.state = TunnelState::Established;
            if peer.is_some() {
                entry.info.peer = peer;
            }
        }
    }

    fn untrack(&self, id: u64, clean: bool) {
        if let Some(mut entry) = self.connections.write().remove(&id) {
            entry.info.state = TunnelState::Closed;
            entry.cancel.cancel();
        }
        if clean {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// An outbound proxy stream, connected to its target
///
/// Listed in [`ProxyService::connections`] and counted in the proxy stats
/// until dropped. [`ProxyService::close_connection`] resets it. Derefs to the
/// underlying [`Stream`].
pub struct TunnelStream {
    stream: Stream,
    id: u64,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    registry: Arc<Registry>,
    failed: bool,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl TunnelStream {
    fn new(stream: Stream, id: u64, cancel: CancellationToken, registry: Arc<Registry>) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            stream,
            id,
            cancel,
            cancelled,
            registry,
            failed: false,
        }
    }

    /// Id of this stream in [`ProxyService::connections`]
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    fn closed_by_service(&mut self, cx: &mut Context<'_>) -> bool {
        self.cancel.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }

    fn outcome<T>(&mut self, result: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(_)) = &result {
            self.failed = true;
        }
        result
    }
}

fn service_closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "closed by proxy service")
}

impl Deref for TunnelStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

impl DerefMut for TunnelStream {
    fn deref_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed_by_service(cx) {
            this.stream.reset();
            return this.outcome(Poll::Ready(Err(service_closed_error())));
        }
        let before = buf.filled().len();
        let result = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = (buf.filled().len() - before) as u64;
            this.registry.counters.bytes_received.fetch_add(n, Ordering::Relaxed);
        }
        this.outcome(result)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed_by_service(cx) {
            this.stream.reset();
            return this.outcome(Poll::Ready(Err(service_closed_error())));
        }
        let result = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            this.registry.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        this.outcome(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.stream).poll_flush(cx);
        this.outcome(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.stream).poll_shutdown(cx);
        this.outcome(result)
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.registry.untrack(self.id, !self.failed);
    }
}

/// Proxies TCP connections to and from other nodes
pub struct ProxyService<B> {
    host: Host,
    directory: Arc<AddressDirectory<B>>,
    node_name: String,
    registry: Arc<Registry>,
}

impl<B: DirectoryBackend> ProxyService<B> {
    pub fn new(host: Host, directory: Arc<AddressDirectory<B>>, node_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            host,
            directory,
            node_name: node_name.into(),
            registry: Arc::new(Registry::default()),
        })
    }

    /// Accept inbound proxy streams on the host
    pub fn register(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.host.set_stream_handler(PROXY_PROTOCOL, move |stream: Stream| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(service) => service.handle_inbound(stream).await,
                    None => drop(stream),
                }
            }
        });
        info!("Proxy service accepting {}", PROXY_PROTOCOL);
    }

    /// Stop accepting inbound proxy streams
    pub fn unregister(&self) {
        self.host.remove_stream_handler(PROXY_PROTOCOL);
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Open a proxy stream to `target` on `node`
    ///
    /// Returns once the remote has connected to the target. The stream is
    /// tracked like a forwarded connection until dropped.
    pub async fn open(&self, node: &str, target: &str) -> Result<TunnelStream, ProxyError> {
        let (id, cancel) = self.registry.track(None, node, target, Direction::Outbound);
        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Closed),
            opened = self.negotiate(node, target) => opened,
        };
        match opened {
            Ok(stream) => {
                self.registry.established(id, Some(stream.remote_peer()));
                self.registry.counters.outbound_opened.fetch_add(1, Ordering::Relaxed);
                debug!("Proxy {} established to {} via {}", id, target, node);
                Ok(TunnelStream::new(stream, id, cancel, self.registry.clone()))
            }
            Err(e) => {
                self.registry.untrack(id, false);
                Err(e)
            }
        }
    }

    /// Send the request on a new stream and wait for the remote's answer
    async fn negotiate(&self, node: &str, target: &str) -> Result<Stream, ProxyError> {
        validate_target(target)?;
        let peer = self.directory.get(node).await?;
        let mut stream = self.host.new_stream(&peer, PROXY_PROTOCOL).await?;

        let request = ProxyRequest {
            target: target.to_string(),
            origin: self.node_name.clone(),
        };
        let response = tokio::time::timeout(DIAL_TIMEOUT * 2, async {
            write_message(&mut stream, &request).await?;
            read_message::<_, ProxyResponse>(&mut stream).await
        })
        .await
        .map_err(|_| ProxyError::Timeout)??;

        match response {
            ProxyResponse::Connected => Ok(stream),
            ProxyResponse::Refused { reason } => Err(ProxyError::Refused {
                target: target.to_string(),
                reason,
            }),
        }
    }

    /// Carry `tcp` to `target` on `node` until either side closes
    ///
    /// Returns the bytes copied as `(sent, received)`.
    pub async fn proxy(&self, node: &str, target: &str, mut tcp: TcpStream) -> Result<(u64, u64), ProxyError> {
        let mut stream = self.open(node, target).await?;
        match tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
            Ok(copied) => Ok(copied),
            Err(e) => {
                stream.failed = true;
                if stream.cancel.is_cancelled() {
                    Err(ProxyError::Closed)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Forward every connection accepted on `listener` to `target` on `node`
    pub async fn serve(self: Arc<Self>, listener: TcpListener, node: String, target: String, cancel: CancellationToken) {
        let local = listener.local_addr().ok();
        info!("Forwarding {:?} to {} on {}", local, target, node);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, from)) => {
                    let service = self.clone();
                    let node = node.clone();
                    let target = target.clone();
                    tokio::spawn(async move {
                        let _ = tcp.set_nodelay(true);
                        if let Err(e) = service.proxy(&node, &target, tcp).await {
                            warn!("Proxy from {} to {} on {} failed: {}", from, target, node, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept on {:?} failed: {}", local, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Snapshots of every open proxied connection
    pub fn connections(&self) -> Vec<TunnelConnection> {
        let mut out: Vec<TunnelConnection> = self
            .registry
            .connections
            .read()
            .values()
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    /// Tear down one proxied connection; false if unknown
    pub fn close_connection(&self, id: u64) -> bool {
        match self.registry.connections.read().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> ProxyStats {
        let c = &self.registry.counters;
        ProxyStats {
            inbound_opened: c.inbound_opened.load(Ordering::Relaxed),
            outbound_opened: c.outbound_opened.load(Ordering::Relaxed),
            refused: c.refused.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            active: self.registry.connections.read().len(),
        }
    }

    async fn handle_inbound(&self, mut stream: Stream) {
        let peer = stream.remote_peer();
        let request = match tokio::time::timeout(DIAL_TIMEOUT, read_message::<_, ProxyRequest>(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!("Bad proxy request from {}: {}", peer.short(), e);
                return;
            }
            Err(_) => {
                warn!("Proxy request from {} timed out", peer.short());
                return;
            }
        };

        let (id, cancel) = self
            .registry
            .track(Some(peer), &request.origin, &request.target, Direction::Inbound);
        let result = self.serve_inbound(id, &cancel, stream, &request).await;
        match &result {
            Ok((up, down)) => debug!("Proxy {} from {} closed ({} / {} bytes)", id, request.origin, up, down),
            Err(e) => warn!("Proxy {} from {} to {}: {}", id, request.origin, request.target, e),
        }
        self.registry.untrack(id, result.is_ok());
    }

    async fn serve_inbound(
        &self,
        id: u64,
        cancel: &CancellationToken,
        mut stream: Stream,
        request: &ProxyRequest,
    ) -> Result<(u64, u64), ProxyError> {
        let dialed = match validate_target(&request.target) {
            Ok(()) => tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(request.target.as_str()))
                .await
                .map_err(|_| ProxyError::Timeout)
                .and_then(|r| r.map_err(ProxyError::from)),
            Err(e) => Err(e),
        };

        let mut tcp = match dialed {
            Ok(tcp) => tcp,
            Err(e) => {
                self.registry.counters.refused.fetch_add(1, Ordering::Relaxed);
                let refusal = ProxyResponse::Refused {
                    reason: e.to_string(),
                };
                let _ = write_message(&mut stream, &refusal).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
                return Err(e);
            }
        };
        let _ = tcp.set_nodelay(true);

        write_message(&mut stream, &ProxyResponse::Connected).await?;
        self.registry.established(id, None);
        self.registry.counters.inbound_opened.fetch_add(1, Ordering::Relaxed);
        debug!("Proxy {} from {} connected to {}", id, request.origin, request.target);

        let (received, sent) = splice(&mut stream, &mut tcp, cancel).await?;
        let counters = &self.registry.counters;
        counters.bytes_received.fetch_add(received, Ordering::Relaxed);
        counters.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        Ok((received, sent))
    }
}

/// Copy both ways until both sides finish or `cancel` fires
async fn splice<A, B>(a: &mut A, b: &mut B, cancel: &CancellationToken) -> Result<(u64, u64), ProxyError>
where
    A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Closed),
        copied = tokio::io::copy_bidirectional(a, b) => Ok(copied?),
    }
}

fn validate_target(target: &str) -> Result<(), ProxyError> {
    let valid = target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0));
    if valid {
        Ok(())
    } else {
        Err(ProxyError::InvalidTarget(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryBackend;
    use edgemesh_tunnel_net::{HostConfig, KeyPair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Pair {
        client: Arc<ProxyService<MemoryBackend>>,
        server: Arc<ProxyService<MemoryBackend>>,
    }

    async fn host() -> Host {
        Host::new(
            KeyPair::generate(),
            HostConfig {
                listen_addrs: vec!["127.0.0.1:0".parse().unwrap()],
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    async fn pair() -> Pair {
        let directory = Arc::new(AddressDirectory::new(MemoryBackend::new()));
        let a = host().await;
        let b = host().await;
        directory.set("node-b", b.peer_id(), &b.addrs()).await.unwrap();

        let client = ProxyService::new(a, directory.clone(), "node-a");
        let server = ProxyService::new(b, directory, "node-b");
        server.register();
        Pair { client, server }
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tcp.into_split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr.to_string()
    }

    /// Local forward listener for `target` on node-b
    async fn forward(pair: &Pair, target: String, cancel: CancellationToken) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(pair.client.clone().serve(listener, "node-b".into(), target, cancel));
        addr.to_string()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_open_roundtrip() {
        let pair = pair().await;
        let target = echo_server().await;

        let stream = pair.client.open("node-b", &target).await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        wr.write_all(b"ping over tunnel").await.unwrap();
        let mut buf = [0u8; 16];
        rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over tunnel");
    }

    #[tokio::test]
    async fn test_forwarded_connections_are_isolated() {
        let pair = pair().await;
        let target = echo_server().await;
        let local = forward(&pair, target, CancellationToken::new()).await;

        let mut tasks = Vec::new();
        for i in 0..6u8 {
            let local = local.clone();
            tasks.push(tokio::spawn(async move {
                let payload: Vec<u8> = (0..50_000u32).map(|n| (n as u8).wrapping_mul(i + 1)).collect();
                let tcp = TcpStream::connect(&local).await.unwrap();
                let (mut rd, mut wr) = tcp.into_split();
                let expected = payload.clone();
                let writer = tokio::spawn(async move {
                    wr.write_all(&payload).await.unwrap();
                    wr.shutdown().await.unwrap();
                });
                let mut echoed = Vec::new();
                rd.read_to_end(&mut echoed).await.unwrap();
                writer.await.unwrap();
                echoed == expected
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }

        wait_for(|| pair.client.stats().active == 0).await;
        let stats = pair.client.stats();
        assert_eq!(stats.outbound_opened, 6);
        assert_eq!(stats.bytes_sent, 6 * 50_000);
        assert_eq!(pair.server.stats().inbound_opened, 6);
    }

    #[tokio::test]
    async fn test_closing_one_connection_leaves_others() {
        let pair = pair().await;
        let target = echo_server().await;
        let local = forward(&pair, target, CancellationToken::new()).await;

        let mut doomed = TcpStream::connect(&local).await.unwrap();
        let mut survivor = TcpStream::connect(&local).await.unwrap();
        for tcp in [&mut doomed, &mut survivor] {
            tcp.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            tcp.read_exact(&mut buf).await.unwrap();
        }
        wait_for(|| pair.client.connections().len() == 2).await;

        drop(doomed);
        wait_for(|| pair.client.connections().len() == 1).await;

        survivor.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        survivor.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_close_connection_tears_down_pair() {
        let pair = pair().await;
        let target = echo_server().await;
        let local = forward(&pair, target, CancellationToken::new()).await;

        let mut tcp = TcpStream::connect(&local).await.unwrap();
        tcp.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        tcp.read_exact(&mut one).await.unwrap();

        let conns = pair.client.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].state, TunnelState::Established);
        assert_eq!(conns[0].direction, Direction::Outbound);
        assert_eq!(conns[0].peer, Some(pair.server.host().peer_id()));

        assert!(pair.client.close_connection(conns[0].id));
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_err() || rest.is_empty());
        wait_for(|| pair.client.connections().is_empty()).await;
        assert!(!pair.client.close_connection(conns[0].id));
    }

    #[tokio::test]
    async fn test_opened_stream_is_tracked_until_dropped() {
        let pair = pair().await;
        let target = echo_server().await;

        let mut stream = pair.client.open("node-b", &target).await.unwrap();
        let conns = pair.client.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, stream.connection_id());
        assert_eq!(conns[0].state, TunnelState::Established);
        assert_eq!(conns[0].target, target);

        stream.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        let stats = pair.client.stats();
        assert_eq!(stats.outbound_opened, 1);
        assert_eq!((stats.bytes_sent, stats.bytes_received), (3, 3));
        assert_eq!(stats.active, 1);

        drop(stream);
        assert!(pair.client.connections().is_empty());
        assert_eq!(pair.client.stats().closed, 1);
    }

    #[tokio::test]
    async fn test_close_connection_resets_opened_stream() {
        let pair = pair().await;
        let target = echo_server().await;

        let mut stream = pair.client.open("node-b", &target).await.unwrap();
        assert!(pair.client.close_connection(stream.connection_id()));

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        drop(stream);
        assert_eq!(pair.client.stats().failed, 1);
        assert!(pair.client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_refused() {
        let pair = pair().await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = pair.client.open("node-b", &closed).await.unwrap_err();
        assert!(matches!(err, ProxyError::Refused { .. }));
        wait_for(|| pair.server.stats().refused == 1).await;
        assert!(pair.server.connections().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_target_and_unknown_node() {
        let pair = pair().await;
        assert!(matches!(
            pair.client.open("node-b", "no-port").await,
            Err(ProxyError::InvalidTarget(_))
        ));
        assert!(matches!(
            pair.client.open("node-z", "127.0.0.1:80").await,
            Err(ProxyError::Directory(DirectoryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_node_rejects_protocol() {
        let pair = pair().await;
        pair.server.unregister();
        let target = echo_server().await;

        let err = pair.client.open("node-b", &target).await.unwrap_err();
        assert!(matches!(err, ProxyError::Host(HostError::Mux(_))));
        assert_eq!(pair.server.stats(), ProxyStats::default());
    }
}
