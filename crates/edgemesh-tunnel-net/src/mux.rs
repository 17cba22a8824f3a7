//! Stream multiplexer over a secured byte stream
//!
//! One [`Connection`] carries many independent [`Stream`]s. Each stream is
//! tagged with a protocol id when opened; the remote accepts it only if it has
//! a handler registered for that protocol, otherwise the stream is reset.
//!
//! Flow control is credit based: each direction of a stream starts with
//! [`INITIAL_WINDOW`] bytes of credit and the receiver grants more as the
//! application consumes data.

use crate::crypto::SessionKeys;
use crate::framing::{Frame, FrameCodec, FrameType, MAX_DATA_CHUNK};
use bytes::{Buf, Bytes};
use edgemesh_tunnel_core::{Multiaddr, PeerId};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Initial per-stream credit in each direction
pub const INITIAL_WINDOW: u32 = 256 * 1024;
/// How long to wait for the remote to accept a stream
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// A connection with no inbound frames for this long is closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(45);

const MAX_STREAMS: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Protocol {0} rejected by remote")]
    ProtocolRejected(String),
    #[error("Stream open timed out")]
    OpenTimeout,
}

/// Handler invoked on its own task for every accepted inbound stream
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Inbound protocol handlers shared by all connections of a host
#[derive(Default)]
pub struct Protocols {
    handlers: RwLock<HashMap<String, StreamHandler>>,
}

impl Protocols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a protocol id
    pub fn register<F, Fut>(&self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: StreamHandler =
            Arc::new(move |stream| -> BoxFuture<'static, ()> { Box::pin(handler(stream)) });
        self.handlers.write().insert(protocol.into(), handler);
    }

    /// Remove a handler; returns whether one was registered
    pub fn remove(&self, protocol: &str) -> bool {
        self.handlers.write().remove(protocol).is_some()
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers.read().contains_key(protocol)
    }

    fn get(&self, protocol: &str) -> Option<StreamHandler> {
        self.handlers.read().get(protocol).cloned()
    }
}

/// Which side established the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Immutable facts about a connection
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub remote_peer: PeerId,
    /// Address the connection was made over, when known
    pub remote_addr: Option<Multiaddr>,
    pub direction: Direction,
    /// Carried over a circuit relay rather than a direct transport
    pub relayed: bool,
}

#[derive(Default)]
struct StreamState {
    recv_buf: VecDeque<Bytes>,
    /// Bytes in `recv_buf`
    recv_buffered: u32,
    recv_eof: bool,
    reset: bool,
    /// Bytes consumed by the reader but not yet credited back
    unacked: u32,
    read_waker: Option<Waker>,
    send_credit: u32,
    write_closed: bool,
    write_waker: Option<Waker>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            send_credit: INITIAL_WINDOW,
            ..Default::default()
        }
    }

    fn wake_all(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn finished(&self) -> bool {
        self.reset || (self.recv_eof && self.write_closed)
    }
}

type SharedStream = Arc<Mutex<StreamState>>;

struct Shared {
    id: u64,
    info: ConnectionInfo,
    streams: Mutex<HashMap<u32, SharedStream>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<bool>>>,
    out_tx: mpsc::UnboundedSender<Frame>,
    next_stream_id: AtomicU32,
    /// Parity of locally opened stream ids
    local_parity: u32,
    protocols: Arc<Protocols>,
    closed: CancellationToken,
}

impl Shared {
    fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.out_tx.send(frame).map_err(|_| MuxError::ConnectionClosed)
    }

    fn stream(&self, id: u32) -> Option<SharedStream> {
        self.streams.lock().get(&id).cloned()
    }

    fn remove_stream(&self, id: u32) {
        self.streams.lock().remove(&id);
    }

    /// Dispatch one inbound frame; returns false when the connection must close
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> bool {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Open => self.accept_stream(frame),
            FrameType::OpenAck => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(true);
                }
            }
            FrameType::Data => match self.stream(id) {
                Some(state) => {
                    let mut st = state.lock();
                    if st.reset || st.recv_eof {
                        return true;
                    }
                    // the sender may never have more than one window outstanding
                    let outstanding = st.recv_buffered as usize + st.unacked as usize + frame.payload.len();
                    if outstanding > INITIAL_WINDOW as usize {
                        warn!(
                            peer = %self.info.remote_peer.short(),
                            stream = id,
                            "Remote overran the receive window, resetting stream"
                        );
                        st.recv_buf.clear();
                        st.recv_buffered = 0;
                        st.reset = true;
                        st.wake_all();
                        drop(st);
                        self.remove_stream(id);
                        let _ = self.send(Frame::reset(id));
                        return true;
                    }
                    st.recv_buffered += frame.payload.len() as u32;
                    st.recv_buf.push_back(frame.payload);
                    if let Some(waker) = st.read_waker.take() {
                        waker.wake();
                    }
                }
                None => {
                    trace!(stream = id, "Data for unknown stream");
                    let _ = self.send(Frame::reset(id));
                }
            },
            FrameType::WindowUpdate => {
                let Ok(credit) = frame.credit() else {
                    warn!(peer = %self.info.remote_peer.short(), "Malformed window update");
                    return false;
                };
                if let Some(state) = self.stream(id) {
                    let mut st = state.lock();
                    st.send_credit = st.send_credit.saturating_add(credit);
                    if let Some(waker) = st.write_waker.take() {
                        waker.wake();
                    }
                }
            }
            FrameType::Close => {
                if let Some(state) = self.stream(id) {
                    let mut st = state.lock();
                    st.recv_eof = true;
                    if let Some(waker) = st.read_waker.take() {
                        waker.wake();
                    }
                    if st.finished() {
                        drop(st);
                        self.remove_stream(id);
                    }
                }
            }
            FrameType::Reset => {
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(false);
                }
                if let Some(state) = self.streams.lock().remove(&id) {
                    let mut st = state.lock();
                    st.reset = true;
                    st.wake_all();
                }
            }
            FrameType::Ping => {
                if let Ok(nonce) = frame.nonce() {
                    let _ = self.send(Frame::pong(nonce));
                }
            }
            FrameType::Pong => {}
            FrameType::GoAway => {
                debug!(peer = %self.info.remote_peer.short(), "Remote closed connection");
                return false;
            }
        }
        true
    }

    fn accept_stream(self: &Arc<Self>, frame: Frame) {
        let id = frame.stream_id;
        let protocol = match frame.protocol() {
            Ok(protocol) => protocol.to_string(),
            Err(_) => {
                let _ = self.send(Frame::reset(id));
                return;
            }
        };

        if id == 0 || id % 2 == self.local_parity || self.streams.lock().contains_key(&id) {
            warn!(peer = %self.info.remote_peer.short(), stream = id, "Invalid stream id in open");
            let _ = self.send(Frame::reset(id));
            return;
        }

        let Some(handler) = self.protocols.get(&protocol) else {
            debug!(
                peer = %self.info.remote_peer.short(),
                protocol = %protocol,
                "Rejecting stream for unsupported protocol"
            );
            let _ = self.send(Frame::reset(id));
            return;
        };

        let state = Arc::new(Mutex::new(StreamState::new()));
        {
            let mut streams = self.streams.lock();
            if streams.len() >= MAX_STREAMS {
                drop(streams);
                warn!(peer = %self.info.remote_peer.short(), "Stream limit reached");
                let _ = self.send(Frame::reset(id));
                return;
            }
            streams.insert(id, state.clone());
        }

        if self.send(Frame::open_ack(id)).is_err() {
            return;
        }

        let stream = Stream {
            id,
            protocol,
            state,
            conn: self.clone(),
        };
        tokio::spawn(handler(stream));
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let streams: Vec<SharedStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for state in streams {
            let mut st = state.lock();
            st.reset = true;
            st.wake_all();
        }
        // Dropping the senders fails every pending open
        self.pending.lock().clear();
    }
}

/// A multiplexed, encrypted connection to one peer
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start multiplexing over `io` once the handshake has produced `session`
    pub fn new<T>(
        io: T,
        session: SessionKeys,
        info: ConnectionInfo,
        local_peer: PeerId,
        protocols: Arc<Protocols>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let reader = FramedRead::new(rd, FrameCodec::with_session(session.clone()));
        let writer = FramedWrite::new(wr, FrameCodec::with_session(session));
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        // the peer with the lower id opens odd streams
        let local_parity = if local_peer < info.remote_peer { 1 } else { 0 };
        let first_id = if local_parity == 1 { 1 } else { 2 };

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            info,
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            out_tx,
            next_stream_id: AtomicU32::new(first_id),
            local_parity,
            protocols,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, out_rx, shared.closed.clone()));
        tokio::spawn(read_loop(reader, shared.clone()));
        tokio::spawn(keepalive(shared.clone()));

        Self { shared }
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.info.remote_peer
    }

    pub fn is_relayed(&self) -> bool {
        self.shared.info.relayed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Number of open streams
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Close the connection; every stream on it is reset
    pub fn close(&self) {
        let _ = self.shared.send(Frame::go_away());
        self.shared.closed.cancel();
    }

    /// Open a stream speaking `protocol`
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed);
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(StreamState::new()));
        let (tx, rx) = oneshot::channel();
        self.shared.streams.lock().insert(id, state.clone());
        self.shared.pending.lock().insert(id, tx);

        let stream = Stream {
            id,
            protocol: protocol.to_string(),
            state,
            conn: self.shared.clone(),
        };

        self.shared.send(Frame::open(id, protocol))?;

        let accepted = tokio::time::timeout(OPEN_TIMEOUT, async {
            tokio::select! {
                result = rx => result.map_err(|_| MuxError::ConnectionClosed),
                _ = self.shared.closed.cancelled() => Err(MuxError::ConnectionClosed),
            }
        })
        .await;

        match accepted {
            Ok(Ok(true)) => Ok(stream),
            Ok(Ok(false)) => {
                // already reset by the remote; dropping sends nothing further
                stream.state.lock().reset = true;
                Err(MuxError::ProtocolRejected(protocol.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(MuxError::OpenTimeout)
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_peer", &self.shared.info.remote_peer)
            .field("relayed", &self.shared.info.relayed)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    'outer: loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        if let Err(e) = writer.feed(frame).await {
            debug!("Connection write failed: {}", e);
            break;
        }
        // batch whatever is already queued before flushing
        while let Ok(frame) = rx.try_recv() {
            if let Err(e) = writer.feed(frame).await {
                debug!("Connection write failed: {}", e);
                break 'outer;
            }
        }
        if let Err(e) = writer.flush().await {
            debug!("Connection flush failed: {}", e);
            break;
        }
    }

    let _ = writer.close().await;
    closed.cancel();
}

async fn read_loop<R>(mut reader: FramedRead<R, FrameCodec>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = tokio::time::timeout(IDLE_TIMEOUT, reader.next()) => next,
        };
        match next {
            Err(_) => {
                debug!(peer = %shared.info.remote_peer.short(), "Connection idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(peer = %shared.info.remote_peer.short(), "Connection read failed: {}", e);
                break;
            }
            Ok(Some(Ok(frame))) => {
                if !shared.handle_frame(frame) {
                    break;
                }
            }
        }
    }
    shared.shutdown();
}

async fn keepalive(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    let mut nonce = 0u64;
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = ticker.tick() => {
                nonce = nonce.wrapping_add(1);
                if shared.send(Frame::ping(nonce)).is_err() {
                    break;
                }
            }
        }
    }
}

/// One logical byte stream on a [`Connection`]
///
/// Shutting down the write half sends a half-close; dropping a stream that is
/// not finished in both directions resets it.
pub struct Stream {
    id: u32,
    protocol: String,
    state: SharedStream,
    conn: Arc<Shared>,
}

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote_peer(&self) -> PeerId {
        self.conn.info.remote_peer
    }

    /// Address of the connection carrying this stream
    pub fn remote_addr(&self) -> Option<&Multiaddr> {
        self.conn.info.remote_addr.as_ref()
    }

    pub fn is_relayed(&self) -> bool {
        self.conn.info.relayed
    }

    /// Abort the stream in both directions
    pub fn reset(&mut self) {
        let mut st = self.state.lock();
        if st.finished() {
            return;
        }
        st.reset = true;
        st.wake_all();
        drop(st);
        let _ = self.conn.send(Frame::reset(self.id));
        self.conn.remove_stream(self.id);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote_peer", &self.conn.info.remote_peer)
            .finish()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let finished = self.state.lock().finished();
        if finished {
            self.conn.remove_stream(self.id);
        } else {
            self.reset();
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = this.state.lock();

        if let Some(chunk) = st.recv_buf.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                st.recv_buf.pop_front();
            }
            st.recv_buffered -= n as u32;

            st.unacked += n as u32;
            if st.unacked >= INITIAL_WINDOW / 2 && !st.recv_eof && !st.reset {
                let credit = std::mem::take(&mut st.unacked);
                let _ = this.conn.send(Frame::window_update(this.id, credit));
            }
            return Poll::Ready(Ok(()));
        }

        if st.recv_eof {
            return Poll::Ready(Ok(()));
        }
        if st.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }

        st.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut st = this.state.lock();
        if st.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset",
            )));
        }
        if st.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        }
        if st.send_credit == 0 {
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.len().min(st.send_credit as usize).min(MAX_DATA_CHUNK);
        st.send_credit -= n as u32;
        drop(st);

        match this.conn.send(Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]))) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut st = this.state.lock();
        if st.write_closed || st.reset {
            return Poll::Ready(Ok(()));
        }
        st.write_closed = true;
        let finished = st.finished();
        drop(st);

        let _ = this.conn.send(Frame::close(this.id));
        if finished {
            this.conn.remove_stream(this.id);
        }
        Poll::Ready(Ok(()))
    }
}
