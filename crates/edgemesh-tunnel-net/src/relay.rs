//! Circuit relay
//!
//! A peer behind NAT keeps a reservation with a public relay. Other peers
//! reach it by asking the relay (hop protocol) to open a stream to it (stop
//! protocol); the relay then splices the two streams together. The relayed
//! stream is end-to-end encrypted by running the handshake over it.

use crate::backoff::Backoff;
use crate::framing::{read_message, write_message, FrameError};
use crate::host::{Host, HostError, WeakHost};
use crate::mux::{Connection, MuxError, Stream};
use edgemesh_tunnel_core::{Multiaddr, MultiaddrExt, PeerAddrInfo, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol spoken between a client and the relay
pub const HOP_PROTOCOL: &str = "/edgemesh/relay/hop/1.0.0";
/// Protocol spoken between the relay and the reserved destination
pub const STOP_PROTOCOL: &str = "/edgemesh/relay/stop/1.0.0";

const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Relay refused: {0:?}")]
    Refused(Status),
    #[error("Unexpected relay message")]
    UnexpectedMessage,
}

/// Outcome codes carried in relay status messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ReservationRefused,
    ResourceLimitExceeded,
    NoReservation,
    ConnectionFailed,
    MalformedMessage,
}

/// A granted reservation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub expires_in_secs: u64,
    /// The client's address as the relay sees it
    pub observed_addr: Option<Multiaddr>,
}

#[derive(Debug, Serialize, Deserialize)]
enum HopMessage {
    Reserve,
    Connect {
        dst: PeerId,
    },
    Status {
        status: Status,
        reservation: Option<Reservation>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
enum StopMessage {
    Connect { src: PeerId },
    Status { status: Status },
}

/// Resource limits of the relay service
#[derive(Clone, Debug)]
pub struct RelayLimits {
    pub max_reservations: usize,
    pub max_circuits: usize,
    pub reservation_ttl: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            max_circuits: 256,
            reservation_ttl: Duration::from_secs(3600),
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub reservations_accepted: u64,
    pub reservations_refused: u64,
    pub circuits_opened: u64,
    pub circuits_refused: u64,
    pub bytes_relayed: u64,
    pub active_reservations: usize,
    pub active_circuits: usize,
}

/// Relay side of the hop protocol
pub struct RelayService {
    limits: RelayLimits,
    reservations: RwLock<HashMap<PeerId, Instant>>,
    active_circuits: AtomicUsize,
    stats: RwLock<RelayStats>,
}

struct CircuitGuard<'a>(&'a AtomicUsize);

impl Drop for CircuitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RelayService {
    pub fn new(limits: RelayLimits) -> Self {
        Self {
            limits,
            reservations: RwLock::new(HashMap::new()),
            active_circuits: AtomicUsize::new(0),
            stats: RwLock::new(RelayStats::default()),
        }
    }

    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    pub fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().clone();
        stats.active_reservations = self.reservation_count();
        stats.active_circuits = self.active_circuits.load(Ordering::Acquire);
        stats
    }

    fn reservation_count(&self) -> usize {
        let now = Instant::now();
        self.reservations.read().values().filter(|e| **e > now).count()
    }

    fn has_reservation(&self, peer: &PeerId) -> bool {
        self.reservations
            .read()
            .get(peer)
            .is_some_and(|expires| *expires > Instant::now())
    }

    /// Serve one inbound hop stream
    pub async fn handle_hop(&self, host: &Host, mut stream: Stream) {
        let message: HopMessage = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(e) => {
                debug!("Failed to read hop message: {}", e);
                return;
            }
        };

        let result = match message {
            HopMessage::Reserve => self.reserve(&mut stream).await,
            HopMessage::Connect { dst } => self.bridge(host, stream, dst).await,
            HopMessage::Status { .. } => {
                respond_hop(&mut stream, Status::MalformedMessage, None).await
            }
        };
        if let Err(e) = result {
            debug!("Hop request failed: {}", e);
        }
    }

    async fn reserve(&self, stream: &mut Stream) -> Result<(), RelayError> {
        let peer = stream.remote_peer();
        if stream.is_relayed() {
            self.stats.write().reservations_refused += 1;
            return respond_hop(stream, Status::ReservationRefused, None).await;
        }

        let granted = {
            let now = Instant::now();
            let mut reservations = self.reservations.write();
            reservations.retain(|_, expires| *expires > now);
            if reservations.len() >= self.limits.max_reservations
                && !reservations.contains_key(&peer)
            {
                false
            } else {
                reservations.insert(peer, now + self.limits.reservation_ttl);
                true
            }
        };

        if !granted {
            warn!("Reservation limit reached, refusing {}", peer.short());
            self.stats.write().reservations_refused += 1;
            return respond_hop(stream, Status::ResourceLimitExceeded, None).await;
        }

        self.stats.write().reservations_accepted += 1;
        debug!("Reserved relay slot for {}", peer.short());
        let reservation = Reservation {
            expires_in_secs: self.limits.reservation_ttl.as_secs(),
            observed_addr: stream.remote_addr().cloned(),
        };
        respond_hop(stream, Status::Ok, Some(reservation)).await
    }

    async fn bridge(&self, host: &Host, mut src_stream: Stream, dst: PeerId) -> Result<(), RelayError> {
        let src = src_stream.remote_peer();

        if !self.has_reservation(&dst) {
            self.stats.write().circuits_refused += 1;
            return respond_hop(&mut src_stream, Status::NoReservation, None).await;
        }

        let previous = self.active_circuits.fetch_add(1, Ordering::AcqRel);
        let _guard = CircuitGuard(&self.active_circuits);
        if previous >= self.limits.max_circuits {
            self.stats.write().circuits_refused += 1;
            return respond_hop(&mut src_stream, Status::ResourceLimitExceeded, None).await;
        }

        let mut dst_stream = match self.open_stop(host, src, dst).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Stop to {} failed: {}", dst.short(), e);
                self.stats.write().circuits_refused += 1;
                return respond_hop(&mut src_stream, Status::ConnectionFailed, None).await;
            }
        };

        respond_hop(&mut src_stream, Status::Ok, None).await?;
        self.stats.write().circuits_opened += 1;
        info!("Relaying {} -> {}", src.short(), dst.short());

        let result = tokio::io::copy_bidirectional(&mut src_stream, &mut dst_stream).await;
        match result {
            Ok((up, down)) => {
                self.stats.write().bytes_relayed += up + down;
                debug!("Circuit {} -> {} closed ({} bytes)", src.short(), dst.short(), up + down);
            }
            Err(e) => debug!("Circuit {} -> {} aborted: {}", src.short(), dst.short(), e),
        }
        Ok(())
    }

    async fn open_stop(&self, host: &Host, src: PeerId, dst: PeerId) -> Result<Stream, RelayError> {
        let conn = host
            .direct_connection(&dst)
            .ok_or(RelayError::Refused(Status::ConnectionFailed))?;
        let mut stream = conn.open_stream(STOP_PROTOCOL).await?;
        write_message(&mut stream, &StopMessage::Connect { src }).await?;
        match read_message(&mut stream).await? {
            StopMessage::Status { status: Status::Ok } => Ok(stream),
            StopMessage::Status { status } => Err(RelayError::Refused(status)),
            StopMessage::Connect { .. } => Err(RelayError::UnexpectedMessage),
        }
    }
}

async fn respond_hop(
    stream: &mut Stream,
    status: Status,
    reservation: Option<Reservation>,
) -> Result<(), RelayError> {
    write_message(stream, &HopMessage::Status { status, reservation }).await?;
    Ok(())
}

async fn read_hop_status(stream: &mut Stream) -> Result<Option<Reservation>, RelayError> {
    match read_message(stream).await? {
        HopMessage::Status {
            status: Status::Ok,
            reservation,
        } => Ok(reservation),
        HopMessage::Status { status, .. } => Err(RelayError::Refused(status)),
        _ => Err(RelayError::UnexpectedMessage),
    }
}

/// Ask the relay on `conn` for a reservation
pub async fn reserve(conn: &Connection) -> Result<Reservation, RelayError> {
    let mut stream = conn.open_stream(HOP_PROTOCOL).await?;
    write_message(&mut stream, &HopMessage::Reserve).await?;
    read_hop_status(&mut stream)
        .await?
        .ok_or(RelayError::UnexpectedMessage)
}

/// Ask the relay on `conn` for a circuit to `dst`
///
/// The returned stream is spliced to `dst` and still needs a handshake.
pub async fn connect_via(conn: &Connection, dst: PeerId) -> Result<Stream, RelayError> {
    let mut stream = conn.open_stream(HOP_PROTOCOL).await?;
    write_message(&mut stream, &HopMessage::Connect { dst }).await?;
    read_hop_status(&mut stream).await?;
    Ok(stream)
}

/// Accept an inbound stop stream; returns the peer on the far side
pub async fn accept_stop(stream: &mut Stream) -> Result<PeerId, RelayError> {
    match read_message(stream).await? {
        StopMessage::Connect { src } => {
            write_message(stream, &StopMessage::Status { status: Status::Ok }).await?;
            Ok(src)
        }
        StopMessage::Status { .. } => {
            let refusal = StopMessage::Status {
                status: Status::MalformedMessage,
            };
            write_message(stream, &refusal).await?;
            Err(RelayError::UnexpectedMessage)
        }
    }
}

/// Keep a reservation with `relay` alive until cancelled
///
/// While the reservation holds, the host advertises
/// `<relay addr>/p2p/<relay>/p2p-circuit` addresses.
pub async fn maintain_reservation(host: WeakHost, relay: PeerAddrInfo, cancel: CancellationToken) {
    let circuit_addrs: Vec<Multiaddr> = match relay
        .direct_addrs()
        .map(|addr| Multiaddr::circuit_via(addr, relay.id))
        .collect()
    {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Cannot build circuit addresses for relay {}: {}", relay.id.short(), e);
            return;
        }
    };
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

    loop {
        let Some(strong) = host.upgrade() else { break };
        let attempt = async {
            let conn = strong.connect_direct(&relay).await?;
            let reservation = reserve(&conn).await?;
            Ok::<_, HostError>((conn, reservation))
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = attempt => result,
        };

        let delay = match result {
            Ok((conn, reservation)) => {
                backoff.reset();
                if strong.set_relay_addrs(relay.id, circuit_addrs.clone()) {
                    info!(
                        "Reserved slot on relay {} (expires in {}s)",
                        relay.id.short(),
                        reservation.expires_in_secs
                    );
                }
                if let Some(observed) = reservation.observed_addr {
                    strong.record_observed(observed);
                }
                drop(strong);

                let refresh = (Duration::from_secs(reservation.expires_in_secs) / 2)
                    .clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(refresh) => continue,
                    _ = conn.closed() => {
                        warn!("Lost connection to relay {}", relay.id.short());
                        if let Some(host) = host.upgrade() {
                            host.clear_relay_addrs(&relay.id);
                        }
                        backoff.next_delay()
                    }
                }
            }
            Err(e) => {
                warn!("Reservation with relay {} failed: {}", relay.id.short(), e);
                strong.clear_relay_addrs(&relay.id);
                drop(strong);
                backoff.next_delay()
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(host) = host.upgrade() {
        host.clear_relay_addrs(&relay.id);
    }
}
