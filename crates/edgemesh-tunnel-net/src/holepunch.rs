//! Direct connection upgrade through hole punching
//!
//! When a peer accepts a relayed connection it tries to replace it with a
//! direct one. Both sides exchange their direct addresses over the relayed
//! connection, time the round trip, and then dial each other at roughly the
//! same moment so each side's NAT sees outbound traffic first.

use crate::framing::{read_message, write_message, FrameError};
use crate::host::Host;
use crate::mux::{Connection, MuxError, Stream};
use edgemesh_tunnel_core::{Multiaddr, MultiaddrExt, PeerId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Hole punch coordination protocol
pub const PROTOCOL: &str = "/edgemesh/holepunch/1.0.0";

const MAX_ATTEMPTS: usize = 3;
const SETTLE_DELAY: Duration = Duration::from_millis(500);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hole punch errors
#[derive(Debug, Error)]
pub enum HolePunchError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),
    #[error("Unexpected hole punch message")]
    UnexpectedMessage,
    #[error("Peer offered no direct addresses")]
    NoAddresses,
    #[error("Coordination timed out")]
    Timeout,
    #[error("No direct connection after {0} attempts")]
    Failed(usize),
}

#[derive(Debug, Serialize, Deserialize)]
enum HolePunchMessage {
    Connect { addrs: Vec<Multiaddr> },
    Sync,
}

/// Try to upgrade `relayed` to a direct connection
pub async fn initiate(host: Host, relayed: Connection) {
    let peer = relayed.remote_peer();
    match try_initiate(&host, &relayed).await {
        Ok(()) => info!("Hole punch to {} succeeded", peer.short()),
        Err(e) => debug!("Hole punch to {} failed: {}", peer.short(), e),
    }
}

async fn try_initiate(host: &Host, relayed: &Connection) -> Result<(), HolePunchError> {
    let peer = relayed.remote_peer();
    for attempt in 1..=MAX_ATTEMPTS {
        if host.has_direct_connection(&peer) {
            return Ok(());
        }
        if relayed.is_closed() {
            return Err(MuxError::ConnectionClosed.into());
        }

        let mut stream = relayed.open_stream(PROTOCOL).await?;
        let started = Instant::now();
        let ours = HolePunchMessage::Connect {
            addrs: host.hole_punch_addrs(),
        };
        let theirs = tokio::time::timeout(EXCHANGE_TIMEOUT, offer(&mut stream, &ours))
            .await
            .map_err(|_| HolePunchError::Timeout)??;
        let rtt = started.elapsed();

        let HolePunchMessage::Connect { addrs } = theirs else {
            return Err(HolePunchError::UnexpectedMessage);
        };
        if addrs.iter().all(|a| a.is_relayed()) {
            return Err(HolePunchError::NoAddresses);
        }

        write_message(&mut stream, &HolePunchMessage::Sync).await?;
        tokio::time::sleep(rtt / 2).await;

        debug!("Hole punch attempt {} to {} (rtt {:?})", attempt, peer.short(), rtt);
        if punch(host, peer, &addrs).await {
            return Ok(());
        }
    }
    Err(HolePunchError::Failed(MAX_ATTEMPTS))
}

/// Respond to a hole punch started by the remote
pub async fn handle_inbound(host: Host, mut stream: Stream) {
    let peer = stream.remote_peer();
    if !stream.is_relayed() {
        debug!("Ignoring hole punch over direct connection from {}", peer.short());
        return;
    }
    match respond(&host, &mut stream).await {
        Ok(true) => info!("Hole punch from {} succeeded", peer.short()),
        Ok(false) => debug!("Hole punch from {} did not connect", peer.short()),
        Err(e) => debug!("Hole punch from {} failed: {}", peer.short(), e),
    }
}

async fn respond(host: &Host, stream: &mut Stream) -> Result<bool, HolePunchError> {
    let peer = stream.remote_peer();
    let addrs = tokio::time::timeout(EXCHANGE_TIMEOUT, answer(host, stream))
        .await
        .map_err(|_| HolePunchError::Timeout)??;

    Ok(punch(host, peer, &addrs).await)
}

async fn offer(stream: &mut Stream, ours: &HolePunchMessage) -> Result<HolePunchMessage, HolePunchError> {
    write_message(stream, ours).await?;
    Ok(read_message(stream).await?)
}

/// Read the initiator's addresses, send ours and wait for `Sync`
async fn answer(host: &Host, stream: &mut Stream) -> Result<Vec<Multiaddr>, HolePunchError> {
    let HolePunchMessage::Connect { addrs } = read_message::<_, HolePunchMessage>(stream).await? else {
        return Err(HolePunchError::UnexpectedMessage);
    };
    let ours = HolePunchMessage::Connect {
        addrs: host.hole_punch_addrs(),
    };
    write_message(stream, &ours).await?;
    match read_message::<_, HolePunchMessage>(stream).await? {
        HolePunchMessage::Sync => Ok(addrs),
        HolePunchMessage::Connect { .. } => Err(HolePunchError::UnexpectedMessage),
    }
}

/// Dial every direct address of `peer` at once
async fn punch(host: &Host, peer: PeerId, addrs: &[Multiaddr]) -> bool {
    let dials = addrs
        .iter()
        .filter(|a| !a.is_relayed())
        .map(|addr| host.dial_direct(addr, peer));
    let results = join_all(dials).await;
    if results.iter().any(|r| r.is_ok()) {
        return true;
    }

    // the remote's dial may have landed on our listener instead
    tokio::time::sleep(SETTLE_DELAY).await;
    host.has_direct_connection(&peer)
}
