//! Authenticated key exchange over a raw byte stream
//!
//! The handshake is symmetric: both sides write a signed `Hello` and then read
//! the other's. The same code therefore serves the dialer, the listener and
//! TCP simultaneous open, where neither side knows it is "first".

use crate::crypto::{CryptoError, EphemeralKeyExchange, KeyPair, SessionKeys};
use crate::framing::{read_message, write_message, FrameError};
use edgemesh_tunnel_core::crypto::{hello_signing_bytes, session_context};
use edgemesh_tunnel_core::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::PublicKey as X25519Public;

/// Handshake protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Default bound on the whole handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake errors
#[derive(Debug, Error)]
pub enum SecureError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Unsupported protocol version {0}")]
    Version(u32),
    #[error("Invalid hello signature")]
    BadSignature,
    #[error("Expected peer {expected:?}, got {actual:?}")]
    PeerMismatch { expected: PeerId, actual: PeerId },
    #[error("Refusing to connect to self")]
    SelfDial,
    #[error("Handshake timed out")]
    Timeout,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    version: u32,
    identity: [u8; 32],
    ephemeral: [u8; 32],
    signature: Vec<u8>,
    /// How the sender sees the receiver's address
    observed_addr: Option<Multiaddr>,
}

/// Result of a completed handshake
#[derive(Debug)]
pub struct Secured {
    pub remote_peer: PeerId,
    pub session: SessionKeys,
    /// Our own address as the remote sees it
    pub observed_addr: Option<Multiaddr>,
}

/// Run the handshake over `io`.
///
/// `expected` pins the remote identity when dialing a known peer.
/// `remote_addr` is reported back to the remote as its observed address.
pub async fn handshake<T>(
    io: &mut T,
    keypair: &KeyPair,
    expected: Option<PeerId>,
    remote_addr: Option<Multiaddr>,
) -> Result<Secured, SecureError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let local_peer = keypair.peer_id();
    let ephemeral = EphemeralKeyExchange::new();
    let our_ephemeral = ephemeral.public_key();
    let identity = keypair.public_key();

    let hello = Hello {
        version: PROTOCOL_VERSION,
        identity,
        ephemeral: our_ephemeral,
        signature: keypair.sign(&hello_signing_bytes(&identity, &our_ephemeral)).to_vec(),
        observed_addr: remote_addr,
    };
    write_message(io, &hello).await?;

    let theirs: Hello = read_message(io).await?;
    if theirs.version != PROTOCOL_VERSION {
        return Err(SecureError::Version(theirs.version));
    }

    let signature: [u8; 64] = theirs
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| SecureError::BadSignature)?;
    KeyPair::verify(
        &theirs.identity,
        &hello_signing_bytes(&theirs.identity, &theirs.ephemeral),
        &signature,
    )
    .map_err(|_| SecureError::BadSignature)?;

    let remote_peer = PeerId::from_public_key(&theirs.identity);
    if remote_peer == local_peer {
        return Err(SecureError::SelfDial);
    }
    if let Some(expected) = expected {
        if expected != remote_peer {
            return Err(SecureError::PeerMismatch {
                expected,
                actual: remote_peer,
            });
        }
    }

    let shared = ephemeral.exchange(&theirs.ephemeral);
    let session = SessionKeys::derive(
        &shared,
        &X25519Public::from(our_ephemeral),
        &X25519Public::from(theirs.ephemeral),
        &session_context(&local_peer, &remote_peer),
    )?;

    Ok(Secured {
        remote_peer,
        session,
        observed_addr: theirs.observed_addr,
    })
}

/// [`handshake`] bounded by `timeout`
pub async fn handshake_with_timeout<T>(
    io: &mut T,
    keypair: &KeyPair,
    expected: Option<PeerId>,
    remote_addr: Option<Multiaddr>,
    timeout: Duration,
) -> Result<Secured, SecureError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, handshake(io, keypair, expected, remote_addr))
        .await
        .map_err(|_| SecureError::Timeout)?
}
