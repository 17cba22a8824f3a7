//! Peer identity

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity multihash header of an inlined Ed25519 key: hash code 0, digest
/// length 36, then the protobuf key type and length
const ED25519_PEER_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Unique peer identifier (the node's Ed25519 public key)
///
/// Displayed in the libp2p base58 form used inside multiaddrs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from an identity public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Create from a byte slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPeerId(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// The libp2p peer id carrying this key
    pub fn to_libp2p(&self) -> Result<libp2p_identity::PeerId> {
        let mut bytes = Vec::with_capacity(ED25519_PEER_PREFIX.len() + 32);
        bytes.extend_from_slice(&ED25519_PEER_PREFIX);
        bytes.extend_from_slice(&self.0);
        libp2p_identity::PeerId::from_bytes(&bytes).map_err(|e| Error::InvalidPeerId(e.to_string()))
    }

    /// Recover the key from a libp2p peer id; only inlined Ed25519 keys qualify
    pub fn from_libp2p(peer: &libp2p_identity::PeerId) -> Result<Self> {
        let bytes = peer.to_bytes();
        match bytes.strip_prefix(&ED25519_PEER_PREFIX[..]) {
            Some(key) => Self::from_slice(key),
            None => Err(Error::InvalidPeerId(format!("{peer} is not an Ed25519 peer id"))),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_libp2p() {
            Ok(peer) => write!(f, "{}", peer),
            Err(_) => write!(f, "{}", hex::encode(self.0)),
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let peer = libp2p_identity::PeerId::from_str(s).map_err(|e| Error::InvalidPeerId(e.to_string()))?;
        Self::from_libp2p(&peer)
    }
}
