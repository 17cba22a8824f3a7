//! edgemesh tunnel core library
//!
//! This crate provides the identifiers and encodings shared by every part of
//! the tunnel: peer identities, self-describing transport addresses and the
//! directory record format built from them.
//!
//! # Modules
//!
//! - [`peer`]: Peer identifiers
//! - [`addr`]: Multiaddr helpers and peer address records
//! - [`crypto`]: Hash derivations with domain separation
//! - [`error`]: Error types

pub mod addr;
pub mod crypto;
pub mod error;
pub mod peer;

pub use addr::{Multiaddr, MultiaddrExt, PeerAddrInfo, Protocol};
pub use error::{Error, Result};
pub use peer::PeerId;
