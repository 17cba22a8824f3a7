//! Networking for the edgemesh tunnel
//!
//! This crate provides:
//! - Identity keypairs and session encryption
//! - An authenticated, encrypted handshake over any byte stream
//! - A stream multiplexer with per-stream flow control
//! - The [`Host`]: listening, dialing, circuit relay and hole punching

pub mod backoff;
pub mod crypto;
pub mod framing;
pub mod holepunch;
pub mod host;
pub mod mux;
pub mod relay;
pub mod secure;

pub use crypto::{KeyPair, SessionKeys};
pub use framing::{Frame, FrameCodec};
pub use host::{Host, HostConfig, HostError, Reachability};
pub use mux::{Connection, Direction, Stream};
pub use relay::RelayLimits;
