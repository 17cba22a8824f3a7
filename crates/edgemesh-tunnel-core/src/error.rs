//! Error types for the tunnel core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed binary or text address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid peer identifier
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Record contained no addresses
    #[error("empty address record")]
    EmptyRecord,

    /// Address with no components
    #[error("empty address")]
    EmptyAddress,

    /// Address that a record would split or reassign to another peer
    #[error("address cannot be stored in a record: {0}")]
    UnrecordableAddress(String),

    /// Record address without a trailing peer id
    #[error("record address is missing its peer id: {0}")]
    MissingPeerId(String),

    /// Record addresses disagree on the owning peer
    #[error("record mixes peer ids: expected {expected}, found {found}")]
    PeerIdMismatch { expected: String, found: String },
}
