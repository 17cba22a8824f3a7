//! edgemesh tunnel
//!
//! Gives every edge node a peer identity, publishes its reachable addresses
//! to a shared directory, establishes connectivity across NAT and proxies
//! TCP connections as streams over the resulting peer-to-peer links.
//!
//! - [`directory`]: Node name to address record store
//! - [`cert`]: Identity key material from the node certificate
//! - [`config`]: Role configuration for agents and servers
//! - [`establisher`]: Bring-up state machine
//! - [`proxy`]: TCP-over-stream proxy service

pub mod cert;
pub mod config;
pub mod directory;
pub mod establisher;
pub mod proxy;

pub use cert::{CertEvent, CertManager, FileCertManager, StaticCertManager, TunnelCertificate};
pub use config::{Role, TunnelConfig};
pub use directory::{AddressDirectory, DirectoryBackend, DirectoryError, FileBackend, MemoryBackend, SetOutcome};
pub use establisher::{EstablishError, Establisher, MeshNode, Phase};
pub use proxy::{ProxyError, ProxyService, TunnelStream, PROXY_PROTOCOL};

/// Directory name under which the relay server publishes itself
pub const SERVER_ADDR_NAME: &str = "edgemeshserver";

/// Default tunnel port of an agent
pub const DEFAULT_AGENT_LISTEN_PORT: u16 = 10006;

/// Default tunnel port of the server
pub const DEFAULT_SERVER_LISTEN_PORT: u16 = 10004;
