//! Tunnel configuration
//!
//! Built by the daemons from their command lines and handed to the
//! [`Establisher`](crate::Establisher).

use crate::{DEFAULT_AGENT_LISTEN_PORT, DEFAULT_SERVER_LISTEN_PORT, SERVER_ADDR_NAME};
use edgemesh_tunnel_net::RelayLimits;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Node name must not be empty")]
    EmptyNodeName,
    #[error("Invalid directory name {0:?}")]
    InvalidName(String),
    #[error("Relay poll interval must be positive")]
    ZeroPollInterval,
}

/// Role specific settings
#[derive(Clone, Debug)]
pub enum Role {
    /// Edge node behind NAT
    Agent { enable_hole_punching: bool },
    /// Publicly reachable rendezvous and relay node
    Server {
        /// Address published to the directory
        public_ip: Option<IpAddr>,
        /// Published port when it differs from the listen port
        public_port: Option<u16>,
        limits: RelayLimits,
    },
}

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub node_name: String,
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    /// Directory name of the relay server
    pub relay_name: String,
    pub role: Role,
    /// Delay between relay-circuit address checks during bring-up
    pub relay_poll_interval: Duration,
    /// Interval between republishing the address set; zero disables
    pub republish_interval: Duration,
}

impl TunnelConfig {
    /// Agent defaults: `0.0.0.0:10006`, hole punching on
    pub fn agent(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_AGENT_LISTEN_PORT,
            relay_name: SERVER_ADDR_NAME.to_string(),
            role: Role::Agent {
                enable_hole_punching: true,
            },
            relay_poll_interval: Duration::from_secs(2),
            republish_interval: Duration::from_secs(30),
        }
    }

    /// Server defaults: `0.0.0.0:10004`, relay service on
    pub fn server(node_name: impl Into<String>) -> Self {
        Self {
            listen_port: DEFAULT_SERVER_LISTEN_PORT,
            role: Role::Server {
                public_ip: None,
                public_port: None,
                limits: RelayLimits::default(),
            },
            ..Self::agent(node_name)
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, Role::Server { .. })
    }

    /// Name this node publishes its own record under
    pub fn publish_name(&self) -> &str {
        match self.role {
            Role::Agent { .. } => &self.node_name,
            Role::Server { .. } => &self.relay_name,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        for name in [&self.node_name, &self.relay_name] {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
            if !valid {
                return Err(ConfigError::InvalidName(name.clone()));
            }
        }
        if self.relay_poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}
