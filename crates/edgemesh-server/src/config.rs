//! Configuration for edgemesh-server

use clap::Parser;
use edgemesh_tunnel::{Role, TunnelCertificate, TunnelConfig, DEFAULT_SERVER_LISTEN_PORT, SERVER_ADDR_NAME};
use edgemesh_tunnel_net::RelayLimits;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// edgemesh-server - rendezvous and relay for edge nodes
#[derive(Parser, Debug, Clone)]
#[command(name = "edgemesh-server")]
#[command(about = "edgemesh tunnel server: rendezvous and circuit relay for edge nodes")]
pub struct Config {
    /// Name of this node (identity derivation)
    #[arg(long, env = "MY_NODE_NAME")]
    pub node_name: String,

    /// IP to listen on for tunnel connections
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Port to listen on for tunnel connections
    #[arg(long, default_value_t = DEFAULT_SERVER_LISTEN_PORT)]
    pub listen_port: u16,

    /// Publicly reachable IP published to the directory
    #[arg(long, env = "EDGEMESH_PUBLIC_IP")]
    pub public_ip: Option<IpAddr>,

    /// Published port when the public port differs from the listen port
    #[arg(long)]
    pub public_port: Option<u16>,

    /// Shared directory holding the address records
    #[arg(long, default_value = "/var/lib/edgemesh/directory")]
    pub directory: PathBuf,

    /// Directory name the server publishes itself under
    #[arg(long, default_value = SERVER_ADDR_NAME)]
    pub tunnel_server: String,

    #[arg(long, default_value = "/etc/kubeedge/ca/rootCA.crt")]
    pub tls_ca_file: PathBuf,

    #[arg(long, default_value = "/etc/kubeedge/certs/server.crt")]
    pub tls_cert_file: PathBuf,

    /// Private key the tunnel identity is derived from
    #[arg(long, default_value = "/etc/kubeedge/certs/server.key")]
    pub tls_private_key_file: PathBuf,

    /// Token for the certificate authority
    #[arg(long, env = "CLOUDCORE_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Certificate authority endpoint
    #[arg(long, default_value = "")]
    pub http_server: String,

    /// Watch the key file for rotation
    #[arg(long)]
    pub rotate_certificates: bool,

    /// Maximum concurrent relay reservations
    #[arg(long, default_value = "128")]
    pub max_reservations: usize,

    /// Maximum concurrent relayed circuits
    #[arg(long, default_value = "256")]
    pub max_circuits: usize,

    /// Lifetime of a relay reservation in seconds
    #[arg(long, default_value = "3600")]
    pub reservation_ttl_secs: u64,

    /// Interval between address republishes, 0 disables
    #[arg(long, default_value = "30")]
    pub republish_interval_secs: u64,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("Node name cannot be empty (set --node-name or MY_NODE_NAME)");
        }
        if self.max_reservations == 0 || self.max_circuits == 0 {
            anyhow::bail!("Relay limits must be positive");
        }
        if self.reservation_ttl_secs < 2 {
            anyhow::bail!("Reservation TTL must be at least 2 seconds");
        }
        if let Some(ip) = self.public_ip {
            if ip.is_unspecified() {
                anyhow::bail!("Public IP {} is not routable", ip);
            }
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        self.tunnel_config().validate()?;
        Ok(())
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            listen_ip: self.listen_ip,
            listen_port: self.listen_port,
            relay_name: self.tunnel_server.clone(),
            role: Role::Server {
                public_ip: self.public_ip,
                public_port: self.public_port,
                limits: RelayLimits {
                    max_reservations: self.max_reservations,
                    max_circuits: self.max_circuits,
                    reservation_ttl: Duration::from_secs(self.reservation_ttl_secs),
                },
            },
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            ..TunnelConfig::server(self.node_name.clone())
        }
    }

    pub fn certificate(&self) -> TunnelCertificate {
        TunnelCertificate {
            tls_ca_file: self.tls_ca_file.clone(),
            tls_cert_file: self.tls_cert_file.clone(),
            tls_private_key_file: self.tls_private_key_file.clone(),
            token: self.token.clone(),
            http_server: self.http_server.clone(),
            rotate_certificates: self.rotate_certificates,
        }
    }
}
