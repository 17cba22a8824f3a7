//! Configuration for edgemesh-agent

use clap::{ArgAction, Parser};
use edgemesh_tunnel::{Role, TunnelCertificate, TunnelConfig, DEFAULT_AGENT_LISTEN_PORT, SERVER_ADDR_NAME};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// edgemesh-agent - tunnel endpoint for an edge node
#[derive(Parser, Debug, Clone)]
#[command(name = "edgemesh-agent")]
#[command(about = "edgemesh tunnel agent for edge nodes behind NAT")]
pub struct Config {
    /// Run the tunnel module
    #[arg(long, env = "EDGEMESH_TUNNEL_ENABLE", default_value_t = true, action = ArgAction::Set)]
    pub enable: bool,

    /// Name of this node in the address directory; required when enabled
    #[arg(long, env = "MY_NODE_NAME", default_value = "")]
    pub node_name: String,

    /// IP to listen on for tunnel connections
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Port to listen on for tunnel connections
    #[arg(long, default_value_t = DEFAULT_AGENT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Shared directory holding the address records
    #[arg(long, default_value = "/var/lib/edgemesh/directory")]
    pub directory: PathBuf,

    /// Directory name of the tunnel server
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

    /// Delay between checks for a relay circuit address during startup
    #[arg(long, default_value = "2000")]
    pub relay_poll_interval_ms: u64,

    /// Interval between address republishes, 0 disables
    #[arg(long, default_value = "30")]
    pub republish_interval_secs: u64,

    /// Try to upgrade relayed connections to direct ones
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_hole_punching: bool,

    /// Local port forward, `<listen addr>=<node>/<host:port>` (repeatable)
    #[arg(long)]
    pub forward: Vec<ForwardRule>,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    ///
    /// Only the log format matters when the tunnel module is disabled.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        if !self.enable {
            return Ok(());
        }
        if self.node_name.is_empty() {
            anyhow::bail!("Node name cannot be empty (set --node-name or MY_NODE_NAME)");
        }
        if self.relay_poll_interval_ms == 0 {
            anyhow::bail!("Relay poll interval must be positive");
        }
        if self.tls_private_key_file.as_os_str().is_empty() {
            anyhow::bail!("A private key file is required");
        }
        self.tunnel_config().validate()?;
        Ok(())
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            listen_ip: self.listen_ip,
            listen_port: self.listen_port,
            relay_name: self.tunnel_server.clone(),
            role: Role::Agent {
                enable_hole_punching: self.enable_hole_punching,
            },
            relay_poll_interval: Duration::from_millis(self.relay_poll_interval_ms),
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            ..TunnelConfig::agent(self.node_name.clone())
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

/// A local listener forwarded to a target reachable from another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub local: SocketAddr,
    pub node: String,
    /// `host:port` dialed on `node`
    pub target: String,
}

impl FromStr for ForwardRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, remote) = s
            .split_once('=')
            .ok_or_else(|| format!("expected <listen addr>=<node>/<host:port>, got {s:?}"))?;
        let local = local
            .parse()
            .map_err(|e| format!("invalid listen address {local:?}: {e}"))?;
        let (node, target) = remote
            .split_once('/')
            .ok_or_else(|| format!("expected <node>/<host:port>, got {remote:?}"))?;
        if node.is_empty() {
            return Err("empty node name".to_string());
        }
        let port_ok = target
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !port_ok {
            return Err(format!("invalid target {target:?}, expected host:port"));
        }
        Ok(Self {
            local,
            node: node.to_string(),
            target: target.to_string(),
        })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}/{}", self.local, self.node, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["edgemesh-agent", "--node-name", "edge-1"]).unwrap();
        assert!(config.enable);
        assert!(config.enable_hole_punching);
        assert_eq!(config.listen_port, 10006);
        assert_eq!(config.tunnel_server, "edgemeshserver");
        config.validate().unwrap();

        let tunnel = config.tunnel_config();
        assert_eq!(tunnel.listen_addr().to_string(), "0.0.0.0:10006");
        assert_eq!(tunnel.relay_poll_interval, Duration::from_secs(2));
        assert_eq!(tunnel.republish_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "edgemesh-agent",
            "--node-name",
            "edge-1",
            "--enable-hole-punching",
            "false",
            "--forward",
            "127.0.0.1:8080=edge-2/10.0.0.9:80",
            "--forward",
            "127.0.0.1:5432=edge-3/db.local:5432",
        ])
        .unwrap();
        assert!(matches!(
            config.tunnel_config().role,
            Role::Agent {
                enable_hole_punching: false
            }
        ));
        assert_eq!(config.forward.len(), 2);
        assert_eq!(config.forward[1].node, "edge-3");
        assert_eq!(config.forward[1].target, "db.local:5432");
    }

    #[test]
    fn test_forward_rule_parsing() {
        let rule: ForwardRule = "0.0.0.0:9000=edge-2/[::1]:80".parse().unwrap();
        assert_eq!(rule.local.port(), 9000);
        assert_eq!(rule.target, "[::1]:80");
        assert_eq!(rule.to_string(), "0.0.0.0:9000=edge-2/[::1]:80");

        assert!("edge-2/10.0.0.1:80".parse::<ForwardRule>().is_err());
        assert!("127.0.0.1:1=/10.0.0.1:80".parse::<ForwardRule>().is_err());
        assert!("127.0.0.1:1=edge-2/10.0.0.1".parse::<ForwardRule>().is_err());
        assert!("nope=edge-2/10.0.0.1:80".parse::<ForwardRule>().is_err());
    }

    #[test]
    fn test_disabled_module_needs_no_node_name() {
        let config = Config::try_parse_from(["edgemesh-agent", "--node-name=", "--enable", "false"]).unwrap();
        assert!(!config.enable);
        config.validate().unwrap();

        let config = Config::try_parse_from(["edgemesh-agent", "--node-name="]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config::try_parse_from(["edgemesh-agent", "--node-name", "bad/name"]).unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from([
            "edgemesh-agent",
            "--node-name",
            "edge-1",
            "--log-format",
            "xml",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
