//! edgemesh-agent - tunnel endpoint for edge nodes
//!
//! The agent:
//! - Derives its peer identity from the node certificate key
//! - Resolves the tunnel server from the address directory
//! - Keeps a relay reservation and publishes its reachable addresses
//! - Proxies TCP connections to and from other nodes

pub mod config;

pub use config::{Config, ForwardRule};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
pub fn init_logging(format: &str) {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["edgemesh_agent=info", "edgemesh_tunnel=info", "edgemesh_tunnel_net=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
