//! edgemesh-server - rendezvous and relay for edge nodes
//!
//! The server is publicly reachable. It publishes its address under the
//! well-known directory name and relays streams for agents that cannot reach
//! each other directly.

pub mod config;

pub use config::Config;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
pub fn init_logging(format: &str) {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["edgemesh_server=info", "edgemesh_tunnel=info", "edgemesh_tunnel_net=info"] {
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
