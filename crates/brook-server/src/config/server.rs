//! Listener configuration.

use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Connections beyond this are accepted and closed at once (0 = unbounded).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}
