//! Network listener configuration.

use serde::Deserialize;
use std::net::SocketAddr;

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to (e.g., "0.0.0.0:1443").
    pub address: SocketAddr,
    /// Allowed Origin headers for the WebSocket handshake.
    /// Empty list allows all origins.
    #[serde(default)]
    pub allow_origins: Vec<String>,
}
