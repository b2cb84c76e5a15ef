//! Connection admission, buffering and liveness configuration.

use serde::Deserialize;
use std::time::Duration;

/// Immutable connection tunables, created once at startup and shared by `Arc`.
///
/// The defaults target event-style deployments where many people connect
/// from one place: per-origin limiting and rate limiting are off.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum total connections allowed (default: 50000).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Maximum connections per origin; 0 disables the check (default: 0).
    #[serde(default)]
    pub max_connections_per_origin: u32,
    /// WebSocket read buffer size in bytes (default: 32 KiB).
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    /// WebSocket write buffer size in bytes (default: 32 KiB).
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    /// Request permessage compression (default: true).
    #[serde(default = "default_true")]
    pub enable_compression: bool,
    /// Seconds allowed for a single frame write (default: 10).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Seconds allowed for the handshake and for idle reads before pings kick in (default: 60).
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Seconds between liveness pings (default: 30).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds to wait for a pong before the connection is considered dead (default: 60).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    /// New connections per second; 0 disables rate limiting (default: 0).
    #[serde(default)]
    pub rate_limit_per_second: u32,
    /// Token bucket burst size (default: 0, i.e. same as the rate).
    #[serde(default)]
    pub rate_burst: u32,
    /// Number of idle write buffers kept in the shared pool (default: 1024).
    #[serde(default = "default_pool_size")]
    pub write_buffer_pool_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_origin: 0,
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            enable_compression: true,
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_wait_secs: default_pong_wait(),
            rate_limit_per_second: 0,
            rate_burst: 0,
            write_buffer_pool_size: default_pool_size(),
        }
    }
}

impl ConnectionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Whether the token bucket limiter is enabled.
    pub fn rate_limited(&self) -> bool {
        self.rate_limit_per_second > 0
    }

    /// Whether per-origin limiting is enabled.
    pub fn origin_limited(&self) -> bool {
        self.max_connections_per_origin > 0
    }
}

fn default_max_connections() -> u32 {
    50_000
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_true() -> bool {
    true
}

fn default_write_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_wait() -> u64 {
    60
}

fn default_pool_size() -> usize {
    1024
}
