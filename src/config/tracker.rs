//! Room connection tracking and presence hub configuration.

use serde::Deserialize;
use std::time::Duration;

/// Which store holds the fleet-wide active connection sets.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStore {
    /// Process-local store. Capacity is only enforced per process.
    #[default]
    Memory,
    /// Shared Redis store, enforced fleet-wide.
    Redis,
}

/// Room connection tracker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Backing store for active connection sets (default: memory).
    #[serde(default)]
    pub store: CacheStore,
    /// Redis URL for the connection store; falls back to `bus.redis.url`.
    pub redis_url: Option<String>,
    /// Seconds an active connection entry lives without a heartbeat (default: 300).
    #[serde(default = "default_connection_ttl")]
    pub connection_ttl_secs: u64,
    /// Grace period in seconds applied to both ends of a schedule window (default: 120).
    #[serde(default = "default_schedule_grace")]
    pub schedule_grace_secs: i64,
    /// Roles allowed to write into read-only rooms.
    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            store: CacheStore::default(),
            redis_url: None,
            connection_ttl_secs: default_connection_ttl(),
            schedule_grace_secs: default_schedule_grace(),
            privileged_roles: default_privileged_roles(),
        }
    }
}

impl TrackerConfig {
    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }

    pub fn schedule_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.schedule_grace_secs)
    }
}

/// Presence hub configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound frames queued per connection before writes count as failed (default: 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds an offline entry stays in the index before the sweeper drops it (default: 300).
    #[serde(default = "default_offline_retention")]
    pub offline_retention_secs: u64,
    /// Seconds between sweeper runs (default: 60).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
            offline_retention_secs: default_offline_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl HubConfig {
    pub fn offline_retention(&self) -> Duration {
        Duration::from_secs(self.offline_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_connection_ttl() -> u64 {
    300
}

fn default_schedule_grace() -> i64 {
    120
}

fn default_privileged_roles() -> Vec<String> {
    vec![
        "Administrator".to_string(),
        "Mentee".to_string(),
        "AE".to_string(),
    ]
}

fn default_outbound_queue() -> usize {
    256
}

fn default_offline_retention() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}
