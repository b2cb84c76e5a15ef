//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::bus::BusConfig;
use super::connection::ConnectionConfig;
use super::listen::ListenConfig;
use super::tracker::{HubConfig, TrackerConfig};
use super::validation::{ValidationError, validate};
use crate::tracker::Room;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity.
    pub server: ServerConfig,
    /// WebSocket listener.
    pub listen: ListenConfig,
    /// Admission control, buffering and liveness.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Event distribution backend.
    #[serde(default)]
    pub bus: BusConfig,
    /// Fleet-wide connection tracking.
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Presence hub tunables.
    #[serde(default)]
    pub hub: HubConfig,
    /// Rooms served by the static room directory.
    #[serde(default)]
    pub rooms: Vec<Room>,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        validate(&config).map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Human readable service name used in logs.
    pub name: String,
    /// Stable instance identifier. Used as the consumer-group suffix on the
    /// durable log and to recognise our own events coming back from the bus.
    /// A random one is generated when absent.
    #[serde(default = "default_instance")]
    pub instance: String,
    /// Prometheus metrics HTTP port (disabled when absent).
    pub metrics_port: Option<u16>,
}

fn default_instance() -> String {
    let instance = uuid::Uuid::new_v4().simple().to_string();
    tracing::warn!(
        %instance,
        "No server.instance configured - using an ephemeral id. Durable-log consumer offsets will not survive restarts."
    );
    instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusBackend, CacheStore};
    use std::io::Write;

    const MINIMAL: &str = r#"
        [server]
        name = "roomlink"
        instance = "node-a"

        [listen]
        address = "127.0.0.1:9000"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.server.instance, "node-a");
        assert_eq!(config.connection.max_connections, 50_000);
        assert_eq!(config.connection.max_connections_per_origin, 0);
        assert_eq!(config.bus.backend, BusBackend::DurableLog);
        assert!(config.bus.embedded);
        assert_eq!(config.tracker.store, CacheStore::Memory);
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn rooms_are_parsed() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            [[rooms]]
            id = "lobby"
            capacity = 2
            members = ["alice", "bob"]
            kind = "read-only"

            [rooms.schedule]
            kind = "loop"
            start_at = "2025-01-01T08:00:00Z"
            end_at = "2025-01-01T17:00:00Z"
            "#
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.rooms.len(), 1);
        let room = &config.rooms[0];
        assert_eq!(room.capacity, 2);
        assert!(room.is_read_only());
        assert!(room.is_member("alice"));
        assert!(room.schedule.is_some());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.name, "roomlink");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let toml = format!("{MINIMAL}\n[connection]\nping_interval_secs = 0\n");
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("ping_interval"));
    }
}
