//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{BusBackend, CacheStore, Config};
use std::collections::HashSet;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.instance must not be empty")]
    MissingInstance,
    #[error("connection.max_connections must be greater than 0")]
    ZeroMaxConnections,
    #[error("connection.ping_interval_secs must be greater than 0")]
    ZeroPingInterval,
    #[error("connection.pong_wait_secs ({pong_wait}) must be longer than ping_interval_secs ({ping_interval})")]
    PongWaitTooShort { ping_interval: u64, pong_wait: u64 },
    #[error("hub.outbound_queue must be greater than 0")]
    ZeroOutboundQueue,
    #[error("hub.sweep_interval_secs must be greater than 0")]
    ZeroSweepInterval,
    #[error("tracker.connection_ttl_secs must be greater than 0")]
    ZeroConnectionTtl,
    #[error("bus.backend = \"{backend}\" needs the `{feature}` feature when bus.embedded = false")]
    BackendNotCompiled {
        backend: &'static str,
        feature: &'static str,
    },
    #[error("tracker.store = \"redis\" needs the `redis` feature")]
    RedisStoreNotCompiled,
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("room {0} is declared more than once")]
    DuplicateRoom(String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    }
    if config.server.instance.is_empty() {
        errors.push(ValidationError::MissingInstance);
    }

    let conn = &config.connection;
    if conn.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }
    if conn.ping_interval_secs == 0 {
        errors.push(ValidationError::ZeroPingInterval);
    } else if conn.pong_wait_secs <= conn.ping_interval_secs {
        errors.push(ValidationError::PongWaitTooShort {
            ping_interval: conn.ping_interval_secs,
            pong_wait: conn.pong_wait_secs,
        });
    }

    if config.hub.outbound_queue == 0 {
        errors.push(ValidationError::ZeroOutboundQueue);
    }
    if config.hub.sweep_interval_secs == 0 {
        errors.push(ValidationError::ZeroSweepInterval);
    }
    if config.tracker.connection_ttl_secs == 0 {
        errors.push(ValidationError::ZeroConnectionTtl);
    }

    if !config.bus.embedded {
        match config.bus.backend {
            BusBackend::DurableLog if !cfg!(feature = "kafka") => {
                errors.push(ValidationError::BackendNotCompiled {
                    backend: BusBackend::DurableLog.as_str(),
                    feature: "kafka",
                });
            }
            BusBackend::PubSubCache if !cfg!(feature = "redis") => {
                errors.push(ValidationError::BackendNotCompiled {
                    backend: BusBackend::PubSubCache.as_str(),
                    feature: "redis",
                });
            }
            _ => {}
        }
    }
    if config.tracker.store == CacheStore::Redis && !cfg!(feature = "redis") {
        errors.push(ValidationError::RedisStoreNotCompiled);
    }

    let mut seen = HashSet::new();
    for room in &config.rooms {
        if room.id.is_empty() {
            errors.push(ValidationError::EmptyRoomId);
        } else if !seen.insert(room.id.as_str()) {
            errors.push(ValidationError::DuplicateRoom(room.id.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
