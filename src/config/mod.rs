//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Root config struct, server identity and loading
//! - [`listen`]: WebSocket listener configuration
//! - [`connection`]: Admission limits, buffers and liveness timings
//! - [`bus`]: Event bus backend selection and broker settings
//! - [`tracker`]: Fleet-wide connection tracking and hub tunables
//! - [`validation`]: Startup consistency checks

mod bus;
mod connection;
mod listen;
mod tracker;
mod types;
mod validation;

pub use bus::{BusBackend, BusConfig, KafkaConfig, OffsetReset, RedisConfig};
pub use connection::ConnectionConfig;
pub use listen::ListenConfig;
pub use tracker::{CacheStore, HubConfig, TrackerConfig};
pub use types::{Config, ConfigError, ServerConfig};
pub use validation::{ValidationError, validate};
