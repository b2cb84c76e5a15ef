//! Event bus backend configuration.

use serde::Deserialize;
use std::time::Duration;

/// Which event distribution backend to run. Resolved once at startup.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BusBackend {
    /// Durable, partitioned, replayable log (Kafka in production).
    #[default]
    DurableLog,
    /// Non-durable in-memory pub/sub server (Redis in production).
    PubSubCache,
}

impl BusBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DurableLog => "durable-log",
            Self::PubSubCache => "pub-sub-cache",
        }
    }
}

/// Where a consumer group without committed offsets starts reading.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Backend kind (default: durable-log).
    #[serde(default)]
    pub backend: BusBackend,
    /// Run the backend in-process instead of connecting to a broker (default: true).
    /// Only meaningful for a single instance; events never leave the process.
    #[serde(default = "default_embedded")]
    pub embedded: bool,
    /// Seconds to back off after a failed backend read (default: 1).
    #[serde(default = "default_retry_backoff")]
    pub read_retry_backoff_secs: u64,
    /// Durable-log settings.
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Pub/sub-cache settings.
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            embedded: default_embedded(),
            read_retry_backoff_secs: default_retry_backoff(),
            kafka: KafkaConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl BusConfig {
    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.read_retry_backoff_secs)
    }
}

/// Durable-log (Kafka) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers, comma separated (default: "localhost:9092").
    #[serde(default = "default_brokers")]
    pub brokers: String,
    /// Consumer group prefix; the instance id is appended (default: "roomlink").
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
    /// Start position for new consumer groups (default: latest).
    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
    /// Producer delivery timeout in milliseconds (default: 2000).
    #[serde(default = "default_producer_timeout")]
    pub producer_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_prefix: default_group_prefix(),
            auto_offset_reset: OffsetReset::default(),
            producer_timeout_ms: default_producer_timeout(),
        }
    }
}

impl KafkaConfig {
    /// Consumer group id for this instance.
    ///
    /// Each instance gets its own group so that every process sees every
    /// record of the topics it is interested in.
    pub fn group_id(&self, instance: &str) -> String {
        format!("{}.{}", self.group_prefix, instance)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_timeout_ms)
    }
}

/// Pub/sub-cache (Redis) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection URL (default: "redis://127.0.0.1:6379/0").
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_embedded() -> bool {
    true
}

fn default_retry_backoff() -> u64 {
    1
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_prefix() -> String {
    "roomlink".to_string()
}

fn default_producer_timeout() -> u64 {
    2000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
