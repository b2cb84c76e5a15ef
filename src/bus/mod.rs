//! Event distribution between instances.
//!
//! [`EventBus`] is the publish/subscribe contract the hub talks to. The
//! backend is picked once at startup by [`connect`]:
//!
//! - `durable-log` ([`LogBus`]): partitioned and replayable; a consumer group
//!   resumes where it left off.
//! - `pub-sub-cache` ([`PubSubBus`]): lower latency, no storage; whatever is
//!   published while nobody listens is lost.
//!
//! Both run in-process for single-instance deployments and tests
//! ([`MemoryLog`], [`MemoryPubSub`]), or against Kafka / Redis with the
//! `kafka` / `redis` features.

mod event;
#[cfg(feature = "kafka")]
mod kafka;
mod log;
mod memory;
mod pubsub;
#[cfg(feature = "redis")]
mod redis;
mod registry;
mod topic;

pub use event::{Envelope, Event, EventKind};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use log::{LogBroker, LogBus, LogConsumer};
pub use memory::{MemoryLog, MemoryPubSub};
pub use pubsub::{PubSubBus, PubSubMessage, PubSubServer, PubSubSink};
#[cfg(feature = "redis")]
pub use self::redis::RedisPubSub;
pub use registry::{EventHandler, FnHandler, handler_fn};
pub use topic::{Topic, TopicKind};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{BusBackend, BusConfig};
use crate::error::BusError;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `event` stamped with this bus's instance id.
    async fn publish(&self, topic: &Topic, event: &Event) -> Result<(), BusError> {
        self.publish_envelope(topic, Envelope::new(self.instance(), event.clone()))
            .await
    }

    /// Publish a prepared record as-is.
    async fn publish_envelope(&self, topic: &Topic, envelope: Envelope) -> Result<(), BusError>;

    /// Register `handler` for `topic`. The first handler on a topic starts
    /// the backend subscription. Registering the same handler twice delivers
    /// every event to it twice.
    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn EventHandler>) -> Result<(), BusError>;

    /// Remove `handler` (matched by pointer). Removing the last handler on a
    /// topic stops the backend subscription.
    async fn unsubscribe(&self, topic: &Topic, handler: &Arc<dyn EventHandler>) -> Result<(), BusError>;

    /// Send to one user's notification path.
    async fn publish_direct(&self, user_id: &str, event: &Event) -> Result<(), BusError> {
        self.publish(&Topic::user(user_id), event).await
    }

    /// Stop every consume loop and release the backend. Idempotent; later
    /// calls to the other methods fail with [`BusError::Closed`].
    async fn close(&self) -> Result<(), BusError>;

    /// Id stamped on every record this bus publishes.
    fn instance(&self) -> &str;

    fn backend(&self) -> &'static str;
}

/// Build the configured backend.
pub async fn connect(config: &BusConfig, instance: &str) -> Result<Arc<dyn EventBus>, BusError> {
    let bus: Arc<dyn EventBus> = match (config.backend, config.embedded) {
        (BusBackend::DurableLog, true) => {
            let log = Arc::new(MemoryLog::new(config.kafka.auto_offset_reset));
            Arc::new(LogBus::new(
                log,
                instance,
                config.kafka.group_id(instance),
                config.read_retry_backoff(),
            ))
        }
        (BusBackend::PubSubCache, true) => {
            Arc::new(PubSubBus::connect(Arc::new(MemoryPubSub::new()), instance).await?)
        }
        (BusBackend::DurableLog, false) => connect_kafka(config, instance)?,
        (BusBackend::PubSubCache, false) => connect_redis(config, instance).await?,
    };
    info!(
        backend = bus.backend(),
        embedded = config.embedded,
        instance,
        "event bus ready"
    );
    Ok(bus)
}

#[cfg(feature = "kafka")]
fn connect_kafka(config: &BusConfig, instance: &str) -> Result<Arc<dyn EventBus>, BusError> {
    let broker = Arc::new(KafkaBroker::new(&config.kafka)?);
    Ok(Arc::new(LogBus::new(
        broker,
        instance,
        config.kafka.group_id(instance),
        config.read_retry_backoff(),
    )))
}

#[cfg(not(feature = "kafka"))]
fn connect_kafka(_config: &BusConfig, _instance: &str) -> Result<Arc<dyn EventBus>, BusError> {
    Err(BusError::Backend(
        "durable-log broker support requires the `kafka` feature".to_string(),
    ))
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &BusConfig, instance: &str) -> Result<Arc<dyn EventBus>, BusError> {
    let server = Arc::new(RedisPubSub::open(&config.redis.url)?);
    Ok(Arc::new(PubSubBus::connect(server, instance).await?))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &BusConfig, _instance: &str) -> Result<Arc<dyn EventBus>, BusError> {
    Err(BusError::Backend(
        "pub-sub-cache server support requires the `redis` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedded_backends_connect() {
        let mut config = BusConfig::default();
        let bus = connect(&config, "node-a").await.unwrap();
        assert_eq!(bus.backend(), "durable-log");
        assert_eq!(bus.instance(), "node-a");
        bus.close().await.unwrap();

        config.backend = BusBackend::PubSubCache;
        let bus = connect(&config, "node-a").await.unwrap();
        assert_eq!(bus.backend(), "pub-sub-cache");
        bus.close().await.unwrap();
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn external_log_without_feature_is_an_error() {
        let config = BusConfig {
            embedded: false,
            ..BusConfig::default()
        };
        assert!(matches!(
            connect(&config, "a").await,
            Err(BusError::Backend(_))
        ));
    }
}
