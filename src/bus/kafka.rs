//! Kafka broker for the durable log backend.
//!
//! Kafka topic names cannot contain `:`, so `room:42` is stored as `room.42`.
//! The record key is the room or user id, which keeps every record of one
//! topic on one partition and therefore in order.

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::debug;

use super::log::{LogBroker, LogConsumer};
use crate::config::KafkaConfig;
use crate::error::BusError;

fn backend_error(err: rdkafka::error::KafkaError) -> BusError {
    BusError::Backend(err.to_string())
}

/// Map a bus topic onto a legal Kafka topic name.
fn kafka_topic(topic: &str) -> String {
    topic.replace(':', ".")
}

pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.producer_timeout_ms.to_string())
            .set("acks", "1")
            .set("linger.ms", "5")
            .create()
            .map_err(backend_error)?;
        debug!(brokers = %config.brokers, "kafka producer created");
        Ok(Self {
            producer,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl LogBroker for KafkaBroker {
    async fn produce(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError> {
        let name = kafka_topic(topic);
        let record = FutureRecord::to(&name).key(key).payload(payload.as_ref());
        self.producer
            .send(record, Timeout::After(self.config.producer_timeout()))
            .await
            .map(|_| ())
            .map_err(|(err, _)| backend_error(err))
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", self.config.auto_offset_reset.as_str())
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(backend_error)?;
        let name = kafka_topic(topic);
        consumer.subscribe(&[name.as_str()]).map_err(backend_error)?;
        debug!(topic = %name, group, "kafka consumer subscribed");
        Ok(Box::new(KafkaConsumer { consumer }))
    }

    async fn close(&self) -> Result<(), BusError> {
        self.producer
            .flush(Timeout::After(Duration::from_secs(5)))
            .map_err(backend_error)
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl LogConsumer for KafkaConsumer {
    async fn next(&mut self) -> Result<Bytes, BusError> {
        let message = self.consumer.recv().await.map_err(backend_error)?;
        Ok(Bytes::copy_from_slice(message.payload().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_kafka_safe() {
        assert_eq!(kafka_topic("room:42"), "room.42");
        assert_eq!(kafka_topic("user:a:b"), "user.a.b");
    }
}
