//! Durable log backend.
//!
//! One shared producer, one consumer-group reader per active topic. Records
//! on a topic are handed to handlers one at a time in log order. A handler
//! failure is logged and the record is not retried, so one poisoned record
//! cannot wedge the topic.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::registry::HandlerRegistry;
use super::{Envelope, EventBus, EventHandler, Topic};
use crate::error::BusError;
use crate::metrics;

const BACKEND: &str = "durable-log";

/// Client side of a partitioned, replayable log.
#[async_trait]
pub trait LogBroker: Send + Sync + 'static {
    /// Append a record. `key` selects the partition.
    async fn produce(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BusError>;

    /// Open a reader for `topic` in consumer group `group`. The reader resumes
    /// from the group's committed position, or the broker's reset policy when
    /// the group has none.
    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, BusError>;

    /// Flush and release the producer.
    async fn close(&self) -> Result<(), BusError>;
}

#[async_trait]
pub trait LogConsumer: Send {
    /// Wait for the next record and commit past it. Must be cancel safe.
    async fn next(&mut self) -> Result<Bytes, BusError>;
}

struct ConsumerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LogBus<L: LogBroker> {
    broker: Arc<L>,
    instance: String,
    group: String,
    read_retry_backoff: Duration,
    registry: Arc<HandlerRegistry>,
    /// Serialises subscription changes; held across consumer creation.
    consumers: tokio::sync::Mutex<HashMap<Topic, ConsumerTask>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<L: LogBroker> LogBus<L> {
    pub fn new(
        broker: Arc<L>,
        instance: impl Into<String>,
        group: impl Into<String>,
        read_retry_backoff: Duration,
    ) -> Self {
        Self {
            broker,
            instance: instance.into(),
            group: group.into(),
            read_retry_backoff,
            registry: Arc::new(HandlerRegistry::default()),
            consumers: tokio::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn spawn_consumer(&self, topic: Topic, consumer: Box<dyn LogConsumer>) -> ConsumerTask {
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(consume(
            topic,
            consumer,
            self.registry.clone(),
            cancel.clone(),
            self.read_retry_backoff,
        ));
        ConsumerTask { cancel, handle }
    }
}

#[instrument(skip_all, fields(%topic))]
async fn consume(
    topic: Topic,
    mut consumer: Box<dyn LogConsumer>,
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
    backoff: Duration,
) {
    debug!("consumer started");
    loop {
        let record = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            record = consumer.next() => record,
        };
        match record {
            Ok(raw) => match Envelope::decode(topic.as_str(), &raw) {
                Ok(envelope) => registry.dispatch(BACKEND, &topic, &envelope).await,
                Err(e) => warn!(error = %e, "skipping undecodable record"),
            },
            Err(BusError::Closed) => break,
            Err(e) => {
                warn!(error = %e, "log read failed; backing off");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    debug!("consumer stopped");
}

#[async_trait]
impl<L: LogBroker> EventBus for LogBus<L> {
    async fn publish_envelope(&self, topic: &Topic, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;
        let payload = envelope.encode()?;
        let result = self.broker.produce(topic.as_str(), topic.id(), payload).await;
        metrics::record_bus_publish(BACKEND, result.is_ok());
        result
    }

    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut consumers = self.consumers.lock().await;
        if !self.registry.add(topic, handler.clone()) {
            return Ok(());
        }
        match self.broker.consumer(topic.as_str(), &self.group).await {
            Ok(consumer) => {
                consumers.insert(topic.clone(), self.spawn_consumer(topic.clone(), consumer));
                debug!(%topic, group = %self.group, "topic activated");
                Ok(())
            }
            Err(e) => {
                self.registry.remove(topic, &handler);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, topic: &Topic, handler: &Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut consumers = self.consumers.lock().await;
        if self.registry.remove(topic, handler)
            && let Some(task) = consumers.remove(topic)
        {
            task.cancel.cancel();
            // Joined here so nothing is read for a topic nobody handles.
            if let Err(e) = task.handle.await {
                warn!(%topic, error = %e, "consumer task ended abnormally");
            }
            debug!(%topic, "topic released");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, task)| task.handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "consumer task ended abnormally");
            }
        }
        self.registry.clear();
        self.broker.close().await?;
        info!(instance = %self.instance, "durable log bus closed");
        Ok(())
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
