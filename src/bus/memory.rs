//! In-process brokers.
//!
//! [`MemoryLog`] keeps per-group read positions and the records some
//! group has yet to read, so it replays like a real log. [`MemoryPubSub`]
//! only forwards to whoever is subscribed at publish time. Several buses may
//! share one broker to stand in for several instances in tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::log::{LogBroker, LogConsumer};
use super::pubsub::{PubSubMessage, PubSubServer, PubSubSink};
use crate::config::OffsetReset;
use crate::error::BusError;

// ============================================================================
// Durable log
// ============================================================================

/// Records kept per topic beyond what groups still need.
pub const DEFAULT_RETENTION: usize = 10_000;

struct TopicLog {
    records: VecDeque<Bytes>,
    /// Absolute offset of `records[0]`.
    base: usize,
    /// group -> absolute offset of the next record to read
    offsets: HashMap<String, usize>,
    appended: watch::Sender<usize>,
}

impl TopicLog {
    fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            records: VecDeque::new(),
            base: 0,
            offsets: HashMap::new(),
            appended,
        }
    }

    fn end(&self) -> usize {
        self.base + self.records.len()
    }

    /// Drop what every group has read, and anything past `retention`.
    /// A `latest` log with no group has no future reader for what it holds.
    fn trim(&mut self, reset: OffsetReset, retention: usize) {
        let end = self.end();
        let low = self.offsets.values().copied().min();
        let keep_from = match (low, reset) {
            (Some(low), _) => low,
            (None, OffsetReset::Latest) => end,
            (None, OffsetReset::Earliest) => self.base,
        }
        .max(end.saturating_sub(retention));
        while self.base < keep_from && self.records.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// Single-partition log per topic, kept in memory.
///
/// Records are released once every consumer group has read them, and a
/// topic holds at most `retention` records regardless. A group whose
/// position fell below the retained range resumes at the oldest record.
pub struct MemoryLog {
    topics: Arc<Mutex<HashMap<String, TopicLog>>>,
    reset: OffsetReset,
    retention: usize,
}

impl MemoryLog {
    pub fn new(reset: OffsetReset) -> Self {
        Self::with_retention(reset, DEFAULT_RETENTION)
    }

    pub fn with_retention(reset: OffsetReset, retention: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            reset,
            retention: retention.max(1),
        }
    }

    /// Number of records currently held for `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.records.len())
    }

    /// Number of topics with records or consumer groups.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }
}

#[async_trait]
impl LogBroker for MemoryLog {
    async fn produce(&self, topic: &str, _key: &str, payload: Bytes) -> Result<(), BusError> {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
        log.records.push_back(payload);
        log.trim(self.reset, self.retention);
        let end = log.end();
        if log.records.is_empty() && log.offsets.is_empty() {
            topics.remove(topic);
        } else {
            log.appended.send_replace(end);
        }
        Ok(())
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn LogConsumer>, BusError> {
        let mut topics = self.topics.lock();
        let log = topics.entry(topic.to_string()).or_insert_with(TopicLog::new);
        let start = match self.reset {
            OffsetReset::Earliest => log.base,
            OffsetReset::Latest => log.end(),
        };
        log.offsets.entry(group.to_string()).or_insert(start);
        Ok(Box::new(MemoryLogConsumer {
            topics: self.topics.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            reset: self.reset,
            retention: self.retention,
            appended: log.appended.subscribe(),
        }))
    }

    async fn close(&self) -> Result<(), BusError> {
        // Shared by every bus in the process; groups release what they read.
        Ok(())
    }
}

struct MemoryLogConsumer {
    topics: Arc<Mutex<HashMap<String, TopicLog>>>,
    topic: String,
    group: String,
    reset: OffsetReset,
    retention: usize,
    appended: watch::Receiver<usize>,
}

impl MemoryLogConsumer {
    fn take_next(&mut self) -> Option<Bytes> {
        let mut topics = self.topics.lock();
        let log = topics.get_mut(&self.topic)?;
        let base = log.base;
        let offset = log.offsets.entry(self.group.clone()).or_insert(base);
        *offset = (*offset).max(base);
        let record = log.records.get(*offset - base)?.clone();
        *offset += 1;
        log.trim(self.reset, self.retention);
        Some(record)
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn next(&mut self) -> Result<Bytes, BusError> {
        loop {
            // Mark the current version seen before looking, so an append
            // racing with the check still wakes us.
            self.appended.borrow_and_update();
            if let Some(record) = self.take_next() {
                return Ok(record);
            }
            self.appended
                .changed()
                .await
                .map_err(|_| BusError::Closed)?;
        }
    }
}

// ============================================================================
// Pub/sub
// ============================================================================

struct Subscriber {
    channels: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

/// Fire-and-forget channel fan-out. Nothing is stored.
#[derive(Default)]
pub struct MemoryPubSub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubServer for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        let mut receivers = 0;
        for subscriber in subscribers.iter() {
            if subscriber.channels.lock().contains(channel) {
                let message = PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.tx.send(message).is_ok() {
                    receivers += 1;
                }
            }
        }
        Ok(receivers)
    }

    async fn connect(
        &self,
    ) -> Result<(Box<dyn PubSubSink>, BoxStream<'static, PubSubMessage>), BusError> {
        let channels = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            channels: channels.clone(),
            tx,
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();
        Ok((Box::new(MemorySink { channels }), stream))
    }
}

struct MemorySink {
    channels: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl PubSubSink for MemorySink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.channels.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.channels.lock().remove(channel);
        Ok(())
    }
}
