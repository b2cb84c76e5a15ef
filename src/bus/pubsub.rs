//! Pub/sub cache backend.
//!
//! One shared subscription connection. Activating a topic issues a
//! `SUBSCRIBE` on it; a single consume loop reads the multiplexed stream and
//! dispatches by channel name. Nothing is stored: a record published while no
//! instance is subscribed to its channel is gone.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::registry::HandlerRegistry;
use super::{Envelope, EventBus, EventHandler, Topic};
use crate::error::BusError;
use crate::metrics;

const BACKEND: &str = "pub-sub-cache";

#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Client side of a pub/sub server.
#[async_trait]
pub trait PubSubServer: Send + Sync + 'static {
    /// Returns how many subscribers received the message.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Open a subscription connection, split into its command half and its
    /// message stream.
    async fn connect(
        &self,
    ) -> Result<(Box<dyn PubSubSink>, BoxStream<'static, PubSubMessage>), BusError>;
}

#[async_trait]
pub trait PubSubSink: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError>;
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError>;
}

pub struct PubSubBus<P: PubSubServer> {
    server: Arc<P>,
    instance: String,
    registry: Arc<HandlerRegistry>,
    /// Also serialises subscription changes.
    sink: tokio::sync::Mutex<Box<dyn PubSubSink>>,
    shutdown: CancellationToken,
    consume_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<P: PubSubServer> PubSubBus<P> {
    /// Open the shared subscription connection and start the consume loop.
    pub async fn connect(server: Arc<P>, instance: impl Into<String>) -> Result<Self, BusError> {
        let (sink, stream) = server.connect().await?;
        let registry = Arc::new(HandlerRegistry::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consume(stream, registry.clone(), shutdown.clone()));
        Ok(Self {
            server,
            instance: instance.into(),
            registry,
            sink: tokio::sync::Mutex::new(sink),
            shutdown,
            consume_task: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[instrument(skip_all)]
async fn consume(
    mut stream: BoxStream<'static, PubSubMessage>,
    registry: Arc<HandlerRegistry>,
    cancel: CancellationToken,
) {
    debug!("pub/sub consumer started");
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let Some(message) = message else {
            warn!("pub/sub stream ended");
            break;
        };
        let topic = match Topic::parse(&message.channel) {
            Ok(topic) => topic,
            Err(e) => {
                warn!(error = %e, "ignoring message on unknown channel");
                continue;
            }
        };
        match Envelope::decode(topic.as_str(), &message.payload) {
            Ok(envelope) => registry.dispatch(BACKEND, &topic, &envelope).await,
            Err(e) => warn!(%topic, error = %e, "skipping undecodable message"),
        }
    }
    debug!("pub/sub consumer stopped");
}

#[async_trait]
impl<P: PubSubServer> EventBus for PubSubBus<P> {
    async fn publish_envelope(&self, topic: &Topic, envelope: Envelope) -> Result<(), BusError> {
        self.ensure_open()?;
        let payload = envelope.encode()?;
        let result = self.server.publish(topic.as_str(), payload).await;
        metrics::record_bus_publish(BACKEND, result.is_ok());
        if let Ok(0) = result {
            debug!(%topic, "published with no subscribers; message dropped");
        }
        result.map(|_| ())
    }

    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut sink = self.sink.lock().await;
        if !self.registry.add(topic, handler.clone()) {
            return Ok(());
        }
        if let Err(e) = sink.subscribe(topic.as_str()).await {
            self.registry.remove(topic, &handler);
            return Err(e);
        }
        debug!(%topic, "channel subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic, handler: &Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut sink = self.sink.lock().await;
        if self.registry.remove(topic, handler) && !self.closed.load(Ordering::Acquire) {
            sink.unsubscribe(topic.as_str()).await?;
            debug!(%topic, "channel unsubscribed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let handle = self.consume_task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "pub/sub consumer ended abnormally");
        }

        let mut sink = self.sink.lock().await;
        for topic in self.registry.topics() {
            if let Err(e) = sink.unsubscribe(topic.as_str()).await {
                debug!(%topic, error = %e, "unsubscribe during close failed");
            }
        }
        self.registry.clear();
        info!(instance = %self.instance, "pub/sub bus closed");
        Ok(())
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Event;
    use crate::bus::{EventKind, MemoryPubSub, handler_fn};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |_, envelope| {
            let _ = tx.send(envelope.clone());
            Ok(())
        });
        (handler, rx)
    }

    fn message(text: &str) -> Event {
        Event::new(EventKind::Message, serde_json::json!({ "text": text })).in_room("r")
    }

    #[tokio::test]
    async fn messages_without_subscribers_are_lost() {
        let server = Arc::new(MemoryPubSub::new());
        let bus = PubSubBus::connect(server, "a").await.unwrap();
        let topic = Topic::room("r");

        bus.publish(&topic, &message("early")).await.unwrap();

        let (handler, mut rx) = collector();
        bus.subscribe(&topic, handler).await.unwrap();
        bus.publish(&topic, &message("late")).await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.payload["text"], "late");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_is_by_channel_name() {
        let server = Arc::new(MemoryPubSub::new());
        let bus = PubSubBus::connect(server, "a").await.unwrap();
        let (room_handler, mut room_rx) = collector();
        let (user_handler, mut user_rx) = collector();
        bus.subscribe(&Topic::room("1"), room_handler).await.unwrap();
        bus.subscribe(&Topic::user("1"), user_handler).await.unwrap();

        bus.publish_direct("1", &message("direct")).await.unwrap();
        assert_eq!(user_rx.recv().await.unwrap().event.payload["text"], "direct");
        assert!(room_rx.try_recv().is_err());
        bus.close().await.unwrap();
    }

    #[tokio::test]
    async fn last_unsubscribe_stops_delivery() {
        let server = Arc::new(MemoryPubSub::new());
        let bus = PubSubBus::connect(server.clone(), "a").await.unwrap();
        let topic = Topic::room("r");
        let (handler, _rx) = collector();
        bus.subscribe(&topic, handler.clone()).await.unwrap();
        assert_eq!(server.publish("room:r", Bytes::from_static(b"{}")).await.unwrap(), 1);
        bus.unsubscribe(&topic, &handler).await.unwrap();
        assert_eq!(server.publish("room:r", Bytes::from_static(b"{}")).await.unwrap(), 0);
        bus.close().await.unwrap();
    }
}
