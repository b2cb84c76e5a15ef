//! Several instances in one process, sharing one in-memory broker.

use roomlink::admission::BufferPool;
use roomlink::bus::{
    Envelope, EventBus, EventHandler, LogBus, MemoryLog, MemoryPubSub, PubSubBus, handler_fn,
};
use roomlink::config::HubConfig;
use roomlink::hub::{ChannelTransport, ConnectionState, OutboundQueue, PresenceHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One simulated instance: its own bus client and hub.
pub struct Instance {
    pub bus: Arc<dyn EventBus>,
    pub hub: Arc<PresenceHub>,
}

#[allow(dead_code)]
impl Instance {
    fn with_bus(bus: Arc<dyn EventBus>) -> Self {
        let hub = PresenceHub::new(Arc::clone(&bus), BufferPool::new(1024, 8), HubConfig::default());
        Self { bus, hub }
    }

    pub async fn stop(&self) {
        self.hub.stop().await;
        let _ = self.bus.close().await;
    }
}

/// Instance on a shared durable log, in its own consumer group.
#[allow(dead_code)]
pub fn log_instance(log: &Arc<MemoryLog>, name: &str) -> Instance {
    let bus = LogBus::new(
        Arc::clone(log),
        name,
        format!("roomlink.{name}"),
        Duration::from_millis(10),
    );
    Instance::with_bus(Arc::new(bus))
}

/// Instance on a shared pub/sub server.
#[allow(dead_code)]
pub async fn pubsub_instance(server: &Arc<MemoryPubSub>, name: &str) -> Instance {
    let bus = PubSubBus::connect(Arc::clone(server), name)
        .await
        .expect("pub/sub connect");
    Instance::with_bus(Arc::new(bus))
}

/// A hub connection backed by a queue the test can read.
#[allow(dead_code)]
pub fn connection(room: &str, user: &str, queue: usize) -> (Arc<ConnectionState>, OutboundQueue) {
    let (transport, rx) = ChannelTransport::channel(queue);
    (ConnectionState::new(room, user, Arc::new(transport)), rx)
}

/// Bus handler that forwards every envelope to a channel.
pub struct Collector;

#[allow(dead_code)]
impl Collector {
    pub fn channel() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |_, envelope| {
            let _ = tx.send(envelope.clone());
            Ok(())
        });
        (handler, rx)
    }
}
