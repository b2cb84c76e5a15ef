//! Handler bookkeeping shared by every backend.

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

use super::{Envelope, Topic};
use crate::error::BusError;
use crate::metrics;

/// Receives events for the topics it is subscribed to.
///
/// Handlers run on the backend's consume task. A slow handler delays later
/// records of the same topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Topic, &Envelope) -> Result<(), BusError> + Send + Sync,
{
    async fn handle(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError> {
        (self.0)(topic, envelope)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Topic, &Envelope) -> Result<(), BusError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// topic -> handlers, behind one mutex. Handler identity is the `Arc` pointer.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Mutex<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    /// Returns true when this is the topic's first handler.
    pub fn add(&self, topic: &Topic, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(topic.clone()).or_default();
        list.push(handler);
        list.len() == 1
    }

    /// Returns true when the topic has no handlers left afterwards.
    /// Removing a handler that was never added is a no-op returning false.
    pub fn remove(&self, topic: &Topic, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(topic) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            handlers.remove(topic);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self, topic: &Topic) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .lock()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.handlers.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Run every handler for `topic`, in registration order. Errors and
    /// panics are logged and counted; they never reach the consume loop.
    pub async fn dispatch(&self, backend: &'static str, topic: &Topic, envelope: &Envelope) {
        for handler in self.snapshot(topic) {
            match AssertUnwindSafe(handler.handle(topic, envelope))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::record_handler_failure(backend);
                    warn!(%topic, backend, error = %e, "event handler failed");
                }
                Err(_) => {
                    metrics::record_handler_failure(backend);
                    error!(%topic, backend, "event handler panicked");
                }
            }
        }
    }
}
