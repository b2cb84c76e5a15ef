//! Per-connection state owned by the hub once registered.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::transport::Transport;
use crate::error::DeliveryError;

/// One client connection in one room.
///
/// `online` is only ever true while a transport is attached; going offline
/// detaches and closes it in the same step.
pub struct ConnectionState {
    room_id: String,
    user_id: String,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    last_seen: Mutex<Instant>,
    online: AtomicBool,
}

impl ConnectionState {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            transport: Mutex::new(Some(transport)),
            last_seen: Mutex::new(Instant::now()),
            online: AtomicBool::new(false),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Returns false when the transport was already gone.
    pub(crate) fn mark_online(&self) -> bool {
        let transport = self.transport.lock();
        if transport.as_ref().is_none_or(|t| t.is_closed()) {
            return false;
        }
        self.online.store(true, Ordering::Release);
        drop(transport);
        self.touch();
        true
    }

    /// Detach and close the transport. Returns true if this call took the
    /// connection offline.
    pub(crate) fn mark_offline(&self) -> bool {
        let detached = {
            let mut transport = self.transport.lock();
            self.online.store(false, Ordering::Release);
            transport.take()
        };
        match detached {
            Some(transport) => {
                transport.close();
                self.touch();
                true
            }
            None => false,
        }
    }

    /// Queue one frame. Never waits on the peer.
    pub(crate) fn send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) if self.is_online() => transport.send(frame),
            _ => Err(DeliveryError::Closed),
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("room_id", &self.room_id)
            .field("user_id", &self.user_id)
            .field("online", &self.is_online())
            .finish()
    }
}
