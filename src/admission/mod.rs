//! Connection admission control.
//!
//! Every new connection passes three gates in order before any per-connection
//! resource is allocated:
//!
//! 1. the global token bucket (only when `rate_limit_per_second > 0`),
//! 2. the total connection cap,
//! 3. the per-origin cap (only when `max_connections_per_origin > 0`).
//!
//! Slots are reserved atomically, so concurrent connects cannot overshoot
//! either cap, and a refused connection leaves every counter as it was.
//! Accepted connections hold an [`AdmissionPermit`] that gives the slot back
//! when dropped.

mod liveness;
mod pool;

pub use liveness::{LivenessProbe, LivenessSettings, PingSink};
pub use pool::{BufferPool, PooledBuffer};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::AdmissionError;
use crate::metrics;

/// Type alias for governor's direct rate limiter.
type DirectRateLimiter = governor::DefaultDirectRateLimiter;

pub struct ConnectionAdmission {
    config: Arc<ConnectionConfig>,
    total: AtomicU32,
    per_origin: DashMap<IpAddr, u32>,
    limiter: Option<DirectRateLimiter>,
    buffers: Arc<BufferPool>,
}

impl ConnectionAdmission {
    pub fn new(config: Arc<ConnectionConfig>) -> Self {
        let limiter = NonZeroU32::new(config.rate_limit_per_second).map(|rate| {
            let burst = NonZeroU32::new(config.rate_burst).unwrap_or(rate);
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
        });
        let buffers = BufferPool::new(config.write_buffer_size, config.write_buffer_pool_size);
        Self {
            config,
            total: AtomicU32::new(0),
            per_origin: DashMap::new(),
            limiter,
            buffers,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run the gates for a connection from `origin` and reserve its slots.
    ///
    /// Callers that use this directly must pair every `Ok` with exactly one
    /// [`remove_connection`](Self::remove_connection); prefer [`admit`](Self::admit).
    pub fn handle_new_connection(&self, origin: IpAddr) -> Result<(), AdmissionError> {
        let result = self.try_reserve(origin);
        match &result {
            Ok(()) => metrics::connection_opened(),
            Err(e) => {
                metrics::record_admission_rejected(e.error_code());
                debug!(%origin, reason = e.error_code(), "connection refused");
            }
        }
        result
    }

    fn try_reserve(&self, origin: IpAddr) -> Result<(), AdmissionError> {
        if let Some(limiter) = &self.limiter
            && limiter.check().is_err()
        {
            return Err(AdmissionError::RateLimited);
        }

        let max = self.config.max_connections;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| AdmissionError::OverCapacity)?;

        if self.config.origin_limited() && !self.reserve_origin(origin) {
            self.total.fetch_sub(1, Ordering::AcqRel);
            return Err(AdmissionError::OverCapacityForOrigin);
        }
        Ok(())
    }

    /// Reserve a per-origin slot inside the map entry.
    fn reserve_origin(&self, origin: IpAddr) -> bool {
        let limit = self.config.max_connections_per_origin;
        match self.per_origin.entry(origin) {
            Entry::Occupied(mut entry) => {
                if *entry.get() >= limit {
                    return false;
                }
                *entry.get_mut() += 1;
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(1);
                true
            }
        }
    }

    /// Give back the slots taken by [`handle_new_connection`](Self::handle_new_connection).
    pub fn remove_connection(&self, origin: IpAddr) {
        let released = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!(%origin, "connection released more often than admitted");
            return;
        }
        metrics::connection_closed();

        if self.config.origin_limited()
            && let Entry::Occupied(mut entry) = self.per_origin.entry(origin)
        {
            if *entry.get() <= 1 {
                entry.remove();
            } else {
                *entry.get_mut() -= 1;
            }
        }
    }

    /// Admit a connection and tie the slot to the returned permit.
    pub fn admit(self: &Arc<Self>, origin: IpAddr) -> Result<AdmissionPermit, AdmissionError> {
        self.handle_new_connection(origin)?;
        Ok(AdmissionPermit {
            admission: Arc::clone(self),
            origin,
        })
    }

    pub fn active_connections(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    pub fn connections_for(&self, origin: IpAddr) -> u32 {
        self.per_origin.get(&origin).map_or(0, |n| *n)
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Protocol settings for accepted WebSocket streams.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut ws = WebSocketConfig::default();
        ws.write_buffer_size = self.config.write_buffer_size;
        // Must stay above write_buffer_size or every write errors.
        ws.max_write_buffer_size = self.config.write_buffer_size.saturating_mul(16).max(1);
        ws
    }

    pub fn liveness_settings(&self) -> LivenessSettings {
        LivenessSettings {
            ping_interval: self.config.ping_interval(),
            pong_wait: self.config.pong_wait(),
            write_timeout: self.config.write_timeout(),
        }
    }

    /// Start pinging through `sink`. The probe stops itself when a ping
    /// fails or the pong deadline passes; [`LivenessProbe::stop`] joins it.
    pub fn spawn_liveness_probe(&self, sink: Arc<dyn PingSink>) -> LivenessProbe {
        LivenessProbe::spawn(sink, self.liveness_settings())
    }
}

/// One admitted connection. Dropping it releases the slots exactly once.
pub struct AdmissionPermit {
    admission: Arc<ConnectionAdmission>,
    origin: IpAddr,
}

impl AdmissionPermit {
    pub fn origin(&self) -> IpAddr {
        self.origin
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.remove_connection(self.origin);
    }
}
