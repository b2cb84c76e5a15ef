//! Assembly of the long-lived components.
//!
//! Order matters on the way up (the hub needs the bus, the gateway needs
//! everything) and on the way down: the hub stops first so no new records
//! are published, connection tasks finish their cleanup, then the bus
//! drains its consumers.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::admission::ConnectionAdmission;
use crate::bus::{self, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheStore, Config};
use crate::hub::PresenceHub;
use crate::network::{GatewayContext, SessionResolver};
use crate::tracker::{ConnectionCache, MemoryConnectionCache, RoomConnectionTracker, StaticRoomDirectory};

pub struct Service {
    pub bus: Arc<dyn EventBus>,
    pub admission: Arc<ConnectionAdmission>,
    pub directory: Arc<StaticRoomDirectory>,
    pub tracker: Arc<RoomConnectionTracker>,
    pub hub: Arc<PresenceHub>,
    connections: TaskTracker,
}

/// How long shutdown waits for connection tasks to release their slots.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

impl Service {
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        Self::build_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build with an injected clock for the tracker and its cache.
    pub async fn build_with_clock(config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let bus = bus::connect(&config.bus, &config.server.instance)
            .await
            .context("failed to connect event bus")?;

        let admission = Arc::new(ConnectionAdmission::new(Arc::new(config.connection.clone())));

        let directory = Arc::new(StaticRoomDirectory::new(config.rooms.iter().cloned()));
        let cache = connection_cache(config, Arc::clone(&clock)).await?;
        let tracker = Arc::new(RoomConnectionTracker::new(
            directory.clone(),
            cache,
            clock,
            &config.tracker,
        ));

        let hub = PresenceHub::new(
            Arc::clone(&bus),
            Arc::clone(admission.buffers()),
            config.hub.clone(),
        );
        hub.start();

        info!(
            instance = %config.server.instance,
            backend = bus.backend(),
            rooms = directory.len(),
            store = ?config.tracker.store,
            "service assembled"
        );
        Ok(Self {
            bus,
            admission,
            directory,
            tracker,
            hub,
            connections: TaskTracker::new(),
        })
    }

    pub fn gateway_context(&self, resolver: Arc<dyn SessionResolver>) -> GatewayContext {
        GatewayContext {
            admission: Arc::clone(&self.admission),
            tracker: Arc::clone(&self.tracker),
            hub: Arc::clone(&self.hub),
            resolver,
            connections: self.connections.clone(),
        }
    }

    /// Stop the hub, wait for connection tasks to untrack, then close the
    /// bus. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.hub.stop().await;
        self.connections.close();
        let pending = self.connections.len();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            warn!(pending, "connection tasks still running after drain timeout");
        }
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "event bus close failed");
        }
        info!("service stopped");
    }
}

async fn connection_cache(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn ConnectionCache>> {
    match config.tracker.store {
        CacheStore::Memory => Ok(Arc::new(MemoryConnectionCache::new(
            clock,
            config.tracker.connection_ttl(),
        ))),
        CacheStore::Redis => redis_cache(config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_cache(config: &Config) -> anyhow::Result<Arc<dyn ConnectionCache>> {
    let url = config
        .tracker
        .redis_url
        .as_deref()
        .unwrap_or(&config.bus.redis.url);
    let cache = crate::tracker::RedisConnectionCache::connect(url, config.tracker.connection_ttl())
        .await
        .context("failed to connect connection cache")?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
async fn redis_cache(_config: &Config) -> anyhow::Result<Arc<dyn ConnectionCache>> {
    anyhow::bail!("tracker.store = \"redis\" needs the `redis` feature")
}
