//! Presence hub: the local room -> user -> connection index.
//!
//! The hub writes events to the connections it holds and mirrors room events
//! on the bus so other instances can do the same for theirs. A recipient that
//! is offline, or whose write fails, gets the event on its notification path
//! instead (`publish_direct`), exactly once per delivery attempt.
//!
//! Locking: the index sits behind one `RwLock`. Broadcasts copy the
//! recipient list out under the read lock and write after releasing it, so a
//! slow client never blocks registration. Bus subscriptions are changed under
//! a separate async mutex that decides from the index what is still in use.

mod state;
mod transport;

pub use state::ConnectionState;
pub use transport::{ChannelTransport, OutboundQueue, Transport};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::admission::BufferPool;
use crate::bus::{Envelope, Event, EventBus, EventHandler, Topic, TopicKind};
use crate::config::HubConfig;
use crate::error::BusError;
use crate::metrics;

type RoomIndex = HashMap<String, HashMap<String, Arc<ConnectionState>>>;

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PresenceHub {
    instance: String,
    bus: Arc<dyn EventBus>,
    buffers: Arc<BufferPool>,
    config: HubConfig,
    rooms: RwLock<RoomIndex>,
    /// This hub's handler on the bus. Holds only a weak reference back.
    inbound: Arc<dyn EventHandler>,
    topics: tokio::sync::Mutex<HashSet<Topic>>,
    sweeper: Mutex<Option<Sweeper>>,
    stopped: AtomicBool,
}

impl PresenceHub {
    pub fn new(bus: Arc<dyn EventBus>, buffers: Arc<BufferPool>, config: HubConfig) -> Arc<Self> {
        Arc::new_cyclic(|hub: &Weak<Self>| Self {
            instance: bus.instance().to_string(),
            bus,
            buffers,
            config,
            rooms: RwLock::new(HashMap::new()),
            inbound: Arc::new(BusInbound { hub: hub.clone() }),
            topics: tokio::sync::Mutex::new(HashSet::new()),
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Start the offline-entry sweeper. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            self.config.sweep_interval(),
            token.clone(),
        ));
        *slot = Some(Sweeper { token, handle });
        debug!(interval = ?self.config.sweep_interval(), "hub sweeper started");
    }

    /// Stop the sweeper and close every transport. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.token.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "hub sweeper ended abnormally");
            }
        }

        let connections: Vec<Arc<ConnectionState>> = {
            let mut rooms = self.rooms.write();
            rooms.drain().flat_map(|(_, users)| users.into_values()).collect()
        };
        for state in &connections {
            state.mark_offline();
        }

        let topics: Vec<Topic> = self.topics.lock().await.drain().collect();
        for topic in topics {
            if let Err(e) = self.bus.unsubscribe(&topic, &self.inbound).await {
                debug!(%topic, error = %e, "unsubscribe during stop failed");
            }
        }
        info!(connections = connections.len(), "presence hub stopped");
    }

    /// Add a connection to the index and announce it to the room.
    ///
    /// A previous connection of the same user in the same room is taken
    /// offline and replaced.
    #[instrument(skip_all, fields(room = %state.room_id(), user = %state.user_id()))]
    pub async fn register(&self, state: Arc<ConnectionState>) -> Result<(), BusError> {
        if self.stopped.load(Ordering::Acquire) {
            state.mark_offline();
            return Err(BusError::Closed);
        }
        if !state.mark_online() {
            debug!("transport closed before registration");
            return Ok(());
        }
        let room_id = state.room_id();
        let user_id = state.user_id();

        let replaced = {
            let mut rooms = self.rooms.write();
            rooms
                .entry(room_id.to_string())
                .or_default()
                .insert(user_id.to_string(), Arc::clone(&state))
        };
        if let Some(previous) = replaced
            && !Arc::ptr_eq(&previous, &state)
        {
            debug!("replacing previous connection");
            previous.mark_offline();
        }

        if let Err(e) = self.sync_topics(room_id, user_id).await {
            state.mark_offline();
            self.remove_entry(&state);
            if let Err(release) = self.sync_topics(room_id, user_id).await {
                debug!(error = %release, "topic release after failed registration");
            }
            return Err(e);
        }

        self.announce(room_id, user_id, true).await;
        debug!("connection registered");
        Ok(())
    }

    /// Take a connection offline and drop it from the index.
    ///
    /// Only removes the entry if the index still holds this very connection,
    /// so a late unregister of a replaced connection is harmless.
    #[instrument(skip_all, fields(room = %state.room_id(), user = %state.user_id()))]
    pub async fn unregister(&self, state: &Arc<ConnectionState>) {
        state.mark_offline();
        let room_id = state.room_id();
        let user_id = state.user_id();
        if self.remove_entry(state) {
            self.announce(room_id, user_id, false).await;
            debug!("connection unregistered");
        }
        if let Err(e) = self.sync_topics(room_id, user_id).await {
            warn!(error = %e, "failed to release topics");
        }
    }

    /// Deliver to every connection in the room and mirror on the room topic.
    pub async fn broadcast_to_room(&self, room_id: &str, event: &Event) -> Result<(), BusError> {
        self.deliver_to_room(room_id, event, None).await?;
        self.bus.publish(&Topic::room(room_id), event).await
    }

    /// As [`broadcast_to_room`](Self::broadcast_to_room), skipping `user_id`
    /// here and on every other instance.
    pub async fn broadcast_to_room_except(
        &self,
        room_id: &str,
        user_id: &str,
        event: &Event,
    ) -> Result<(), BusError> {
        self.deliver_to_room(room_id, event, Some(user_id)).await?;
        let envelope = Envelope::new(self.instance.as_str(), event.clone()).excluding(user_id);
        self.bus.publish_envelope(&Topic::room(room_id), envelope).await
    }

    /// Deliver to every local connection of `user_id`. A user with no local
    /// connection, or none that accepted the frame, gets one notification.
    pub async fn broadcast_to_user(&self, user_id: &str, event: &Event) -> Result<(), BusError> {
        let connections = self.user_connections(user_id);
        if connections.is_empty() {
            self.notify(vec![user_id.to_string()], event).await;
            return Ok(());
        }
        let frame = self.encode(event)?;
        let missed = self.write_all(&connections, &frame);
        if missed.len() == connections.len() {
            self.notify(vec![user_id.to_string()], event).await;
        }
        Ok(())
    }

    pub fn is_user_online(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .read()
            .get(room_id)
            .and_then(|users| users.get(user_id))
            .is_some_and(|state| state.is_online())
    }

    /// Sorted ids of the users currently online in the room on this instance.
    pub fn online_users(&self, room_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .rooms
            .read()
            .get(room_id)
            .map(|users| {
                users
                    .values()
                    .filter(|state| state.is_online())
                    .map(|state| state.user_id().to_string())
                    .collect()
            })
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    /// Number of entries in the index, online or not.
    pub fn connection_count(&self) -> usize {
        self.rooms.read().values().map(HashMap::len).sum()
    }

    /// Drop offline entries idle for longer than the retention window.
    /// Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let retention = self.config.offline_retention();
        let dropped: Vec<(String, String)> = {
            let mut rooms = self.rooms.write();
            let mut dropped = Vec::new();
            rooms.retain(|room_id, users| {
                users.retain(|user_id, state| {
                    let keep = state.is_online() || state.idle_for() < retention;
                    if !keep {
                        dropped.push((room_id.clone(), user_id.clone()));
                    }
                    keep
                });
                !users.is_empty()
            });
            dropped
        };
        for (room_id, user_id) in &dropped {
            if let Err(e) = self.sync_topics(room_id, user_id).await {
                warn!(room = %room_id, user = %user_id, error = %e, "failed to release topics");
            }
        }
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "swept offline connections");
        }
        dropped.len()
    }

    fn encode(&self, event: &Event) -> Result<Bytes, BusError> {
        self.buffers.encode_json(event).map_err(BusError::Encode)
    }

    fn room_recipients(&self, room_id: &str, except: Option<&str>) -> Vec<Arc<ConnectionState>> {
        self.rooms
            .read()
            .get(room_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(user_id, _)| except != Some(user_id.as_str()))
                    .map(|(_, state)| Arc::clone(state))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn user_connections(&self, user_id: &str) -> Vec<Arc<ConnectionState>> {
        self.rooms
            .read()
            .values()
            .filter_map(|users| users.get(user_id).cloned())
            .collect()
    }

    /// Write `frame` to each recipient. Returns the users it did not reach;
    /// a failed write takes that connection offline.
    fn write_all(&self, recipients: &[Arc<ConnectionState>], frame: &Bytes) -> Vec<String> {
        let mut missed = Vec::new();
        for state in recipients {
            if !state.is_online() {
                missed.push(state.user_id().to_string());
                continue;
            }
            match state.send(frame.clone()) {
                Ok(()) => metrics::record_delivered(),
                Err(e) => {
                    metrics::record_delivery_failure(e.error_code());
                    debug!(
                        room = %state.room_id(),
                        user = %state.user_id(),
                        error = %e,
                        "write failed, taking connection offline"
                    );
                    state.mark_offline();
                    missed.push(state.user_id().to_string());
                }
            }
        }
        missed
    }

    /// Local delivery of a room event with notification fallback.
    async fn deliver_to_room(
        &self,
        room_id: &str,
        event: &Event,
        except: Option<&str>,
    ) -> Result<(), BusError> {
        let recipients = self.room_recipients(room_id, except);
        metrics::record_fanout(recipients.len());
        if recipients.is_empty() {
            return Ok(());
        }
        let frame = self.encode(event)?;
        let missed = self.write_all(&recipients, &frame);
        self.notify(missed, event).await;
        Ok(())
    }

    /// Presence goes to online users only and never falls back.
    fn deliver_presence(&self, room_id: &str, event: &Event, subject: Option<&str>) -> Result<(), BusError> {
        let recipients: Vec<_> = self
            .room_recipients(room_id, subject)
            .into_iter()
            .filter(|state| state.is_online())
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }
        let frame = self.encode(event)?;
        self.write_all(&recipients, &frame);
        Ok(())
    }

    async fn announce(&self, room_id: &str, user_id: &str, online: bool) {
        let presence = Event::presence(room_id, user_id, online);
        if let Err(e) = self.deliver_presence(room_id, &presence, Some(user_id)) {
            warn!(room = %room_id, error = %e, "presence delivery failed");
        }
        if let Err(e) = self.bus.publish(&Topic::room(room_id), &presence).await {
            warn!(room = %room_id, error = %e, "presence mirror failed");
        }
    }

    /// One `publish_direct` per user, concurrently.
    async fn notify(&self, users: Vec<String>, event: &Event) {
        if users.is_empty() {
            return;
        }
        let sends = users.iter().map(|user_id| async move {
            (user_id, self.bus.publish_direct(user_id, event).await)
        });
        for (user_id, result) in join_all(sends).await {
            match result {
                Ok(()) => metrics::record_fallback(true),
                Err(e) => {
                    metrics::record_fallback(false);
                    warn!(user = %user_id, error = %e, "fallback notification failed");
                }
            }
        }
    }

    /// Records that came from another instance: local delivery only.
    async fn deliver_remote(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError> {
        if envelope.origin == self.instance {
            return Ok(());
        }
        let event = &envelope.event;
        match topic.kind() {
            TopicKind::Room if event.is_presence() => {
                self.deliver_presence(topic.id(), event, event.user_id.as_deref())
            }
            TopicKind::Room => {
                self.deliver_to_room(topic.id(), event, envelope.exclude_user.as_deref())
                    .await
            }
            TopicKind::User => {
                let connections = self.user_connections(topic.id());
                if connections.is_empty() {
                    return Ok(());
                }
                let frame = self.encode(event)?;
                self.write_all(&connections, &frame);
                Ok(())
            }
        }
    }

    /// Remove `state` if the index still holds it. Returns whether it did.
    fn remove_entry(&self, state: &Arc<ConnectionState>) -> bool {
        let mut rooms = self.rooms.write();
        let Some(users) = rooms.get_mut(state.room_id()) else {
            return false;
        };
        if !users
            .get(state.user_id())
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            return false;
        }
        users.remove(state.user_id());
        if users.is_empty() {
            rooms.remove(state.room_id());
        }
        true
    }

    /// Bring the room and user subscriptions in line with the index.
    async fn sync_topics(&self, room_id: &str, user_id: &str) -> Result<(), BusError> {
        let mut active = self.topics.lock().await;
        let (room_used, user_used) = {
            let rooms = self.rooms.read();
            (
                rooms.get(room_id).is_some_and(|users| !users.is_empty()),
                rooms.values().any(|users| users.contains_key(user_id)),
            )
        };
        for (topic, used) in [
            (Topic::room(room_id), room_used),
            (Topic::user(user_id), user_used),
        ] {
            match (used, active.contains(&topic)) {
                (true, false) => {
                    self.bus.subscribe(&topic, Arc::clone(&self.inbound)).await?;
                    debug!(%topic, "topic acquired");
                    active.insert(topic);
                }
                (false, true) => {
                    active.remove(&topic);
                    self.bus.unsubscribe(&topic, &self.inbound).await?;
                    debug!(%topic, "topic released");
                }
                _ => {}
            }
        }
        Ok(())
    }
}

struct BusInbound {
    hub: Weak<PresenceHub>,
}

#[async_trait]
impl EventHandler for BusInbound {
    async fn handle(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BusError> {
        match self.hub.upgrade() {
            Some(hub) => hub.deliver_remote(topic, envelope).await,
            None => Ok(()),
        }
    }
}

async fn sweep_loop(hub: Weak<PresenceHub>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                hub.sweep().await;
            }
        }
    }
}
