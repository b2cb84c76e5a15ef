//! Room connection tracking.
//!
//! The tracker decides whether a user may hold a connection in a room and
//! keeps the fleet-wide count of who is connected where. Room metadata comes
//! from a [`RoomDirectory`]; active connection sets live in a
//! [`ConnectionCache`] shared by every instance, so capacity holds across the
//! whole deployment and not just this process.
//!
//! Admission checks run in a fixed order so the error names the first rule
//! the user broke: membership, room status, schedule, capacity.

mod cache;
mod directory;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod room;
mod schedule;

pub use cache::{ConnectionCache, TrackOutcome, active_connections_key, connection_key};
pub use directory::{RoomDirectory, StaticRoomDirectory};
pub use memory::MemoryConnectionCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisConnectionCache;
pub use room::{Room, RoomKind, RoomStatus};
pub use schedule::{RoomSchedule, ScheduleKind, ScheduleStatus};

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::metrics;

/// Why a write into a room was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotAMember,
    MissingRole,
    ReadOnly,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAMember => "user is not a member of this room",
            Self::MissingRole => "user role not provided",
            Self::ReadOnly => "room is read-only and user does not have write permission",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    Allowed,
    Denied(DenyReason),
}

impl SendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Point-in-time view of a room for status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatusSnapshot {
    pub room_id: String,
    pub capacity: u32,
    pub member_count: usize,
    pub active_count: u64,
    pub active_users: Vec<String>,
    pub schedule: ScheduleStatus,
}

pub struct RoomConnectionTracker {
    directory: Arc<dyn RoomDirectory>,
    cache: Arc<dyn ConnectionCache>,
    clock: Arc<dyn Clock>,
    grace: chrono::Duration,
    privileged_roles: HashSet<String>,
}

impl RoomConnectionTracker {
    pub fn new(
        directory: Arc<dyn RoomDirectory>,
        cache: Arc<dyn ConnectionCache>,
        clock: Arc<dyn Clock>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            directory,
            cache,
            clock,
            grace: config.schedule_grace(),
            privileged_roles: config.privileged_roles.iter().cloned().collect(),
        }
    }

    async fn load(&self, room_id: &str) -> Result<Room, TrackerError> {
        self.directory
            .room(room_id)
            .await?
            .ok_or_else(|| TrackerError::RoomNotFound(room_id.to_string()))
    }

    /// Check that `user_id` may connect to `room_id` and record the connection.
    #[instrument(skip(self), fields(room = %room_id, user = %user_id))]
    pub async fn validate_and_track(&self, room_id: &str, user_id: &str) -> Result<(), TrackerError> {
        let result = self.check_and_track(room_id, user_id).await;
        if let Err(e) = &result {
            metrics::record_room_join_rejected(e.error_code());
            debug!(reason = e.error_code(), "room join refused");
        }
        result
    }

    async fn check_and_track(&self, room_id: &str, user_id: &str) -> Result<(), TrackerError> {
        let room = self.load(room_id).await?;

        if !room.is_member(user_id) {
            return Err(TrackerError::NotAMember);
        }
        if !room.is_active() {
            return Err(TrackerError::RoomInactive);
        }
        if !room.is_open_at(self.clock.now(), self.grace) {
            return Err(TrackerError::ClosedBySchedule);
        }

        match self.cache.track(room_id, user_id, room.capacity).await? {
            TrackOutcome::Tracked { active } => {
                debug!(active, capacity = room.capacity, "connection tracked");
                Ok(())
            }
            TrackOutcome::Full { active } => Err(TrackerError::AtCapacity {
                active,
                capacity: room.capacity,
            }),
        }
    }

    pub async fn remove_connection(&self, room_id: &str, user_id: &str) -> Result<(), TrackerError> {
        self.cache.remove(room_id, user_id).await?;
        debug!(room = %room_id, user = %user_id, "connection untracked");
        Ok(())
    }

    pub async fn active_connections_count(&self, room_id: &str) -> Result<u64, TrackerError> {
        Ok(self.cache.count(room_id).await?)
    }

    pub async fn active_users(&self, room_id: &str) -> Result<Vec<String>, TrackerError> {
        Ok(self.cache.members(room_id).await?)
    }

    pub async fn has_active_connection(&self, room_id: &str, user_id: &str) -> Result<bool, TrackerError> {
        Ok(self.cache.contains(room_id, user_id).await?)
    }

    /// Heartbeat. Returns false when the connection had already expired.
    pub async fn refresh_connection(&self, room_id: &str, user_id: &str) -> Result<bool, TrackerError> {
        Ok(self.cache.refresh(room_id, user_id).await?)
    }

    pub async fn cleanup_inactive(&self, room_id: &str) -> Result<usize, TrackerError> {
        let removed = self.cache.cleanup(room_id).await?;
        if removed > 0 {
            info!(room = %room_id, removed, "dropped expired connections");
        }
        Ok(removed)
    }

    pub async fn room_status(&self, room_id: &str) -> Result<RoomStatusSnapshot, TrackerError> {
        let room = self.load(room_id).await?;
        let active_count = self.cache.count(room_id).await?;
        let active_users = self.cache.members(room_id).await?;
        Ok(RoomStatusSnapshot {
            room_id: room.id.clone(),
            capacity: room.capacity,
            member_count: room.members.len(),
            active_count,
            active_users,
            schedule: room.schedule_status(self.clock.now(), self.grace),
        })
    }

    pub async fn can_user_send_message(
        &self,
        room_id: &str,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<SendDecision, TrackerError> {
        let room = self.load(room_id).await?;
        Ok(self.write_decision(&room, user_id, role))
    }

    pub async fn can_user_send_sticker(
        &self,
        room_id: &str,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<SendDecision, TrackerError> {
        self.can_user_send_message(room_id, user_id, role).await
    }

    pub async fn can_user_send_reaction(
        &self,
        room_id: &str,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<SendDecision, TrackerError> {
        self.can_user_send_message(room_id, user_id, role).await
    }

    fn write_decision(&self, room: &Room, user_id: &str, role: Option<&str>) -> SendDecision {
        if !room.is_member(user_id) {
            return SendDecision::Denied(DenyReason::NotAMember);
        }
        if room.is_read_only() {
            match role {
                None | Some("") => return SendDecision::Denied(DenyReason::MissingRole),
                Some(role) if !self.privileged_roles.contains(role) => {
                    return SendDecision::Denied(DenyReason::ReadOnly);
                }
                Some(_) => {}
            }
        }
        SendDecision::Allowed
    }
}
