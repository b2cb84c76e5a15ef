//! Fleet-wide active connection store.
//!
//! Per room the store keeps a set of user ids plus one marker per
//! connection. Both carry a TTL that heartbeats refresh. A user whose marker
//! expired stays in the set until [`ConnectionCache::cleanup`] runs, so counts
//! can briefly include dead connections.

use async_trait::async_trait;

use crate::error::CacheError;

/// `room:<id>:active_connections`
pub fn active_connections_key(room_id: &str) -> String {
    format!("room:{room_id}:active_connections")
}

/// `room:<id>:connection:<user>`
pub fn connection_key(room_id: &str, user_id: &str) -> String {
    format!("room:{room_id}:connection:{user_id}")
}

/// Result of an atomic check-and-add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The user is in the active set; `active` is the set size afterwards.
    Tracked { active: u64 },
    /// The set was full and the user was not already in it.
    Full { active: u64 },
}

#[async_trait]
pub trait ConnectionCache: Send + Sync {
    /// Add `user_id` to the room's active set unless that would exceed
    /// `capacity` (0 = unlimited). A user already in the set is always
    /// re-tracked. Check and insert are one atomic step.
    async fn track(
        &self,
        room_id: &str,
        user_id: &str,
        capacity: u32,
    ) -> Result<TrackOutcome, CacheError>;

    async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), CacheError>;

    async fn count(&self, room_id: &str) -> Result<u64, CacheError>;

    async fn members(&self, room_id: &str) -> Result<Vec<String>, CacheError>;

    /// Whether the user is in the room's active set.
    async fn contains(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError>;

    /// Push the TTLs of the set and the user's marker forward.
    /// Returns false when the user was no longer tracked.
    async fn refresh(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError>;

    /// Drop set members whose marker expired. Returns how many were dropped.
    async fn cleanup(&self, room_id: &str) -> Result<usize, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_shared_layout() {
        assert_eq!(active_connections_key("r1"), "room:r1:active_connections");
        assert_eq!(connection_key("r1", "u1"), "room:r1:connection:u1");
    }
}
