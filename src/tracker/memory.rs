//! Process-local connection store.
//!
//! Capacity is only enforced within this process. Expiry is evaluated
//! lazily against the injected [`Clock`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::cache::{ConnectionCache, TrackOutcome};
use crate::clock::Clock;
use crate::error::CacheError;

#[derive(Debug)]
struct ActiveSet {
    expires_at: DateTime<Utc>,
    /// user -> marker expiry
    markers: HashMap<String, DateTime<Utc>>,
}

pub struct MemoryConnectionCache {
    rooms: DashMap<String, ActiveSet>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl MemoryConnectionCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Drop the whole set when its own TTL ran out.
    fn purge_expired(&self, room_id: &str, now: DateTime<Utc>) {
        self.rooms
            .remove_if(room_id, |_, set| set.expires_at <= now);
    }
}

#[async_trait]
impl ConnectionCache for MemoryConnectionCache {
    async fn track(
        &self,
        room_id: &str,
        user_id: &str,
        capacity: u32,
    ) -> Result<TrackOutcome, CacheError> {
        let now = self.clock.now();
        self.purge_expired(room_id, now);
        let expires_at = now + self.ttl;

        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let set = entry.get_mut();
                // Heartbeats of others keep the set alive; drop users whose own marker lapsed.
                set.markers.retain(|_, marker| *marker > now);
                let active = set.markers.len() as u64;
                if capacity > 0 && !set.markers.contains_key(user_id) && active >= u64::from(capacity) {
                    return Ok(TrackOutcome::Full { active });
                }
                set.markers.insert(user_id.to_string(), expires_at);
                set.expires_at = expires_at;
                Ok(TrackOutcome::Tracked {
                    active: set.markers.len() as u64,
                })
            }
            Entry::Vacant(entry) => {
                let mut markers = HashMap::new();
                markers.insert(user_id.to_string(), expires_at);
                entry.insert(ActiveSet {
                    expires_at,
                    markers,
                });
                Ok(TrackOutcome::Tracked { active: 1 })
            }
        }
    }

    async fn remove(&self, room_id: &str, user_id: &str) -> Result<(), CacheError> {
        if let Some(mut set) = self.rooms.get_mut(room_id) {
            set.markers.remove(user_id);
        }
        self.rooms.remove_if(room_id, |_, set| set.markers.is_empty());
        Ok(())
    }

    async fn count(&self, room_id: &str) -> Result<u64, CacheError> {
        self.purge_expired(room_id, self.clock.now());
        Ok(self
            .rooms
            .get(room_id)
            .map_or(0, |set| set.markers.len() as u64))
    }

    async fn members(&self, room_id: &str) -> Result<Vec<String>, CacheError> {
        self.purge_expired(room_id, self.clock.now());
        Ok(self
            .rooms
            .get(room_id)
            .map(|set| set.markers.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn contains(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError> {
        self.purge_expired(room_id, self.clock.now());
        Ok(self
            .rooms
            .get(room_id)
            .is_some_and(|set| set.markers.contains_key(user_id)))
    }

    async fn refresh(&self, room_id: &str, user_id: &str) -> Result<bool, CacheError> {
        let now = self.clock.now();
        self.purge_expired(room_id, now);
        let Some(mut set) = self.rooms.get_mut(room_id) else {
            return Ok(false);
        };
        let expires_at = now + self.ttl;
        match set.markers.get_mut(user_id) {
            Some(marker) => {
                *marker = expires_at;
                set.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cleanup(&self, room_id: &str) -> Result<usize, CacheError> {
        let now = self.clock.now();
        self.purge_expired(room_id, now);
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut set) => {
                let before = set.markers.len();
                set.markers.retain(|_, expires_at| *expires_at > now);
                before - set.markers.len()
            }
            None => 0,
        };
        self.rooms.remove_if(room_id, |_, set| set.markers.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> (MemoryConnectionCache, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let cache = MemoryConnectionCache::new(Arc::new(clock.clone()), Duration::from_secs(300));
        (cache, clock)
    }

    #[tokio::test]
    async fn capacity_is_checked_atomically_with_insert() {
        let (cache, _) = cache();
        assert_eq!(
            cache.track("r", "a", 2).await.unwrap(),
            TrackOutcome::Tracked { active: 1 }
        );
        assert_eq!(
            cache.track("r", "b", 2).await.unwrap(),
            TrackOutcome::Tracked { active: 2 }
        );
        assert_eq!(
            cache.track("r", "c", 2).await.unwrap(),
            TrackOutcome::Full { active: 2 }
        );
        // Re-tracking an existing user does not need a free slot.
        assert_eq!(
            cache.track("r", "a", 2).await.unwrap(),
            TrackOutcome::Tracked { active: 2 }
        );
    }

    #[tokio::test]
    async fn zero_capacity_is_unlimited() {
        let (cache, _) = cache();
        for i in 0..50 {
            cache.track("r", &format!("u{i}"), 0).await.unwrap();
        }
        assert_eq!(cache.count("r").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn remove_frees_a_slot() {
        let (cache, _) = cache();
        cache.track("r", "a", 1).await.unwrap();
        cache.remove("r", "a").await.unwrap();
        assert!(!cache.contains("r", "a").await.unwrap());
        assert_eq!(
            cache.track("r", "b", 1).await.unwrap(),
            TrackOutcome::Tracked { active: 1 }
        );
    }

    #[tokio::test]
    async fn whole_set_expires_without_heartbeats() {
        let (cache, clock) = cache();
        cache.track("r", "a", 0).await.unwrap();
        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(cache.count("r").await.unwrap(), 0);
        assert!(!cache.refresh("r", "a").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_drops_members_with_expired_markers() {
        let (cache, clock) = cache();
        cache.track("r", "a", 0).await.unwrap();
        clock.advance(chrono::Duration::seconds(200));
        cache.track("r", "b", 0).await.unwrap();
        clock.advance(chrono::Duration::seconds(200));

        // The set TTL was pushed by b, but a's marker is gone.
        assert_eq!(cache.count("r").await.unwrap(), 2);
        assert_eq!(cache.cleanup("r").await.unwrap(), 1);
        assert_eq!(cache.members("r").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn lapsed_user_does_not_hold_a_slot() {
        let (cache, clock) = cache();
        cache.track("r", "a", 2).await.unwrap();
        cache.track("r", "b", 2).await.unwrap();
        // a never heartbeats again; b does, which keeps the set alive.
        for _ in 0..10 {
            clock.advance(chrono::Duration::seconds(100));
            assert!(cache.refresh("r", "b").await.unwrap());
        }
        assert_eq!(
            cache.track("r", "c", 2).await.unwrap(),
            TrackOutcome::Tracked { active: 2 }
        );
        let mut members = cache.members("r").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn refresh_extends_marker() {
        let (cache, clock) = cache();
        cache.track("r", "a", 0).await.unwrap();
        clock.advance(chrono::Duration::seconds(250));
        assert!(cache.refresh("r", "a").await.unwrap());
        clock.advance(chrono::Duration::seconds(250));
        assert_eq!(cache.cleanup("r").await.unwrap(), 0);
        assert!(cache.contains("r", "a").await.unwrap());
    }
}
