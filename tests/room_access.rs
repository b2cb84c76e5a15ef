//! Room access over time and under load: schedules and capacity.

mod common;

use chrono::{TimeZone, Utc};
use common::{TestClient, TestServer};
use roomlink::clock::ManualClock;
use roomlink::config::TrackerConfig;
use roomlink::error::TrackerError;
use roomlink::tracker::{
    MemoryConnectionCache, Room, RoomConnectionTracker, ScheduleStatus, StaticRoomDirectory,
};
use std::sync::Arc;
use std::time::Duration;

const SCHEDULED: &str = r#"
[[rooms]]
id = "townhall"
members = ["alice"]

[rooms.schedule]
kind = "one-time"
start_at = "2025-06-01T13:00:00Z"
end_at = "2025-06-01T14:00:00Z"
"#;

#[tokio::test]
async fn scheduled_room_opens_at_start_minus_grace() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    let server = TestServer::spawn_with_clock(SCHEDULED, Arc::new(clock.clone()))
        .await
        .unwrap();

    let mut early = TestClient::connect(&server.url("alice", "townhall")).await.unwrap();
    assert_eq!(early.expect_close().await.unwrap(), Some(4403));

    // Two minutes of grace before the start.
    clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 12, 58, 30).unwrap());
    let _alice = TestClient::connect(&server.url("alice", "townhall")).await.unwrap();
    assert!(server.wait_online("townhall", "alice").await);

    let status = server.service().tracker.room_status("townhall").await.unwrap();
    assert_eq!(status.schedule, ScheduleStatus::Open);
    server.stop().await;
}

fn tracker_with(capacity: u32) -> RoomConnectionTracker {
    tracker_on(capacity, ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()))
}

fn tracker_on(capacity: u32, clock: ManualClock) -> RoomConnectionTracker {
    let clock = Arc::new(clock);
    let members = (0..20).map(|i| format!("user-{i}"));
    let directory = Arc::new(StaticRoomDirectory::new(vec![
        Room::new("r").with_members(members).with_capacity(capacity),
    ]));
    let cache = Arc::new(MemoryConnectionCache::new(clock.clone(), Duration::from_secs(300)));
    RoomConnectionTracker::new(directory, cache, clock, &TrackerConfig::default())
}

#[tokio::test]
async fn capacity_counts_distinct_users() {
    let tracker = tracker_with(3);
    for user in ["user-0", "user-1"] {
        tracker.validate_and_track("r", user).await.unwrap();
    }
    // N - 1 active: one more fits.
    tracker.validate_and_track("r", "user-2").await.unwrap();
    // N active: the next user is refused, a tracked user may come back.
    assert!(matches!(
        tracker.validate_and_track("r", "user-3").await,
        Err(TrackerError::AtCapacity { active: 3, capacity: 3 })
    ));
    tracker.validate_and_track("r", "user-0").await.unwrap();

    tracker.remove_connection("r", "user-1").await.unwrap();
    tracker.validate_and_track("r", "user-3").await.unwrap();
    assert_eq!(tracker.active_connections_count("r").await.unwrap(), 3);
}

#[tokio::test]
async fn zero_capacity_is_unlimited() {
    let tracker = tracker_with(0);
    for i in 0..20 {
        tracker.validate_and_track("r", &format!("user-{i}")).await.unwrap();
    }
    assert_eq!(tracker.active_connections_count("r").await.unwrap(), 20);
}

#[tokio::test]
async fn concurrent_joins_never_exceed_capacity() {
    let tracker = Arc::new(tracker_with(5));
    let joins = (0..20).map(|i| {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move { tracker.validate_and_track("r", &format!("user-{i}")).await })
    });
    let mut admitted = 0;
    for join in joins {
        if join.await.unwrap().is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(tracker.active_connections_count("r").await.unwrap(), 5);
}

#[tokio::test]
async fn users_left_behind_by_a_crashed_instance_expire() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    let tracker = tracker_on(2, clock.clone());
    tracker.validate_and_track("r", "user-0").await.unwrap();
    tracker.validate_and_track("r", "user-1").await.unwrap();

    // user-0's instance is gone; user-1 keeps sending heartbeats.
    for _ in 0..10 {
        clock.advance(chrono::Duration::seconds(100));
        assert!(tracker.refresh_connection("r", "user-1").await.unwrap());
    }

    tracker.validate_and_track("r", "user-2").await.unwrap();
    assert!(!tracker.has_active_connection("r", "user-0").await.unwrap());
    assert_eq!(tracker.active_connections_count("r").await.unwrap(), 2);
}
