//! Room metadata as seen by the tracker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::schedule::{RoomSchedule, ScheduleStatus};

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RoomKind {
    #[default]
    Normal,
    ReadOnly,
}

/// A chat room: who may join, when, and how many at once.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub kind: RoomKind,
    /// Maximum concurrent connections; 0 means unlimited.
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub members: HashSet<String>,
    #[serde(default)]
    pub schedule: Option<RoomSchedule>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RoomStatus::Active,
            kind: RoomKind::Normal,
            capacity: 0,
            members: HashSet::new(),
            schedule: None,
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members.extend(members.into_iter().map(Into::into));
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_schedule(mut self, schedule: RoomSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == RoomStatus::Active
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == RoomKind::ReadOnly
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0
    }

    /// Whether the schedule, if any, lets connections in at `now`.
    pub fn is_open_at(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.schedule
            .as_ref()
            .is_none_or(|schedule| schedule.is_open(now, grace))
    }

    pub fn schedule_status(&self, now: DateTime<Utc>, grace: Duration) -> ScheduleStatus {
        self.schedule
            .as_ref()
            .map_or(ScheduleStatus::Disabled, |schedule| schedule.status(now, grace))
    }
}
