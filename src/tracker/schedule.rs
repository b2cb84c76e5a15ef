//! Room opening hours.
//!
//! A schedule is either a single window between two instants (`one-time`)
//! or a daily window between two times of day (`loop`). Loop windows whose
//! start is not before their end wrap past midnight (22:00 - 06:00).
//! Both kinds are widened by a grace margin at each end so clients that
//! connect slightly early or stay slightly late are not cut off.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const LAST_SECOND_OF_DAY: i64 = SECONDS_PER_DAY - 1;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleKind {
    #[default]
    OneTime,
    Loop,
}

/// Opening hours attached to a room.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomSchedule {
    #[serde(default)]
    pub kind: ScheduleKind,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Where a room stands relative to its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// No schedule, or one that is switched off or has no bounds.
    Disabled,
    Open,
    Closed,
}

impl RoomSchedule {
    /// Whether this schedule restricts access at all.
    pub fn applies(&self) -> bool {
        self.enabled && (self.start_at.is_some() || self.end_at.is_some())
    }

    /// Whether `now` falls inside the window widened by `grace` at both ends.
    pub fn is_open(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if !self.applies() {
            return true;
        }
        match self.kind {
            ScheduleKind::OneTime => self.one_time_open(now, grace),
            ScheduleKind::Loop => self.loop_open(now, grace),
        }
    }

    pub fn status(&self, now: DateTime<Utc>, grace: Duration) -> ScheduleStatus {
        if !self.applies() {
            ScheduleStatus::Disabled
        } else if self.is_open(now, grace) {
            ScheduleStatus::Open
        } else {
            ScheduleStatus::Closed
        }
    }

    fn one_time_open(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        if let Some(start) = self.start_at
            && now < start - grace
        {
            return false;
        }
        if let Some(end) = self.end_at
            && now > end + grace
        {
            return false;
        }
        true
    }

    fn loop_open(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let current = second_of_day(now);
        let start = self.start_at.map(second_of_day).unwrap_or(0);
        let end = self
            .end_at
            .map(second_of_day)
            .unwrap_or(LAST_SECOND_OF_DAY);
        let grace = grace.num_seconds();

        let after_start = current > start - grace;
        let before_end = current < end + grace;
        if start >= end {
            // Overnight window.
            after_start || before_end
        } else {
            after_start && before_end
        }
    }
}

fn second_of_day(at: DateTime<Utc>) -> i64 {
    i64::from(at.num_seconds_from_midnight())
}
