//! Unified error handling for roomlink.
//!
//! Each layer owns a small error enum. Every enum exposes a static
//! `error_code()` for metric labels; the client-facing ones also map to
//! HTTP statuses and WebSocket close codes for the surfaces that wrap them.

use http::StatusCode;
use thiserror::Error;

// ============================================================================
// Admission Errors (connection gatekeeping)
// ============================================================================

/// Reasons a new connection is refused before any resource is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("too many connection attempts")]
    RateLimited,

    #[error("maximum connections reached")]
    OverCapacity,

    #[error("maximum connections for origin reached")]
    OverCapacityForOrigin,
}

impl AdmissionError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::OverCapacity => "over_capacity",
            Self::OverCapacityForOrigin => "over_capacity_for_origin",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::OverCapacity | Self::OverCapacityForOrigin => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// ============================================================================
// Tracker Errors (room membership, schedule, capacity)
// ============================================================================

/// Errors produced while admitting a user into a room.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("user is not a member of this room")]
    NotAMember,

    #[error("room is inactive and not accepting connections")]
    RoomInactive,

    #[error("room is currently closed according to its schedule")]
    ClosedBySchedule,

    #[error("room is at capacity: {active}/{capacity}")]
    AtCapacity { active: u64, capacity: u32 },

    #[error("connection cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("room directory error: {0}")]
    Directory(String),
}

impl TrackerError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::NotAMember => "not_a_member",
            Self::RoomInactive => "room_inactive",
            Self::ClosedBySchedule => "room_closed_by_schedule",
            Self::AtCapacity { .. } => "room_at_capacity",
            Self::Cache(_) => "cache_unavailable",
            Self::Directory(_) => "directory_unavailable",
        }
    }

    /// Client errors are deterministic and never retried; backend errors are 5xx.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotAMember => StatusCode::FORBIDDEN,
            Self::RoomInactive | Self::ClosedBySchedule => StatusCode::FORBIDDEN,
            Self::AtCapacity { .. } => StatusCode::CONFLICT,
            Self::Cache(_) | Self::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// WebSocket close code sent when a handshake is refused (4000 + HTTP status).
    pub fn close_code(&self) -> u16 {
        4000 + self.http_status().as_u16()
    }

    pub fn is_client_error(&self) -> bool {
        self.http_status().is_client_error()
    }
}

// ============================================================================
// Session Errors (who is connecting, resolved at handshake)
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("missing or malformed session parameters: {0}")]
    Malformed(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl SessionError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Empty(_) => "empty",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

// ============================================================================
// Cache Errors (fleet-wide connection store)
// ============================================================================

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected cache reply: {0}")]
    Protocol(String),
}

// ============================================================================
// Bus Errors (event distribution)
// ============================================================================

/// Errors surfaced by the event bus and its backends.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode record on {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl BusError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Backend(_) => "backend_unavailable",
            Self::Encode(_) => "encode",
            Self::Decode { .. } => "decode",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::Handler(_) => "handler",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidTopic(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// ============================================================================
// Delivery Errors (writes to a single live connection)
// ============================================================================

/// A write to one recipient failed. Never aborts a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("transport closed")]
    Closed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("write timed out")]
    Timeout,
}

impl DeliveryError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::QueueFull => "queue_full",
            Self::Timeout => "timeout",
        }
    }
}
