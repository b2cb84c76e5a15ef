//! Events and the records that carry them across the bus.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Notification,
    Presence,
    Reaction,
    File,
    Sticker,
    Unsend,
    Mention,
    System,
    #[serde(other)]
    Other,
}

/// A unit of real-time traffic. This is also the JSON frame written to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            room_id: None,
            user_id: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn from_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Presence change of `user_id` in `room_id`.
    pub fn presence(room_id: &str, user_id: &str, online: bool) -> Self {
        let status = if online { "online" } else { "offline" };
        Self::new(EventKind::Presence, json!({ "status": status }))
            .in_room(room_id)
            .from_user(user_id)
    }

    pub fn is_presence(&self) -> bool {
        self.kind == EventKind::Presence
    }

    pub fn to_json(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(BusError::Encode)
    }
}

/// What actually travels on a topic: the event plus the instance that
/// published it, so an instance can recognise its own echoes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub event: Event,
    /// A user that must not receive this room event on any instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_user: Option<String>,
}

impl Envelope {
    pub fn new(origin: impl Into<String>, event: Event) -> Self {
        Self {
            origin: origin.into(),
            event,
            exclude_user: None,
        }
    }

    pub fn excluding(mut self, user_id: impl Into<String>) -> Self {
        self.exclude_user = Some(user_id.into());
        self
    }

    pub fn encode(&self) -> Result<Bytes, BusError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(BusError::Encode)
    }

    pub fn decode(topic: &str, raw: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(raw).map_err(|source| BusError::Decode {
            topic: topic.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_camel_case() {
        let event = Event::new(EventKind::Message, json!({"text": "hi"}))
            .in_room("r1")
            .from_user("u1");
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["payload"]["text"], "hi");
    }

    #[test]
    fn unknown_kinds_become_other() {
        let event: Event =
            serde_json::from_str(r#"{"type":"typing","roomId":"r1","payload":{}}"#).unwrap();
        assert_eq!(event.kind, EventKind::Other);
        assert_eq!(event.room_id.as_deref(), Some("r1"));
        assert!(event.user_id.is_none());
    }

    #[test]
    fn presence_events_carry_status() {
        let event = Event::presence("r", "u", false);
        assert!(event.is_presence());
        assert_eq!(event.payload["status"], "offline");
    }

    #[test]
    fn garbage_records_report_their_topic() {
        let err = Envelope::decode("room:1", b"not json").unwrap_err();
        assert!(matches!(err, BusError::Decode { ref topic, .. } if topic == "room:1"));
    }
}
