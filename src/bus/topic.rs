//! Topic names.
//!
//! Topics are only ever built by [`Topic::room`] and [`Topic::user`], so a
//! room id and a user id can never collide on the same topic.

use std::fmt;

use crate::error::BusError;

const ROOM_PREFIX: &str = "room:";
const USER_PREFIX: &str = "user:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Room,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    /// `room:<id>`
    pub fn room(room_id: &str) -> Self {
        Self(format!("{ROOM_PREFIX}{room_id}"))
    }

    /// `user:<id>`, the notification path for one user.
    pub fn user(user_id: &str) -> Self {
        Self(format!("{USER_PREFIX}{user_id}"))
    }

    /// Parse a channel name received from a backend.
    pub fn parse(name: &str) -> Result<Self, BusError> {
        match name.split_once(':') {
            Some(("room", id)) if !id.is_empty() => Ok(Self::room(id)),
            Some(("user", id)) if !id.is_empty() => Ok(Self::user(id)),
            _ => Err(BusError::InvalidTopic(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TopicKind {
        if self.0.starts_with(ROOM_PREFIX) {
            TopicKind::Room
        } else {
            TopicKind::User
        }
    }

    /// The room or user id this topic belongs to.
    pub fn id(&self) -> &str {
        let prefix = match self.kind() {
            TopicKind::Room => ROOM_PREFIX,
            TopicKind::User => USER_PREFIX,
        };
        &self.0[prefix.len()..]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
