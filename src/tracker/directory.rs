//! Room metadata lookup.

use async_trait::async_trait;
use dashmap::DashMap;

use super::Room;
use crate::error::TrackerError;

/// Where room metadata comes from. Production deployments put their room
/// service behind this; the bundled implementation is seeded from config.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room(&self, room_id: &str) -> Result<Option<Room>, TrackerError>;
}

/// In-memory directory. Rooms can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticRoomDirectory {
    rooms: DashMap<String, Room>,
}

impl StaticRoomDirectory {
    pub fn new(rooms: impl IntoIterator<Item = Room>) -> Self {
        let directory = Self::default();
        for room in rooms {
            directory.upsert(room);
        }
        directory
    }

    pub fn upsert(&self, room: Room) {
        self.rooms.insert(room.id.clone(), room);
    }

    pub fn remove(&self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id).map(|(_, room)| room)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[async_trait]
impl RoomDirectory for StaticRoomDirectory {
    async fn room(&self, room_id: &str) -> Result<Option<Room>, TrackerError> {
        Ok(self.rooms.get(room_id).map(|r| r.value().clone()))
    }
}
