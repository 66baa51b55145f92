//! The conference: the collection of rooms under one chat service domain.

use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, FullJid};
use tracing::{debug, info};

use super::room::{Occupant, Room};
use super::settings::{RoomSettings, RoomType, SettingsConflict};

/// Identifies a room within a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub service: String,
    pub node: String,
}

impl RoomKey {
    pub fn new(service: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            node: node.into(),
        }
    }
}

/// Backing store for rooms. The default keeps everything in memory; a
/// persistent implementation can be swapped in without touching the
/// conference.
pub trait RoomStorage: Send + Sync {
    /// Insert a room if the key is free. Returns false when a room with
    /// this key already exists.
    fn insert(&self, key: RoomKey, room: Arc<Room>) -> bool;
    fn get(&self, key: &RoomKey) -> Option<Arc<Room>>;
    fn remove(&self, key: &RoomKey) -> Option<Arc<Room>>;
    fn all(&self) -> Vec<Arc<Room>>;
}

#[derive(Default)]
pub struct InMemoryRoomStorage {
    rooms: DashMap<RoomKey, Arc<Room>>,
}

impl InMemoryRoomStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RoomStorage for InMemoryRoomStorage {
    fn insert(&self, key: RoomKey, room: Arc<Room>) -> bool {
        match self.rooms.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(room);
                true
            }
        }
    }

    fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.get(key).map(|r| r.clone())
    }

    fn remove(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.remove(key).map(|(_, room)| room)
    }

    fn all(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| r.clone()).collect()
    }
}

/// Errors raised when creating rooms.
#[derive(Debug, thiserror::Error)]
pub enum ConferenceError {
    #[error("room {0} already exists")]
    RoomExists(String),
    #[error("invalid room address: {0}")]
    InvalidAddress(String),
    #[error(transparent)]
    Settings(#[from] SettingsConflict),
}

/// All rooms under one service domain.
pub struct Conference {
    service: String,
    storage: Arc<dyn RoomStorage>,
}

impl Conference {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_storage(service, Arc::new(InMemoryRoomStorage::new()))
    }

    pub fn with_storage(service: impl Into<String>, storage: Arc<dyn RoomStorage>) -> Self {
        Self {
            service: service.into(),
            storage,
        }
    }

    fn key(&self, node: &str) -> RoomKey {
        RoomKey::new(self.service.clone(), node)
    }

    fn room_jid(&self, node: &str) -> Result<BareJid, ConferenceError> {
        format!("{}@{}", node, self.service)
            .parse()
            .map_err(|_| ConferenceError::InvalidAddress(node.to_string()))
    }

    /// Create a room with the given flags. Fails if the address is taken.
    pub fn create_room(
        &self,
        node: &str,
        name: &str,
        types: &[RoomType],
    ) -> Result<Arc<Room>, ConferenceError> {
        let jid = self.room_jid(node)?;
        let room = Arc::new(Room::new(jid.clone(), name, RoomSettings::new(types)?));
        if !self.storage.insert(self.key(node), room.clone()) {
            return Err(ConferenceError::RoomExists(jid.to_string()));
        }
        info!(room = %jid, "room created");
        Ok(room)
    }

    /// Find an existing room, or create it with the given flags. The
    /// storage insert decides races between concurrent first joins.
    pub fn find_or_create_room(
        &self,
        node: &str,
        types: &[RoomType],
    ) -> Result<(Arc<Room>, bool), ConferenceError> {
        if let Some(room) = self.find_room(node) {
            return Ok((room, false));
        }
        match self.create_room(node, node, types) {
            Ok(room) => Ok((room, true)),
            Err(ConferenceError::RoomExists(_)) => self
                .find_room(node)
                .map(|room| (room, false))
                .ok_or_else(|| ConferenceError::InvalidAddress(node.to_string())),
            Err(other) => Err(other),
        }
    }

    pub fn find_room(&self, node: &str) -> Option<Arc<Room>> {
        self.storage.get(&self.key(node))
    }

    pub fn delete_room(&self, node: &str) -> Option<Arc<Room>> {
        let removed = self.storage.remove(&self.key(node));
        if let Some(room) = &removed {
            debug!(room = %room.jid(), "room deleted");
        }
        removed
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.storage.all()
    }

    /// Every room this full JID currently occupies, with the occupant.
    pub fn occupancies_of(&self, jid: &FullJid) -> Vec<(Arc<Room>, Arc<Occupant>)> {
        self.storage
            .all()
            .into_iter()
            .filter_map(|room| {
                room.occupant_by_jid(jid).map(|occupant| (room, occupant))
            })
            .collect()
    }
}
