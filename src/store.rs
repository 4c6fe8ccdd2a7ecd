//! Persistence collaborators
//!
//! Room records, room memberships and recent messages live behind these
//! traits. The in-memory implementations back the binary and the tests;
//! a database-backed implementation only has to honour the same contracts.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::message::StoredMessage;
use crate::types::{RoomId, UserId, WorkspaceId};

/// Persisted room record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub private: bool,
    pub created_by: UserId,
}

/// Rooms and user memberships of a workspace
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn create_room(&self, record: RoomRecord) -> Result<(), StoreError>;

    async fn find_room(
        &self,
        workspace_id: &WorkspaceId,
        room_id: &RoomId,
    ) -> Result<Option<RoomRecord>, StoreError>;

    /// Idempotent
    async fn add_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), StoreError>;

    /// Idempotent
    async fn remove_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), StoreError>;

    async fn rooms_for_user(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &UserId,
    ) -> Result<Vec<RoomRecord>, StoreError>;
}

/// Recent-message cache
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: StoredMessage) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>, StoreError>;

    /// Messages of a room in creation order
    async fn list(&self, room_id: &RoomId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Only the author may edit, and only within the message's own room
    async fn update(
        &self,
        room_id: &RoomId,
        id: &str,
        text: &str,
        editor: &UserId,
    ) -> Result<StoredMessage, StoreError>;

    /// Only the author may delete
    async fn delete(&self, room_id: &RoomId, id: &str, editor: &UserId) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct RoomTables {
    rooms: HashMap<RoomId, RoomRecord>,
    members: HashMap<RoomId, HashSet<UserId>>,
}

/// In-memory [`RoomStore`]
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    tables: RwLock<RoomTables>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn create_room(&self, record: RoomRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.rooms.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.to_string()));
        }
        tables.rooms.insert(record.id.clone(), record);
        Ok(())
    }

    async fn find_room(
        &self,
        workspace_id: &WorkspaceId,
        room_id: &RoomId,
    ) -> Result<Option<RoomRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .rooms
            .get(room_id)
            .filter(|record| &record.workspace_id == workspace_id)
            .cloned())
    }

    async fn add_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound(room_id.to_string()));
        }
        tables
            .members
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.clone());
        Ok(())
    }

    async fn remove_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(members) = tables.members.get_mut(room_id) {
            members.remove(user_id);
        }
        Ok(())
    }

    async fn rooms_for_user(
        &self,
        workspace_id: &WorkspaceId,
        user_id: &UserId,
    ) -> Result<Vec<RoomRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut rooms: Vec<RoomRecord> = tables
            .members
            .iter()
            .filter(|(_, members)| members.contains(user_id))
            .filter_map(|(room_id, _)| tables.rooms.get(room_id))
            .filter(|record| &record.workspace_id == workspace_id)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rooms)
    }
}

#[derive(Debug, Default)]
struct MessageTables {
    by_id: HashMap<String, StoredMessage>,
    /// room -> (sequence -> message id)
    by_room: HashMap<RoomId, BTreeMap<u64, String>>,
    sequence: u64,
}

/// In-memory [`MessageStore`]
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    tables: RwLock<MessageTables>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: StoredMessage) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.by_id.contains_key(&message.id) {
            return Err(StoreError::Conflict(message.id));
        }
        tables.sequence += 1;
        let seq = tables.sequence;
        tables
            .by_room
            .entry(message.room_id.clone())
            .or_default()
            .insert(seq, message.id.clone());
        tables.by_id.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.tables.read().await.by_id.get(id).cloned())
    }

    async fn list(&self, room_id: &RoomId) -> Result<Vec<StoredMessage>, StoreError> {
        let tables = self.tables.read().await;
        let Some(ids) = tables.by_room.get(room_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .values()
            .filter_map(|id| tables.by_id.get(id))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        room_id: &RoomId,
        id: &str,
        text: &str,
        editor: &UserId,
    ) -> Result<StoredMessage, StoreError> {
        let mut tables = self.tables.write().await;
        let message = tables
            .by_id
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if &message.user_id != editor {
            return Err(StoreError::Forbidden);
        }
        if &message.room_id != room_id {
            return Err(StoreError::NotFound(id.to_string()));
        }
        message.text = text.to_string();
        message.updated_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn delete(&self, room_id: &RoomId, id: &str, editor: &UserId) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let message = tables
            .by_id
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if &message.user_id != editor {
            return Err(StoreError::Forbidden);
        }
        if &message.room_id != room_id {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tables.by_id.remove(id);
        if let Some(ids) = tables.by_room.get_mut(room_id) {
            ids.retain(|_, message_id| message_id != id);
        }
        Ok(())
    }
}
