//! Hub actor
//!
//! One hub per workspace. Its loop owns the registry of connected
//! sessions, the running rooms, and which rooms each local session has
//! joined. Every Join/Leave sent to a room comes from this loop, so the
//! hub can tell when a room has no local members left and reclaim it.
//!
//! A relay task feeds the workspace's general pub/sub channel into the
//! loop, which forwards each payload to every connected session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{COMMAND_QUEUE_CAPACITY, GENERAL_CHANNEL};
use crate::error::{AppError, SendError};
use crate::message::{Action, Payload, WsMessage};
use crate::pubsub::{PubSub, Subscription};
use crate::room::{Room, RoomHandle, RoomInfo};
use crate::session::SessionHandle;
use crate::store::{MessageStore, RoomRecord, RoomStore};
use crate::types::{RoomId, SessionId, UserId, WorkspaceId};

/// Shared collaborators, safe for concurrent use
#[derive(Clone)]
pub struct Collaborators {
    pub pubsub: Arc<dyn PubSub>,
    pub rooms: Arc<dyn RoomStore>,
    pub messages: Arc<dyn MessageStore>,
}

/// Sender id stamped on workspace announcements
pub const SYSTEM_SENDER: &str = "system";

/// Pub/sub key of a workspace's general channel
pub fn general_channel(workspace_id: &WorkspaceId) -> String {
    format!("{}:{}", GENERAL_CHANNEL, workspace_id)
}

/// Snapshot of the hub registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub sessions: usize,
    pub rooms: usize,
}

/// Commands processed by the hub loop
#[derive(Debug)]
pub enum HubCommand {
    Register {
        session: SessionHandle,
    },
    Unregister {
        session_id: SessionId,
    },
    CreateRoom {
        requester: UserId,
        name: String,
        private: bool,
        reply: oneshot::Sender<Result<RoomHandle, AppError>>,
    },
    FindRoomById {
        room_id: RoomId,
        reply: oneshot::Sender<Option<RoomHandle>>,
    },
    FindRoomByName {
        name: String,
        reply: oneshot::Sender<Option<RoomHandle>>,
    },
    /// Persist membership and join every local session of the user
    JoinRoom {
        user_id: UserId,
        room_id: RoomId,
        reply: oneshot::Sender<Result<RoomHandle, AppError>>,
    },
    /// Remove membership and take every local session of the user out.
    /// Replies whether any local session was actually in the room.
    LeaveRoom {
        user_id: UserId,
        room_id: RoomId,
        reply: oneshot::Sender<Result<bool, AppError>>,
    },
    /// Payload from the general channel
    Broadcast {
        payload: Payload,
    },
    /// Idle grace period elapsed for a room. Stale unless `generation`
    /// is still the room's latest.
    ReapRoom {
        room_id: RoomId,
        generation: u64,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable address of a running hub
#[derive(Clone)]
pub struct HubHandle {
    workspace_id: WorkspaceId,
    sender: mpsc::Sender<HubCommand>,
    pubsub: Arc<dyn PubSub>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl HubHandle {
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), AppError> {
        self.send(HubCommand::Register { session }).await
    }

    pub async fn unregister(&self, session_id: SessionId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister { session_id }).await
    }

    pub async fn create_room(
        &self,
        requester: &UserId,
        name: &str,
        private: bool,
    ) -> Result<RoomHandle, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::CreateRoom {
            requester: requester.clone(),
            name: name.to_string(),
            private,
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    /// `Ok(None)` is a routing miss, not a failure
    pub async fn find_room_by_id(&self, room_id: &RoomId) -> Result<Option<RoomHandle>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::FindRoomById {
            room_id: room_id.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomHandle>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::FindRoomByName {
            name: name.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn join_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<RoomHandle, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::JoinRoom {
            user_id: user_id.clone(),
            room_id: room_id.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    /// `Ok(false)` when the user had no local session in the room
    pub async fn leave_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<bool, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::LeaveRoom {
            user_id: user_id.clone(),
            room_id: room_id.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    /// Publish a system message to every session of the workspace, in
    /// every process subscribed to its general channel
    pub async fn announce(&self, text: &str) -> Result<(), AppError> {
        let message = WsMessage::new(
            Action::Announcement,
            text,
            RoomId::default(),
            UserId::new(SYSTEM_SENDER),
        );
        let payload = message.encode()?;
        self.pubsub
            .publish(&general_channel(&self.workspace_id), &payload)
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<HubStats, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }
}

/// The hub actor
pub struct Hub {
    workspace_id: WorkspaceId,
    /// All locally connected sessions
    sessions: HashMap<SessionId, SessionHandle>,
    /// Rooms running in this process
    rooms: HashMap<RoomId, RoomHandle>,
    /// Rooms each local session has joined
    memberships: HashMap<SessionId, HashSet<RoomId>>,
    /// Latest scheduled reap per room
    reap_generation: HashMap<RoomId, u64>,
    backends: Collaborators,
    room_idle_grace: Duration,
    receiver: mpsc::Receiver<HubCommand>,
    reaper: mpsc::WeakSender<HubCommand>,
    relay: JoinHandle<()>,
}

impl Hub {
    /// Subscribe to the general channel and start the hub loop
    pub async fn spawn(
        workspace_id: WorkspaceId,
        backends: Collaborators,
        room_idle_grace: Duration,
    ) -> Result<HubHandle, AppError> {
        let subscription = backends
            .pubsub
            .subscribe(&general_channel(&workspace_id))
            .await?;
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let relay = tokio::spawn(relay_general_channel(
            subscription,
            sender.downgrade(),
            workspace_id.clone(),
        ));

        let hub = Hub {
            workspace_id: workspace_id.clone(),
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            reap_generation: HashMap::new(),
            backends: backends.clone(),
            room_idle_grace,
            receiver,
            reaper: sender.downgrade(),
            relay,
        };
        tokio::spawn(hub.run());

        Ok(HubHandle {
            workspace_id,
            sender,
            pubsub: backends.pubsub,
        })
    }

    /// Run the hub event loop until every handle is dropped
    async fn run(mut self) {
        info!(workspace_id = %self.workspace_id, "Hub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        self.relay.abort();
        for room in self.rooms.values() {
            room.close().await;
        }
        info!(workspace_id = %self.workspace_id, "Hub shutting down");
    }

    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { session } => self.handle_register(session).await,
            HubCommand::Unregister { session_id } => self.handle_unregister(session_id).await,
            HubCommand::CreateRoom {
                requester,
                name,
                private,
                reply,
            } => {
                let result = self.handle_create_room(requester, name, private).await;
                let _ = reply.send(result);
            }
            HubCommand::FindRoomById { room_id, reply } => {
                let room = self.find_room_by_id(&room_id).await;
                let _ = reply.send(room);
            }
            HubCommand::FindRoomByName { name, reply } => {
                let _ = reply.send(self.find_room_by_name(&name));
            }
            HubCommand::JoinRoom {
                user_id,
                room_id,
                reply,
            } => {
                let result = self.handle_join_room(user_id, room_id).await;
                let _ = reply.send(result);
            }
            HubCommand::LeaveRoom {
                user_id,
                room_id,
                reply,
            } => {
                let result = self.handle_leave_room(user_id, room_id).await;
                let _ = reply.send(result);
            }
            HubCommand::Broadcast { payload } => self.broadcast_to_sessions(&payload),
            HubCommand::ReapRoom {
                room_id,
                generation,
            } => self.handle_reap(room_id, generation).await,
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    sessions: self.sessions.len(),
                    rooms: self.rooms.len(),
                });
            }
        }
    }

    async fn handle_register(&mut self, session: SessionHandle) {
        if self.sessions.contains_key(&session.id) {
            return;
        }
        info!(workspace_id = %self.workspace_id, session_id = %session.id, "Session registered");
        self.sessions.insert(session.id, session.clone());
        self.memberships.entry(session.id).or_default();

        let records = match self
            .backends
            .rooms
            .rooms_for_user(&self.workspace_id, &session.user_id)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(user_id = %session.user_id, "Failed to list rooms for user: {}", e);
                return;
            }
        };

        for record in records {
            match self.ensure_room(&record).await {
                Ok(room) => self.join_session(&session, &room).await,
                Err(e) => warn!(room_id = %record.id, "Failed to start room: {}", e),
            }
        }
        debug!(
            "Total sessions: {}, Total rooms: {}",
            self.sessions.len(),
            self.rooms.len()
        );
    }

    async fn handle_unregister(&mut self, session_id: SessionId) {
        if self.sessions.remove(&session_id).is_none() {
            return;
        }
        info!(workspace_id = %self.workspace_id, session_id = %session_id, "Session unregistered");

        let joined = self.memberships.remove(&session_id).unwrap_or_default();
        for room_id in joined {
            if let Some(room) = self.rooms.get(&room_id) {
                let _ = room.leave(session_id).await;
            }
            self.schedule_reap_if_idle(&room_id);
        }
    }

    /// Persist, start, register. A store failure means no room at all.
    async fn handle_create_room(
        &mut self,
        requester: UserId,
        name: String,
        private: bool,
    ) -> Result<RoomHandle, AppError> {
        if self.find_room_by_name(&name).is_some() {
            warn!(name = %name, "Room already exists");
            return Err(AppError::RoomExists(name));
        }

        let info = RoomInfo::new(name, private);
        let record = RoomRecord {
            id: info.id.clone(),
            workspace_id: self.workspace_id.clone(),
            name: info.name.clone(),
            private,
            created_by: requester.clone(),
        };
        if let Err(e) = self.backends.rooms.create_room(record).await {
            error!(name = %info.name, "Failed to create room: {}", e);
            return Err(AppError::RoomNotCreated(e.to_string()));
        }
        if let Err(e) = self.backends.rooms.add_member(&info.id, &requester).await {
            warn!(room_id = %info.id, user_id = %requester, "Failed to add creator membership: {}", e);
        }

        let room = Room::start(info, self.backends.pubsub.clone()).await?;
        info!(room_id = %room.id(), name = %room.name(), "Room created");
        self.rooms.insert(room.id().clone(), room.clone());

        self.join_user(&requester, &room).await;
        self.schedule_reap_if_idle(room.id());
        Ok(room)
    }

    async fn handle_join_room(
        &mut self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<RoomHandle, AppError> {
        let room = self
            .find_room_by_id(&room_id)
            .await
            .ok_or_else(|| AppError::RoomNotFound(room_id.clone()))?;
        self.backends.rooms.add_member(&room_id, &user_id).await?;
        self.join_user(&user_id, &room).await;
        Ok(room)
    }

    async fn handle_leave_room(&mut self, user_id: UserId, room_id: RoomId) -> Result<bool, AppError> {
        self.backends.rooms.remove_member(&room_id, &user_id).await?;

        let Some(room) = self.rooms.get(&room_id).cloned() else {
            return Ok(false);
        };
        let mut left = false;
        let leaving: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .map(|session| session.id)
            .collect();
        for session_id in leaving {
            let joined = self
                .memberships
                .get_mut(&session_id)
                .map(|rooms| rooms.remove(&room_id))
                .unwrap_or(false);
            if joined {
                let _ = room.leave(session_id).await;
                left = true;
            }
        }
        self.schedule_reap_if_idle(&room_id);
        Ok(left)
    }

    /// Running room, or revive it from the store
    async fn find_room_by_id(&mut self, room_id: &RoomId) -> Option<RoomHandle> {
        if let Some(room) = self.rooms.get(room_id) {
            return Some(room.clone());
        }
        let record = match self
            .backends
            .rooms
            .find_room(&self.workspace_id, room_id)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(room_id = %room_id, "Room lookup failed: {}", e);
                return None;
            }
        };
        match self.ensure_room(&record).await {
            Ok(room) => {
                self.schedule_reap_if_idle(room_id);
                Some(room)
            }
            Err(e) => {
                warn!(room_id = %room_id, "Failed to revive room: {}", e);
                None
            }
        }
    }

    fn find_room_by_name(&self, name: &str) -> Option<RoomHandle> {
        self.rooms.values().find(|room| room.name() == name).cloned()
    }

    async fn ensure_room(&mut self, record: &RoomRecord) -> Result<RoomHandle, AppError> {
        if let Some(room) = self.rooms.get(&record.id) {
            return Ok(room.clone());
        }
        let info = RoomInfo {
            id: record.id.clone(),
            name: record.name.clone(),
            private: record.private,
        };
        let room = Room::start(info, self.backends.pubsub.clone()).await?;
        debug!(room_id = %room.id(), "Room instantiated");
        self.rooms.insert(room.id().clone(), room.clone());
        Ok(room)
    }

    /// Join every local session of `user_id`
    async fn join_user(&mut self, user_id: &UserId, room: &RoomHandle) {
        let sessions: Vec<SessionHandle> = self
            .sessions
            .values()
            .filter(|session| &session.user_id == user_id)
            .cloned()
            .collect();
        for session in sessions {
            self.join_session(&session, room).await;
        }
    }

    async fn join_session(&mut self, session: &SessionHandle, room: &RoomHandle) {
        let newly_joined = self
            .memberships
            .entry(session.id)
            .or_default()
            .insert(room.id().clone());
        if !newly_joined {
            return;
        }
        if let Err(e) = room.join(session.clone()).await {
            warn!(room_id = %room.id(), session_id = %session.id, "Failed to join room: {}", e);
        }
    }

    fn has_local_members(&self, room_id: &RoomId) -> bool {
        self.memberships.values().any(|rooms| rooms.contains(room_id))
    }

    /// Start the idle timer. A later schedule supersedes any pending one,
    /// so a room is only reaped after a full grace period empty.
    fn schedule_reap_if_idle(&mut self, room_id: &RoomId) {
        if !self.rooms.contains_key(room_id) || self.has_local_members(room_id) {
            return;
        }
        let Some(hub) = self.reaper.upgrade() else {
            return;
        };
        let generation = self.reap_generation.entry(room_id.clone()).or_default();
        *generation += 1;
        let generation = *generation;

        let room_id = room_id.clone();
        let grace = self.room_idle_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = hub.send(HubCommand::ReapRoom { room_id, generation }).await;
        });
    }

    async fn handle_reap(&mut self, room_id: RoomId, generation: u64) {
        if self.reap_generation.get(&room_id) != Some(&generation) {
            debug!(room_id = %room_id, generation, "Stale reap ignored");
            return;
        }
        if self.has_local_members(&room_id) {
            return;
        }
        self.reap_generation.remove(&room_id);
        if let Some(room) = self.rooms.remove(&room_id) {
            info!(room_id = %room_id, "Reclaiming idle room");
            room.close().await;
        }
    }

    /// Forward a general-channel payload to every connected session
    fn broadcast_to_sessions(&self, payload: &Payload) {
        for session in self.sessions.values() {
            if let Err(SendError::QueueFull) = session.deliver(payload.clone()) {
                warn!(session_id = %session.id, "Outbound queue full, disconnecting");
                session.close();
            }
        }
    }
}

async fn relay_general_channel(
    mut subscription: Subscription,
    hub: mpsc::WeakSender<HubCommand>,
    workspace_id: WorkspaceId,
) {
    while let Some(item) = subscription.next().await {
        match item {
            Ok(payload) => {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let payload: Payload = Arc::from(payload);
                if hub.send(HubCommand::Broadcast { payload }).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(workspace_id = %workspace_id, "General channel error: {}", e),
        }
    }
    debug!(workspace_id = %workspace_id, "General channel relay ended");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::error::StoreError;
    use crate::pubsub::MemoryPubSub;
    use crate::store::{MemoryMessageStore, MemoryRoomStore};
    use crate::types::Identity;

    const WAIT: Duration = Duration::from_secs(2);

    fn backends(rooms: Arc<dyn RoomStore>) -> (Collaborators, Arc<MemoryPubSub>) {
        let pubsub = Arc::new(MemoryPubSub::new());
        let backends = Collaborators {
            pubsub: pubsub.clone(),
            rooms,
            messages: Arc::new(MemoryMessageStore::new()),
        };
        (backends, pubsub)
    }

    async fn spawn_hub(grace: Duration) -> (HubHandle, Arc<MemoryRoomStore>, Arc<MemoryPubSub>) {
        let store = Arc::new(MemoryRoomStore::new());
        let (backends, pubsub) = backends(store.clone());
        let hub = Hub::spawn(WorkspaceId::new("w1"), backends, grace)
            .await
            .unwrap();
        (hub, store, pubsub)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Payload>) -> WsMessage {
        let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        WsMessage::decode(&payload).unwrap()
    }

    async fn eventually<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Store that refuses every room creation
    struct FailingRooms;

    #[async_trait]
    impl RoomStore for FailingRooms {
        async fn create_room(&self, _record: RoomRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn find_room(
            &self,
            _workspace_id: &WorkspaceId,
            _room_id: &RoomId,
        ) -> Result<Option<RoomRecord>, StoreError> {
            Ok(None)
        }
        async fn add_member(&self, _room_id: &RoomId, _user_id: &UserId) -> Result<(), StoreError> {
            Ok(())
        }
        async fn remove_member(&self, _room_id: &RoomId, _user_id: &UserId) -> Result<(), StoreError> {
            Ok(())
        }
        async fn rooms_for_user(
            &self,
            _workspace_id: &WorkspaceId,
            _user_id: &UserId,
        ) -> Result<Vec<RoomRecord>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister_idempotent() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let (session, _rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);

        hub.register(session.clone()).await.unwrap();
        hub.register(session.clone()).await.unwrap();
        assert_eq!(hub.stats().await.unwrap().sessions, 1);

        hub.unregister(session.id).await.unwrap();
        hub.unregister(session.id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap().sessions, 0);
    }

    #[tokio::test]
    async fn test_create_room_joins_requester_sessions() {
        let (hub, store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let (first, _first_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        let (second, _second_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        let (other, _other_rx) = SessionHandle::new(&Identity::new("u2", "Bob"), 8);
        for session in [&first, &second, &other] {
            hub.register(session.clone()).await.unwrap();
        }

        let room = hub.create_room(&UserId::new("u1"), "random", false).await.unwrap();

        let mut members = room.members().await.unwrap();
        members.sort_by_key(|id| id.0);
        let mut expected = vec![first.id, second.id];
        expected.sort_by_key(|id| id.0);
        assert_eq!(members, expected);

        let found = hub.find_room_by_name("random").await.unwrap().unwrap();
        assert_eq!(found.id(), room.id());
        let found = hub.find_room_by_id(room.id()).await.unwrap().unwrap();
        assert_eq!(found.name(), "random");

        let rooms = store
            .rooms_for_user(&WorkspaceId::new("w1"), &UserId::new("u1"))
            .await
            .unwrap();
        assert_eq!(rooms.len(), 1);

        let duplicate = hub.create_room(&UserId::new("u2"), "random", false).await;
        assert!(matches!(duplicate, Err(AppError::RoomExists(_))));
    }

    #[tokio::test]
    async fn test_create_room_store_failure_creates_nothing() {
        let (backends, pubsub) = backends(Arc::new(FailingRooms));
        let hub = Hub::spawn(WorkspaceId::new("w1"), backends, Duration::from_secs(60))
            .await
            .unwrap();

        let result = hub.create_room(&UserId::new("u1"), "broken", false).await;
        assert!(matches!(result, Err(AppError::RoomNotCreated(_))));
        assert_eq!(hub.stats().await.unwrap().rooms, 0);
        assert!(hub.find_room_by_name("broken").await.unwrap().is_none());
        // Only the general channel subscription exists
        assert_eq!(pubsub.subscriber_count(&general_channel(hub.workspace_id())), 1);
    }

    #[tokio::test]
    async fn test_find_unknown_room_is_a_miss() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        assert!(hub.find_room_by_id(&RoomId::new("nope")).await.unwrap().is_none());
        assert!(hub.find_room_by_name("nope").await.unwrap().is_none());
        assert!(matches!(
            hub.join_room(&UserId::new("u1"), &RoomId::new("nope")).await,
            Err(AppError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_joins_persisted_rooms() {
        let (hub, store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let record = RoomRecord {
            id: RoomId::new("r1"),
            workspace_id: WorkspaceId::new("w1"),
            name: "general".to_string(),
            private: false,
            created_by: UserId::new("u0"),
        };
        store.create_room(record).await.unwrap();
        store.add_member(&RoomId::new("r1"), &UserId::new("u1")).await.unwrap();

        let (session, mut rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        hub.register(session.clone()).await.unwrap();

        let room = hub.find_room_by_id(&RoomId::new("r1")).await.unwrap().unwrap();
        assert_eq!(room.members().await.unwrap(), vec![session.id]);

        let welcome = next_message(&mut rx).await;
        assert_eq!(welcome.action, Action::JoinRoom);
        assert_eq!(welcome.content, "Alice joined the room.");
    }

    #[tokio::test]
    async fn test_unregister_leaves_rooms() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let (a, _a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        let (b, _b_rx) = SessionHandle::new(&Identity::new("u2", "Bob"), 8);
        hub.register(a.clone()).await.unwrap();
        hub.register(b.clone()).await.unwrap();

        let room = hub.create_room(&UserId::new("u1"), "general", false).await.unwrap();
        hub.join_room(&UserId::new("u2"), room.id()).await.unwrap();
        assert_eq!(room.members().await.unwrap().len(), 2);

        hub.unregister(a.id).await.unwrap();
        assert_eq!(room.members().await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_leave_room_removes_all_user_sessions() {
        let (hub, store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let (a, _a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        hub.register(a.clone()).await.unwrap();
        let room = hub.create_room(&UserId::new("u1"), "general", false).await.unwrap();

        assert!(hub.leave_room(&UserId::new("u1"), room.id()).await.unwrap());
        assert!(!hub.leave_room(&UserId::new("u1"), room.id()).await.unwrap());

        assert!(room.members().await.unwrap().is_empty());
        let rooms = store
            .rooms_for_user(&WorkspaceId::new("w1"), &UserId::new("u1"))
            .await
            .unwrap();
        assert!(rooms.is_empty());
    }

    #[tokio::test]
    async fn test_announce_reaches_every_session() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_secs(60)).await;
        let (a, mut a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        let (b, mut b_rx) = SessionHandle::new(&Identity::new("u2", "Bob"), 8);
        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();

        hub.announce("maintenance at noon").await.unwrap();

        for rx in [&mut a_rx, &mut b_rx] {
            let message = next_message(rx).await;
            assert_eq!(message.action, Action::Announcement);
            assert_eq!(message.content, "maintenance at noon");
            assert_eq!(message.sender, UserId::new(SYSTEM_SENDER));
        }
    }

    #[tokio::test]
    async fn test_idle_room_reclaimed_and_revived() {
        let (hub, _store, pubsub) = spawn_hub(Duration::from_millis(100)).await;
        let (a, _a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        hub.register(a.clone()).await.unwrap();
        let room = hub.create_room(&UserId::new("u1"), "general", false).await.unwrap();
        let room_id = room.id().clone();

        hub.unregister(a.id).await.unwrap();

        eventually(|| room.is_closed()).await;
        eventually(|| pubsub.subscriber_count(room_id.as_str()) == 0).await;
        assert_eq!(hub.stats().await.unwrap().rooms, 0);

        // Still persisted, so a lookup brings it back
        let revived = hub.find_room_by_id(&room_id).await.unwrap().unwrap();
        assert_eq!(revived.name(), "general");
        assert!(!revived.is_closed());
    }

    #[tokio::test]
    async fn test_rejoin_restarts_idle_grace() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_millis(300)).await;
        let user = UserId::new("u1");
        let (a, _a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        hub.register(a.clone()).await.unwrap();
        let room = hub.create_room(&user, "general", false).await.unwrap();

        hub.leave_room(&user, room.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.join_room(&user, room.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        hub.leave_room(&user, room.id()).await.unwrap();

        // First timer has fired by now, but the room has only been empty ~200ms
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!room.is_closed());
        assert_eq!(hub.stats().await.unwrap().rooms, 1);

        eventually(|| room.is_closed()).await;
        assert_eq!(hub.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_room_with_members_is_not_reclaimed() {
        let (hub, _store, _pubsub) = spawn_hub(Duration::from_millis(10)).await;
        let (a, _a_rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 8);
        hub.register(a.clone()).await.unwrap();
        let room = hub.create_room(&UserId::new("u1"), "general", false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!room.is_closed());
        assert_eq!(hub.stats().await.unwrap().rooms, 1);
    }
}
