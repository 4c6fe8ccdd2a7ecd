//! Room actor
//!
//! One control loop per room owns the member set. Broadcasts are encoded
//! once and published to the room's pub/sub channel; a relay task feeds
//! every payload received on that channel back into the loop, which fans
//! it out to the local members. Local and remote traffic therefore take
//! the same path and keep the same order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{render, COMMAND_QUEUE_CAPACITY, WELCOME_TEMPLATE};
use crate::error::{AppError, SendError};
use crate::message::{Action, Payload, WsMessage};
use crate::pubsub::{PubSub, Subscription};
use crate::session::SessionHandle;
use crate::types::{RoomId, SessionId};

/// Static description of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub name: String,
    /// Private rooms do not announce joins
    pub private: bool,
}

impl RoomInfo {
    pub fn new(name: impl Into<String>, private: bool) -> Self {
        Self {
            id: RoomId::generate(),
            name: name.into(),
            private,
        }
    }
}

/// Lifecycle of a room loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Running,
    /// Close requested; pending commands are drained and dropped
    Draining,
    Closed,
}

/// Commands processed by the room loop, in arrival order
#[derive(Debug)]
pub enum RoomCommand {
    Join { session: SessionHandle },
    Leave { session_id: SessionId },
    /// Encode and publish on the room channel
    Broadcast { message: WsMessage },
    /// Payload received from the room channel, fan out locally
    Deliver { payload: Payload },
    Members { reply: oneshot::Sender<Vec<SessionId>> },
    Close,
}

/// Cloneable address of a running room
#[derive(Debug, Clone)]
pub struct RoomHandle {
    info: Arc<RoomInfo>,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> &RoomId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub async fn join(&self, session: SessionHandle) -> Result<(), AppError> {
        self.send(RoomCommand::Join { session }).await
    }

    pub async fn leave(&self, session_id: SessionId) -> Result<(), AppError> {
        self.send(RoomCommand::Leave { session_id }).await
    }

    pub async fn broadcast(&self, message: WsMessage) -> Result<(), AppError> {
        self.send(RoomCommand::Broadcast { message }).await
    }

    /// Current local members
    pub async fn members(&self) -> Result<Vec<SessionId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Members { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn close(&self) {
        let _ = self.sender.send(RoomCommand::Close).await;
    }

    /// True once the loop has stopped accepting commands
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }
}

/// The room actor
pub struct Room {
    info: Arc<RoomInfo>,
    members: HashMap<SessionId, SessionHandle>,
    receiver: mpsc::Receiver<RoomCommand>,
    pubsub: Arc<dyn PubSub>,
    relay: JoinHandle<()>,
    state: RoomState,
}

impl Room {
    /// Subscribe to the room channel, then start the relay and the loop.
    ///
    /// The subscription is live before the handle is returned, so nothing
    /// broadcast through the handle can be missed by local members.
    pub async fn start(info: RoomInfo, pubsub: Arc<dyn PubSub>) -> Result<RoomHandle, AppError> {
        let subscription = pubsub.subscribe(info.id.as_str()).await?;
        let info = Arc::new(info);
        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let relay = tokio::spawn(relay_room_messages(
            subscription,
            sender.downgrade(),
            info.id.clone(),
        ));

        let room = Room {
            info: info.clone(),
            members: HashMap::new(),
            receiver,
            pubsub,
            relay,
            state: RoomState::Running,
        };
        tokio::spawn(room.run());

        Ok(RoomHandle { info, sender })
    }

    async fn run(mut self) {
        info!(room_id = %self.info.id, name = %self.info.name, "Room started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        self.relay.abort();
        self.members.clear();
        self.state = RoomState::Closed;
        info!(room_id = %self.info.id, state = ?self.state, "Room stopped");
    }

    async fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Members { reply } => {
                let _ = reply.send(self.members.keys().copied().collect());
            }
            _ if self.state != RoomState::Running => {
                debug!(room_id = %self.info.id, "Dropping command while draining");
            }
            RoomCommand::Join { session } => self.handle_join(session).await,
            RoomCommand::Leave { session_id } => self.handle_leave(session_id),
            RoomCommand::Broadcast { message } => self.publish(&message).await,
            RoomCommand::Deliver { payload } => self.fan_out(&payload),
            RoomCommand::Close => self.begin_close(),
        }
    }

    async fn handle_join(&mut self, session: SessionHandle) {
        if self.members.contains_key(&session.id) {
            return;
        }
        // Announce before admitting so the existing members hear about it
        if !self.info.private {
            let welcome = WsMessage::new(
                Action::JoinRoom,
                render(WELCOME_TEMPLATE, &session.name),
                self.info.id.clone(),
                session.user_id.clone(),
            );
            self.publish(&welcome).await;
        }
        debug!(room_id = %self.info.id, session_id = %session.id, "Session joined");
        self.members.insert(session.id, session);
    }

    fn handle_leave(&mut self, session_id: SessionId) {
        if self.members.remove(&session_id).is_some() {
            debug!(room_id = %self.info.id, session_id = %session_id, "Session left");
        }
    }

    async fn publish(&self, message: &WsMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(room_id = %self.info.id, "Failed to encode message: {}", e);
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(self.info.id.as_str(), &payload).await {
            error!(room_id = %self.info.id, "Failed to publish message: {}", e);
        }
    }

    /// Deliver to every member without waiting on any of them.
    /// A member whose queue is full is disconnected.
    fn fan_out(&mut self, payload: &Payload) {
        let mut gone = Vec::new();
        for (id, session) in &self.members {
            match session.deliver(payload.clone()) {
                Ok(()) => {}
                Err(SendError::QueueFull) => {
                    warn!(room_id = %self.info.id, session_id = %id, "Outbound queue full, disconnecting");
                    session.close();
                    gone.push(*id);
                }
                Err(SendError::ChannelClosed) => gone.push(*id),
            }
        }
        for id in gone {
            self.members.remove(&id);
        }
    }

    fn begin_close(&mut self) {
        self.state = RoomState::Draining;
        info!(room_id = %self.info.id, state = ?self.state, "Room closing");
        self.relay.abort();
        self.members.clear();
        self.receiver.close();
    }
}

/// Feed payloads from the room channel back into the room loop
async fn relay_room_messages(
    mut subscription: Subscription,
    room: mpsc::WeakSender<RoomCommand>,
    room_id: RoomId,
) {
    while let Some(item) = subscription.next().await {
        match item {
            Ok(payload) => {
                let Some(room) = room.upgrade() else {
                    break;
                };
                let payload: Payload = Arc::from(payload);
                if room.send(RoomCommand::Deliver { payload }).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(room_id = %room_id, "Room subscription error: {}", e),
        }
    }
    debug!(room_id = %room_id, "Room relay ended");
}
