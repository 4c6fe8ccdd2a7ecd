//! Client session
//!
//! One authenticated duplex connection. The read pump decodes frames and
//! dispatches them to rooms or the hub; the write pump drains the bounded
//! outbound queue to the wire and keeps the peer alive with pings.
//!
//! Rooms and the hub never own a session: they hold a cloneable
//! [`SessionHandle`] keyed by [`SessionId`] and talk to it only through its
//! outbound queue and its close signal.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{render, Timeouts, GOODBYE_TEMPLATE};
use crate::error::{AppError, SendError};
use crate::hub::HubHandle;
use crate::message::{Action, MessageList, Payload, StoredMessage, WsMessage};
use crate::store::MessageStore;
use crate::types::{Identity, SessionId, UserId};

/// Cheap, cloneable reference to a live session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    pub name: String,
    outbound: mpsc::Sender<Payload>,
    closed: CancellationToken,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(identity: &Identity, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (outbound, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: SessionId::new(),
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            outbound,
            closed: CancellationToken::new(),
        };
        (handle, receiver)
    }

    /// Queue a payload without waiting
    ///
    /// A full queue means the peer is not keeping up; callers close the
    /// session rather than wait on it.
    pub fn deliver(&self, payload: Payload) -> Result<(), SendError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    /// Ask both pumps to stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once the session has been asked to close
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// An admitted connection, ready to run its pumps
pub struct Session {
    handle: SessionHandle,
    outbound: mpsc::Receiver<Payload>,
    hub: HubHandle,
    messages: Arc<dyn MessageStore>,
    timeouts: Timeouts,
}

impl Session {
    /// Bind a verified identity to a hub and allocate its outbound queue
    pub fn admit(
        identity: Identity,
        hub: HubHandle,
        messages: Arc<dyn MessageStore>,
        timeouts: Timeouts,
    ) -> Self {
        let (handle, outbound) = SessionHandle::new(&identity, timeouts.queue_capacity);
        Self {
            handle,
            outbound,
            hub,
            messages,
            timeouts,
        }
    }

    /// Register with the hub and pump the connection until it ends
    pub async fn run<S>(self, ws: S) -> Result<(), AppError>
    where
        S: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Send
            + Unpin
            + 'static,
    {
        let Session {
            handle,
            outbound,
            hub,
            messages,
            timeouts,
        } = self;

        let (sink, stream) = ws.split();

        hub.register(handle.clone()).await?;
        info!(session_id = %handle.id, user_id = %handle.user_id, "Session registered");

        let write_task = tokio::spawn(write_loop(sink, outbound, handle.closed.clone(), timeouts));

        let dispatcher = Dispatcher {
            session: handle.clone(),
            hub: hub.clone(),
            messages,
        };
        let read_result = read_loop(stream, &dispatcher, timeouts).await;

        disconnect(&handle, &hub).await;

        match write_task.await {
            Ok(Err(e)) => debug!(session_id = %handle.id, "Write loop ended: {}", e),
            Err(e) => warn!(session_id = %handle.id, "Write task failed: {}", e),
            Ok(Ok(())) => {}
        }

        info!(session_id = %handle.id, "Session ended");
        read_result
    }
}

/// Unregister from the hub and stop both pumps. Idempotent.
pub async fn disconnect(session: &SessionHandle, hub: &HubHandle) {
    session.close();
    if let Err(e) = hub.unregister(session.id).await {
        debug!(session_id = %session.id, "Hub gone during disconnect: {}", e);
    }
}

/// Read inbound frames until the peer goes away, the read deadline passes,
/// or the session is closed from elsewhere.
async fn read_loop<St>(
    mut stream: St,
    dispatcher: &Dispatcher,
    timeouts: Timeouts,
) -> Result<(), AppError>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let session_id = dispatcher.session.id;
    let mut deadline = Instant::now() + timeouts.pong_wait;

    loop {
        let next = tokio::select! {
            _ = dispatcher.session.closed() => return Ok(()),
            next = timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!(session_id = %session_id, "No pong within read deadline");
                return Err(AppError::ReadTimeout);
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => {
                warn!(session_id = %session_id, "WebSocket read error: {}", e);
                return Err(e.into());
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                check_size(text.len(), timeouts.max_message_size)?;
                dispatcher.handle_frame(&text).await;
            }
            Message::Binary(data) => {
                check_size(data.len(), timeouts.max_message_size)?;
                match std::str::from_utf8(&data) {
                    Ok(text) => dispatcher.handle_frame(text).await,
                    Err(_) => warn!(session_id = %session_id, "Dropping non UTF-8 binary frame"),
                }
            }
            Message::Pong(_) => {
                deadline = Instant::now() + timeouts.pong_wait;
            }
            Message::Ping(_) => {
                // tungstenite answers with a pong on its own
            }
            Message::Close(_) => {
                debug!(session_id = %session_id, "Peer sent close frame");
                return Ok(());
            }
            Message::Frame(_) => {}
        }
    }
}

fn check_size(size: usize, max: usize) -> Result<(), AppError> {
    if size > max {
        warn!(size, max, "Oversized frame, disconnecting");
        return Err(AppError::FrameTooLarge { size, max });
    }
    Ok(())
}

/// Drain the outbound queue to the wire and send periodic pings.
///
/// Everything already queued when a payload is taken goes out in the same
/// text frame, newline separated.
async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Payload>,
    closed: CancellationToken,
    timeouts: Timeouts,
) -> Result<(), AppError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + timeouts.ping_period,
        timeouts.ping_period,
    );

    let result = loop {
        tokio::select! {
            _ = closed.cancelled() => break Ok(()),
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break Ok(());
                };
                let frame = coalesce(payload, &mut outbound, timeouts.queue_capacity);
                if let Err(e) = send_with_deadline(&mut sink, Message::Text(frame.into()), timeouts).await {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, Message::Ping(Vec::<u8>::new().into()), timeouts).await {
                    break Err(e);
                }
            }
        }
    };

    // Wakes the read loop when the write side failed first
    closed.cancel();
    outbound.close();
    let _ = timeout(timeouts.write_wait, sink.close()).await;
    result
}

fn coalesce(first: Payload, outbound: &mut mpsc::Receiver<Payload>, limit: usize) -> String {
    let mut frame = String::from(&*first);
    for _ in 1..limit {
        match outbound.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

async fn send_with_deadline<Si>(sink: &mut Si, frame: Message, timeouts: Timeouts) -> Result<(), AppError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(timeouts.write_wait, sink.send(frame)).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::WriteTimeout),
    }
}

/// Routes decoded frames on behalf of one session
struct Dispatcher {
    session: SessionHandle,
    hub: HubHandle,
    messages: Arc<dyn MessageStore>,
}

impl Dispatcher {
    /// Decode, stamp and route one inbound frame.
    ///
    /// Nothing here is fatal to the session: misses and failures are
    /// logged and the frame is dropped.
    async fn handle_frame(&self, raw: &str) {
        let mut message = match WsMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session.id, "Dropping undecodable frame: {}", e);
                return;
            }
        };
        message.sender = self.session.user_id.clone();
        let action = message.action;

        let result = match action {
            Action::ListMessages => self.list_messages(message).await,
            Action::CreateMessage => self.create_message(message).await,
            Action::UpdateMessage => self.update_message(message).await,
            Action::DeleteMessage => self.delete_message(message).await,
            Action::CreateRoom => self.create_room(message).await,
            Action::JoinRoom => self.join_room(message).await,
            Action::LeaveRoom => self.leave_room(message).await,
            Action::Announcement => {
                warn!(session_id = %self.session.id, "Clients may not send announcements");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(
                session_id = %self.session.id,
                action = ?action,
                "Dropped message: {}", e
            );
        }
    }

    async fn list_messages(&self, message: WsMessage) -> Result<(), AppError> {
        if self.hub.find_room_by_id(&message.target).await?.is_none() {
            debug!(room_id = %message.target, "List for unknown room dropped");
            return Ok(());
        }
        let messages = self.messages.list(&message.target).await?;
        let payload = MessageList::new(message.target, messages).encode()?;
        if let Err(e) = self.session.deliver(payload) {
            if e == SendError::QueueFull {
                self.session.close();
            }
        }
        Ok(())
    }

    async fn create_message(&self, mut message: WsMessage) -> Result<(), AppError> {
        let Some(room) = self.hub.find_room_by_id(&message.target).await? else {
            debug!(room_id = %message.target, "Room not found");
            return Ok(());
        };
        message.id = uuid::Uuid::new_v4().to_string();
        self.messages
            .create(StoredMessage::from_envelope(&message))
            .await?;
        debug!(room_id = %room.id(), message_id = %message.id, "Broadcasting message");
        room.broadcast(message).await
    }

    async fn update_message(&self, message: WsMessage) -> Result<(), AppError> {
        let Some(room) = self.hub.find_room_by_id(&message.target).await? else {
            debug!(room_id = %message.target, "Room not found");
            return Ok(());
        };
        self.messages
            .update(room.id(), &message.id, &message.content, &message.sender)
            .await?;
        room.broadcast(message).await
    }

    async fn delete_message(&self, message: WsMessage) -> Result<(), AppError> {
        let Some(room) = self.hub.find_room_by_id(&message.target).await? else {
            debug!(room_id = %message.target, "Room not found");
            return Ok(());
        };
        self.messages
            .delete(&message.target, &message.id, &message.sender)
            .await?;
        room.broadcast(message).await
    }

    async fn create_room(&self, message: WsMessage) -> Result<(), AppError> {
        let name = message.content.trim();
        if name.is_empty() {
            debug!(session_id = %self.session.id, "Room name missing");
            return Ok(());
        }
        let room = self.hub.create_room(&message.sender, name, false).await?;
        let announcement = WsMessage::new(
            Action::CreateRoom,
            room.name(),
            room.id().clone(),
            message.sender,
        );
        room.broadcast(announcement).await
    }

    async fn join_room(&self, message: WsMessage) -> Result<(), AppError> {
        self.hub.join_room(&message.sender, &message.target).await?;
        Ok(())
    }

    async fn leave_room(&self, message: WsMessage) -> Result<(), AppError> {
        let Some(room) = self.hub.find_room_by_id(&message.target).await? else {
            debug!(room_id = %message.target, "Room not found");
            return Ok(());
        };
        if !self.hub.leave_room(&message.sender, room.id()).await? {
            debug!(room_id = %room.id(), user_id = %message.sender, "Leave from non-member dropped");
            return Ok(());
        }
        let goodbye = WsMessage::new(
            Action::LeaveRoom,
            render(GOODBYE_TEMPLATE, &self.session.name),
            room.id().clone(),
            message.sender,
        );
        room.broadcast(goodbye).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Payload {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_handle_deliver_and_backpressure() {
        let (handle, mut rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 1);

        assert!(handle.deliver(payload("a")).is_ok());
        assert_eq!(handle.deliver(payload("b")), Err(SendError::QueueFull));
        assert_eq!(&*rx.recv().await.unwrap(), "a");

        drop(rx);
        assert_eq!(handle.deliver(payload("c")), Err(SendError::ChannelClosed));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (handle, _rx) = SessionHandle::new(&Identity::new("u1", "Alice"), 4);
        assert!(!handle.is_closed());
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_coalesce_joins_queued_payloads() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(payload("two")).await.unwrap();
        tx.send(payload("three")).await.unwrap();

        let frame = coalesce(payload("one"), &mut rx, 8);
        assert_eq!(frame, "one\ntwo\nthree");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coalesce_respects_limit() {
        let (tx, mut rx) = mpsc::channel(8);
        for text in ["b", "c", "d"] {
            tx.send(payload(text)).await.unwrap();
        }

        let frame = coalesce(payload("a"), &mut rx, 2);
        assert_eq!(frame, "a\nb");
        assert_eq!(&*rx.try_recv().unwrap(), "c");
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(10, 10).is_ok());
        assert!(matches!(
            check_size(11, 10),
            Err(AppError::FrameTooLarge { size: 11, max: 10 })
        ));
    }
}
