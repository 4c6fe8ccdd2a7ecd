//! Message protocol definitions
//!
//! JSON envelope shared by the wire and by pub/sub payloads:
//! `{id, action, content, target, sender}`. Encoding happens once, in the
//! loop that publishes; every receiver gets the same bytes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{RoomId, UserId};

/// Encoded frame as queued on a session's outbound queue
pub type Payload = Arc<str>;

/// Action tag of a [`WsMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// List stored messages of the target room (reply goes to the requester only)
    ListMessages,
    /// Post a new message to the target room
    CreateMessage,
    /// Edit a message previously posted by the sender
    UpdateMessage,
    /// Remove a message previously posted by the sender
    DeleteMessage,
    /// Create a public room named by `content`
    CreateRoom,
    /// Join the target room; also the tag of join announcements
    JoinRoom,
    /// Leave the target room; also the tag of leave announcements
    LeaveRoom,
    /// Workspace-wide system announcement
    Announcement,
}

/// Wire/pub-sub message envelope
///
/// `sender` is always stamped by the server with the authenticated user id;
/// whatever the client supplies there is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(default)]
    pub id: String,
    pub action: Action,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub target: RoomId,
    #[serde(default)]
    pub sender: UserId,
}

impl WsMessage {
    pub fn new(action: Action, content: impl Into<String>, target: RoomId, sender: UserId) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            content: content.into(),
            target,
            sender,
        }
    }

    /// Decode an inbound frame
    pub fn decode(raw: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode into the shared payload representation
    pub fn encode(&self) -> Result<Payload, AppError> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// A message as kept by the message store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn from_envelope(message: &WsMessage) -> Self {
        Self {
            id: message.id.clone(),
            room_id: message.target.clone(),
            user_id: message.sender.clone(),
            text: message.content.clone(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// Reply to `LIST_MESSAGES`, sent only to the requesting session
#[derive(Debug, Clone, Serialize)]
pub struct MessageList {
    pub action: Action,
    pub target: RoomId,
    pub messages: Vec<StoredMessage>,
}

impl MessageList {
    pub fn new(target: RoomId, messages: Vec<StoredMessage>) -> Self {
        Self {
            action: Action::ListMessages,
            target,
            messages,
        }
    }

    pub fn encode(&self) -> Result<Payload, AppError> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{"action": "CREATE_MESSAGE", "target": "r1", "content": "hi"}"#;
        let msg = WsMessage::decode(json).unwrap();
        assert_eq!(msg.action, Action::CreateMessage);
        assert_eq!(msg.target, RoomId::new("r1"));
        assert_eq!(msg.content, "hi");
        assert!(msg.id.is_empty());
        assert_eq!(msg.sender, UserId::default());
    }

    #[test]
    fn test_unknown_action_rejected() {
        let json = r#"{"action": "SHUTDOWN_SERVER", "target": "r1"}"#;
        assert!(matches!(WsMessage::decode(json), Err(AppError::Json(_))));
    }

    #[test]
    fn test_envelope_field_names() {
        let msg = WsMessage {
            id: "m1".to_string(),
            action: Action::CreateRoom,
            content: "random".to_string(),
            target: RoomId::new("r1"),
            sender: UserId::new("u1"),
        };
        let payload = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["id"], "m1");
        assert_eq!(value["action"], "CREATE_ROOM");
        assert_eq!(value["content"], "random");
        assert_eq!(value["target"], "r1");
        assert_eq!(value["sender"], "u1");
    }

    #[test]
    fn test_message_list_serialize() {
        let list = MessageList::new(RoomId::new("r1"), Vec::new());
        let json = list.encode().unwrap();
        assert!(json.contains("\"action\":\"LIST_MESSAGES\""));
        assert!(json.contains("\"messages\":[]"));
    }
}
