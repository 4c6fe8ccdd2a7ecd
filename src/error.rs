//! Error types for the chat backend
//!
//! Defines application-level errors, outbound queue errors and the
//! collaborator errors (pub/sub, stores). Uses thiserror for ergonomic
//! error definitions.

use thiserror::Error;

use crate::types::RoomId;

/// Application-level errors
///
/// Connection-fatal variants terminate the session; the rest are logged
/// by the loop that hit them and never reach the client.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Inbound frame exceeds the configured maximum (fatal)
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// No pong within the read deadline (fatal)
    #[error("Read deadline expired")]
    ReadTimeout,

    /// A single wire write exceeded the write deadline (fatal)
    #[error("Write deadline expired")]
    WriteTimeout,

    /// Bearer credential missing or rejected
    #[error("Unauthorized")]
    Unauthorized,

    /// Backing store refused to create the room
    #[error("Room not created: {0}")]
    RoomNotCreated(String),

    /// A room with this name already exists in the hub
    #[error("Room already exists: {0}")]
    RoomExists(String),

    /// Room id unknown to this hub and its store
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    /// Pub/sub transport failure
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    /// Persistence collaborator failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbound queue errors
///
/// Occurs when delivering a payload to a session's bounded outbound queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The queue is saturated (slow consumer)
    #[error("Queue full")]
    QueueFull,
}

/// Pub/sub collaborator errors
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Subscriber fell behind and missed payloads
    #[error("Subscriber lagged, {0} payloads skipped")]
    Lagged(u64),

    /// Subscription or publisher is closed
    #[error("Pub/sub closed")]
    Closed,

    /// Backend-specific failure
    #[error("Pub/sub backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PubSubError {
    fn from(err: redis::RedisError) -> Self {
        PubSubError::Backend(err.to_string())
    }
}

/// Persistence collaborator errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    /// Caller is not the author of the record
    #[error("Permission denied")]
    Forbidden,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
