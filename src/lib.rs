//! Workspace Chat Fan-out Library
//!
//! Real-time core of a workspace chat backend built with tokio-tungstenite
//! using the Actor pattern for state management.
//!
//! # Features
//! - WebSocket sessions with ping/pong liveness and bounded outbound queues
//! - Rooms with join announcements and pub/sub backed fan-out
//! - One hub per workspace: session registry, room creation, announcements
//! - Cross-process fan-out through a pub/sub collaborator (memory or Redis)
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` owns the sessions, rooms and memberships of one workspace
//! - Each `Room` owns its member set and relays its pub/sub channel
//! - Each connection runs a read pump and a write pump
//! - No locks needed - all state access goes through message passing
//!
//! A broadcast is published to the room's channel and reaches members only
//! through the room's own subscription, so local and remote members share
//! one delivery path.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//! use workspace_chat::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let backends = Collaborators {
//!         pubsub: Arc::new(MemoryPubSub::new()),
//!         rooms: Arc::new(MemoryRoomStore::new()),
//!         messages: Arc::new(MemoryMessageStore::new()),
//!     };
//!     let ctx = Arc::new(ServerContext::new(
//!         backends,
//!         Arc::new(TokenTable::new()),
//!         Timeouts::default(),
//!         Duration::from_secs(300),
//!     ));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     serve(listener, ctx).await;
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod pubsub;
pub mod room;
pub mod server;
pub mod session;
pub mod store;
pub mod types;
pub mod workspace;

// Re-export main types for convenience
pub use auth::{Authenticator, TokenTable};
pub use config::{Config, Timeouts};
pub use error::{AppError, PubSubError, SendError, StoreError};
pub use handler::handle_connection;
pub use hub::{Collaborators, Hub, HubHandle, HubStats};
pub use message::{Action, MessageList, Payload, StoredMessage, WsMessage};
pub use pubsub::{MemoryPubSub, PubSub, Subscription};
#[cfg(feature = "redis")]
pub use pubsub::RedisPubSub;
pub use room::{Room, RoomHandle, RoomInfo, RoomState};
pub use server::{serve, ServerContext};
pub use session::{Session, SessionHandle};
pub use store::{MemoryMessageStore, MemoryRoomStore, MessageStore, RoomRecord, RoomStore};
pub use types::{Identity, RoomId, SessionId, UserId, WorkspaceId};
pub use workspace::Workspaces;
