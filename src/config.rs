//! Configuration
//!
//! Wire/liveness constants consumed by sessions, rooms and hubs, plus the
//! process configuration parsed from the command line and environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::types::Identity;

/// Max wait time when writing a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Max wait time for the peer to answer with the next pong.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Send pings to the peer with this period. Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Max message size accepted from the peer, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 10_000;

/// Capacity of each session's outbound queue, in messages.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Capacity of room and hub command queues.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Pub/sub channel for workspace-wide announcements (suffixed with the workspace id).
pub const GENERAL_CHANNEL: &str = "general";

/// How long an empty room stays alive before it is reclaimed.
pub const ROOM_IDLE_GRACE: Duration = Duration::from_secs(300);

/// Announcement broadcast when a user joins a public room.
pub const WELCOME_TEMPLATE: &str = "{name} joined the room.";

/// Announcement broadcast when a user leaves a room on request.
pub const GOODBYE_TEMPLATE: &str = "{name} left the room.";

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Render an announcement template with the user's display name
pub fn render(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// Per-session liveness and framing limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub queue_capacity: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_message_size: MAX_MESSAGE_SIZE,
            queue_capacity: SEND_QUEUE_CAPACITY,
        }
    }
}

impl Timeouts {
    /// Pings must be sent more often than the read deadline, or every
    /// healthy peer would eventually time out.
    pub fn is_valid(&self) -> bool {
        self.ping_period < self.pong_wait && self.queue_capacity > 0 && self.max_message_size > 0
    }
}

/// Process configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "workspace_chat")]
#[command(about = "Workspace chat real-time fan-out server")]
#[command(version)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_BIND_ADDR", default_value = DEFAULT_ADDR)]
    pub bind: SocketAddr,

    /// Redis URL for cross-process pub/sub (requires the `redis` feature)
    #[arg(long, env = "CHAT_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Seconds an empty room is kept before it is reclaimed
    #[arg(long, env = "CHAT_ROOM_IDLE_SECS", default_value_t = ROOM_IDLE_GRACE.as_secs())]
    pub room_idle_secs: u64,

    /// Static bearer credentials, `token=user_id:name`
    #[arg(long = "token", env = "CHAT_TOKENS", value_delimiter = ',')]
    pub tokens: Vec<String>,
}

impl Config {
    pub fn room_idle_grace(&self) -> Duration {
        Duration::from_secs(self.room_idle_secs)
    }

    /// Parse `token=user_id:name` entries, skipping malformed ones
    pub fn credentials(&self) -> Vec<(String, Identity)> {
        self.tokens
            .iter()
            .filter_map(|entry| parse_credential(entry))
            .collect()
    }
}

fn parse_credential(entry: &str) -> Option<(String, Identity)> {
    let (token, rest) = entry.split_once('=')?;
    let (user_id, name) = rest.split_once(':').unwrap_or((rest, rest));
    if token.is_empty() || user_id.is_empty() {
        return None;
    }
    Some((token.to_string(), Identity::new(user_id, name)))
}
