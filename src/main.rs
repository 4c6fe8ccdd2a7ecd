//! Workspace chat server - Entry Point
//!
//! Parses configuration, builds the collaborators and starts accepting
//! WebSocket connections.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workspace_chat::{
    serve, Collaborators, Config, MemoryMessageStore, MemoryPubSub, MemoryRoomStore, PubSub,
    ServerContext, Timeouts, TokenTable,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=workspace_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("workspace_chat=info")),
        )
        .init();

    let config = Config::parse();

    let timeouts = Timeouts::default();
    if !timeouts.is_valid() {
        return Err("ping period must be shorter than the pong wait".into());
    }

    let credentials = config.credentials();
    if credentials.is_empty() {
        warn!("No bearer tokens configured, every connection will be rejected");
    }

    let backends = Collaborators {
        pubsub: init_pubsub(&config).await?,
        rooms: Arc::new(MemoryRoomStore::new()),
        messages: Arc::new(MemoryMessageStore::new()),
    };
    let ctx = Arc::new(ServerContext::new(
        backends,
        Arc::new(TokenTable::from_entries(credentials)),
        timeouts,
        config.room_idle_grace(),
    ));

    // Start TCP listener
    let listener = TcpListener::bind(config.bind).await?;
    info!("WebSocket chat server listening on {}", config.bind);

    serve(listener, ctx).await;
    Ok(())
}

#[cfg(feature = "redis")]
async fn init_pubsub(config: &Config) -> Result<Arc<dyn PubSub>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(workspace_chat::RedisPubSub::connect(url).await?)),
        None => {
            info!("Memory pub/sub initialized (single process only)");
            Ok(Arc::new(MemoryPubSub::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn init_pubsub(config: &Config) -> Result<Arc<dyn PubSub>, Box<dyn std::error::Error>> {
    if config.redis_url.is_some() {
        warn!("Redis URL ignored, built without the `redis` feature");
    }
    info!("Memory pub/sub initialized (single process only)");
    Ok(Arc::new(MemoryPubSub::new()))
}
