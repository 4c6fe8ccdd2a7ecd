//! Server wiring
//!
//! Everything a connection needs after the TCP accept, bundled once per
//! process, plus the accept loop itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::auth::Authenticator;
use crate::config::Timeouts;
use crate::handler::handle_connection;
use crate::hub::Collaborators;
use crate::store::MessageStore;
use crate::workspace::Workspaces;

/// Process-wide state shared by connection handlers
pub struct ServerContext {
    pub workspaces: Workspaces,
    pub auth: Arc<dyn Authenticator>,
    pub messages: Arc<dyn MessageStore>,
    pub timeouts: Timeouts,
}

impl ServerContext {
    pub fn new(
        backends: Collaborators,
        auth: Arc<dyn Authenticator>,
        timeouts: Timeouts,
        room_idle_grace: Duration,
    ) -> Self {
        let messages = backends.messages.clone();
        Self {
            workspaces: Workspaces::new(backends, room_idle_grace),
            auth,
            messages,
            timeouts,
        }
    }
}

/// Accept connections forever, one admission task per connection
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let ctx = ctx.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        info!("Connection from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
