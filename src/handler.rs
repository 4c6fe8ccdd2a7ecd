//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake with
//! credential extraction, authentication, and handing the admitted
//! session to its workspace hub.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};

use crate::auth::bearer_token;
use crate::config::Timeouts;
use crate::error::AppError;
use crate::server::ServerContext;
use crate::session::Session;
use crate::types::WorkspaceId;

/// What the upgrade request tells us before authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub workspace_id: WorkspaceId,
    pub token: String,
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, authenticates the bearer credential
/// and runs the session until the connection ends.
pub async fn handle_connection(stream: TcpStream, ctx: Arc<ServerContext>) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut admission = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match parse_admission(request) {
            Some(parsed) => {
                admission = Some(parsed);
                Ok(response)
            }
            None => Err(reject(StatusCode::UNAUTHORIZED, "workspace path and bearer token required")),
        }
    };

    // WebSocket handshake
    let mut ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(&ctx.timeouts)),
    )
    .await?;

    let Some(admission) = admission else {
        return Err(AppError::Unauthorized);
    };

    let identity = match ctx.auth.authenticate(&admission.token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected credential from {}", peer_addr);
            let _ = ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unauthorized".into(),
                }))
                .await;
            return Err(e);
        }
    };

    let hub = ctx.workspaces.get_or_spawn(&admission.workspace_id).await?;
    debug!("Active workspaces: {}", ctx.workspaces.len().await);
    info!(
        user_id = %identity.user_id,
        workspace_id = %admission.workspace_id,
        "Client connected from {}", peer_addr
    );

    let session = Session::admit(identity, hub, ctx.messages.clone(), ctx.timeouts);
    session.run(ws_stream).await
}

/// Oversized frames fail in the protocol layer before they are buffered
pub fn websocket_config(timeouts: &Timeouts) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(timeouts.max_message_size),
        max_frame_size: Some(timeouts.max_message_size),
        ..Default::default()
    }
}

/// `/ws/{workspace_id}` plus `Authorization: Bearer` (or `?token=`)
pub fn parse_admission(request: &Request) -> Option<Admission> {
    let workspace = request
        .uri()
        .path()
        .strip_prefix("/ws/")?
        .trim_end_matches('/');
    if workspace.is_empty() || workspace.contains('/') {
        return None;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
        .or_else(|| query_token(request.uri().query()))?;

    Some(Admission {
        workspace_id: WorkspaceId::new(workspace),
        token,
    })
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
