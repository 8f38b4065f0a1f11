//! WebSocket control channel
//!
//! `GET /tunnel?token=<jwt>&version=1` authenticates the agent before the
//! upgrade, then bridges binary frames to a [`TunnelSession`]. Each binary
//! message carries one encoded [`RelayMessage`]. Text frames and undecodable
//! frames close the channel.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use expose_control::{Relay, TunnelSession};
use expose_proto::{decode, encode, RelayMessage, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::models::TunnelQuery;
use crate::AppState;

/// Buffered frames per direction
const CHANNEL_CAPACITY: usize = 256;

/// Authenticate and upgrade a control channel
pub async fn tunnel_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TunnelQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = match query.token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => {
            warn!("Control channel rejected: missing token");
            return ApiError::Unauthorized("Missing token".to_string()).into_response();
        }
    };

    let claims = match state.validator.validate(token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Control channel rejected: {}", e);
            return ApiError::Unauthorized(format!("Invalid or expired token: {}", e))
                .into_response();
        }
    };

    if let Some(version) = query.version {
        if version != PROTOCOL_VERSION {
            warn!(
                "Control channel rejected: protocol version {} (expected {})",
                version, PROTOCOL_VERSION
            );
            return ApiError::BadRequest(format!("Unsupported protocol version {}", version))
                .into_response();
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let relay = state.relay.clone();
    let principal = claims.sub;
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| run_control_channel(socket, relay, principal))
}

/// Bridge one upgraded socket to a tunnel session until either side goes away
pub async fn run_control_channel(socket: WebSocket, relay: Arc<Relay>, principal: String) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<RelayMessage>(CHANNEL_CAPACITY);

    let session = TunnelSession::new(relay, principal.clone(), outbound_tx);
    let session_id = session.session_id().to_string();
    info!("Agent {} connected (session {})", principal, session_id);

    let session_task = tokio::spawn(session.run(inbound_rx));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = match encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode {}: {}", message.event_name(), e);
                    continue;
                }
            };
            if sink.send(Message::Binary(frame.into())).await.is_err() {
                debug!("Control channel write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Binary(data)) => match decode(&data) {
                Ok(message) => {
                    debug!("Received {} on session {}", message.event_name(), session_id);
                    if inbound_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Malformed frame on session {}: {}", session_id, e);
                    break;
                }
            },
            Ok(Message::Text(_)) => {
                warn!("Unexpected text frame on session {}", session_id);
                break;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Control channel read error on session {}: {}", session_id, e);
                break;
            }
        }
    }

    drop(inbound_tx);
    if let Err(e) = session_task.await {
        error!("Session {} task failed: {}", session_id, e);
    }
    writer.abort();

    info!("Agent {} disconnected (session {})", principal, session_id);
}
