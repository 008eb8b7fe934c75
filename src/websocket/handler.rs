use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::connection_manager::{Connection, HandshakeContext, RoomOptions};
use crate::error::{CloseReason, EngineError};
use crate::message::Message;
use crate::server::AppState;

use super::message::{ClientFrame, ServerFrame};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    // Extract token from query parameter or Authorization header
    let token = extract_token(&query, &headers);

    let token = match token {
        Some(t) => t,
        None => {
            return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
        }
    };

    // Validate JWT token; the engine trusts the resulting identity
    let claims = match state.jwt_validator.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "JWT validation failed");
            return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
    };

    let mut ctx = HandshakeContext::new(Some(claims.sub.clone()), addr.ip());
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_header("Origin", origin);
    }
    if let Some(agent) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        ctx = ctx.with_header("User-Agent", agent);
    }

    tracing::info!(identity = %claims.sub, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, ctx))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    // First try query parameter
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    // Then try Authorization header
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    None
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, ctx),
    fields(identity = ctx.identity.as_deref().unwrap_or("-"))
)]
async fn handle_socket(socket: WebSocket, state: AppState, ctx: HandshakeContext) {
    let handshake_headers = ctx.protocol_headers.clone();

    // Admission: ceilings, registration, liveness monitor, middleware
    let admission = match state.engine.admit(ctx).await {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "Connection rejected");
            let (mut ws_sender, _) = socket.split();
            let error_frame = ServerFrame::error(e.code(), e.to_string());
            if let Ok(json) = error_frame.to_json() {
                let _ = ws_sender.send(WsMessage::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let connection = admission.connection;
    let mut outbound = admission.outbound;
    let connection_id = connection.id;
    let connection_start = std::time::Instant::now();

    // Record the handshake headers as connection attributes
    for (name, value) in handshake_headers {
        connection.metadata.insert(
            format!("header.{}", name.to_lowercase()),
            serde_json::Value::String(value),
        );
    }

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Drain task: queued frames out to the peer, in enqueue order
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let is_close = matches!(frame, ServerFrame::Close { .. });

            let text = match frame.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize frame");
                    continue;
                }
            };

            if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }

            // The closure notice is the last frame the peer sees
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    // Read task: socket frames into the engine
    let state_clone = state.clone();
    let connection_clone = connection.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_frame(msg, &state_clone, &connection_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    state_clone
                        .engine
                        .remove(connection_clone.id, CloseReason::TransportError)
                        .await;
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Drain task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Read task completed");
        }
    }

    // Idempotent: a no-op when a hard failure already removed it
    state.engine.remove(connection_id, CloseReason::Normal).await;

    tracing::info!(
        connection_id = %connection_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_frame(msg: WsMessage, state: &AppState, connection: &Arc<Connection>) -> bool {
    match msg {
        WsMessage::Text(text) => {
            // Size ceiling first, before any parsing
            let max_bytes = state.engine.config().max_message_bytes;
            if text.len() > max_bytes {
                soft_error(
                    state,
                    connection,
                    EngineError::ValidationFailed(format!(
                        "frame size {} exceeds limit {}",
                        text.len(),
                        max_bytes
                    )),
                )
                .await;
                return true;
            }

            connection.touch();

            let frame: ClientFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    soft_error(
                        state,
                        connection,
                        EngineError::ValidationFailed(format!("malformed frame: {}", e)),
                    )
                    .await;
                    return true;
                }
            };

            handle_client_frame(frame, state, connection).await
        }
        WsMessage::Binary(_) => {
            soft_error(
                state,
                connection,
                EngineError::ValidationFailed("binary frames are not supported".to_string()),
            )
            .await;
            true
        }
        WsMessage::Ping(_) => {
            // Axum answers transport pings automatically
            connection.touch();
            true
        }
        WsMessage::Pong(_) => {
            connection.record_heartbeat_ack();
            true
        }
        WsMessage::Close(_) => {
            tracing::debug!(connection_id = %connection.id, "Received close frame");
            false
        }
    }
}

/// Handle a parsed client frame
#[tracing::instrument(
    name = "ws.frame",
    skip(state, connection),
    fields(connection_id = %connection.id, frame = ?frame)
)]
async fn handle_client_frame(
    frame: ClientFrame,
    state: &AppState,
    connection: &Arc<Connection>,
) -> bool {
    // Liveness acks bypass the rate limiter; rejecting them would let a
    // busy window starve heartbeat detection
    if !matches!(frame, ClientFrame::Pong) {
        let decision = connection.check_rate();
        if !decision.is_allowed() {
            soft_error(
                state,
                connection,
                EngineError::RateLimitExceeded {
                    retry_after_secs: decision.retry_after_secs(),
                },
            )
            .await;
            return true;
        }
    }

    match frame {
        ClientFrame::Join {
            room,
            capacity,
            private,
        } => {
            let options = RoomOptions { capacity, private };
            match state.engine.join_room(connection.id, &room, options) {
                Ok(()) => {
                    let _ = connection.enqueue(ServerFrame::Joined { room });
                }
                Err(e) => soft_error(state, connection, e).await,
            }
            true
        }
        ClientFrame::Leave { room } => {
            match state.engine.leave_room(connection.id, &room) {
                Ok(()) => {
                    let _ = connection.enqueue(ServerFrame::Left { room });
                }
                Err(e) => soft_error(state, connection, e).await,
            }
            true
        }
        ClientFrame::Publish {
            room,
            kind,
            payload,
            correlation_id,
        } => {
            handle_publish(room, kind, payload, correlation_id, state, connection).await;
            true
        }
        ClientFrame::Ping => {
            let _ = connection.enqueue(ServerFrame::Pong);
            true
        }
        ClientFrame::Pong => {
            connection.record_heartbeat_ack();
            true
        }
    }
}

/// Validate, run middleware, and fan a published message out to the room.
async fn handle_publish(
    room: String,
    kind: String,
    payload: serde_json::Value,
    correlation_id: Option<uuid::Uuid>,
    state: &AppState,
    connection: &Arc<Connection>,
) {
    let mut message = Message::new(kind, payload, connection.id).with_room(&room);
    if let Some(correlation_id) = correlation_id {
        message = message.with_correlation(correlation_id);
    }

    if let Err(e) = message.validate(state.engine.config().max_message_bytes) {
        soft_error(state, connection, e).await;
        return;
    }

    if let Err(e) = state.engine.accept_message(connection, &message).await {
        soft_error(state, connection, e).await;
        return;
    }

    match state.engine.broadcast(&room, message, Some(connection.id)).await {
        Ok(result) => {
            tracing::debug!(
                connection_id = %connection.id,
                room = %result.room,
                delivered = result.delivered,
                failed = result.failures.len(),
                "Publish fanned out"
            );
        }
        Err(e) => soft_error(state, connection, e).await,
    }
}

/// Report a soft failure to the middleware chain and the peer.
///
/// Invalid input never ends the session by itself; the peer gets a
/// structured error frame and the connection stays open.
async fn soft_error(state: &AppState, connection: &Arc<Connection>, error: EngineError) {
    tracing::debug!(
        connection_id = %connection.id,
        kind = error.kind(),
        error = %error,
        "Soft failure"
    );

    state.engine.report_error(Some(connection), &error).await;

    let _ = connection.enqueue(ServerFrame::error(error.code(), error.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_prefers_query() {
        let query = WsQuery {
            token: Some("query-token".to_string()),
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer header-token".parse().unwrap());

        assert_eq!(extract_token(&query, &headers).as_deref(), Some("query-token"));
    }

    #[test]
    fn test_extract_token_from_bearer_header() {
        let query = WsQuery { token: None };
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer header-token".parse().unwrap());

        assert_eq!(
            extract_token(&query, &headers).as_deref(),
            Some("header-token")
        );
    }

    #[test]
    fn test_extract_token_missing() {
        let query = WsQuery { token: None };
        let headers = HeaderMap::new();
        assert!(extract_token(&query, &headers).is_none());
    }
}
