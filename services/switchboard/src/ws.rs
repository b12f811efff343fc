//! WebSocket endpoint: handshake validation, connection lifecycle, and the
//! per-connection read loop.
//!
//! Handshake parameters are validated before the upgrade is performed, in
//! order: missing params (400), malformed user id (400), unknown role (400),
//! then the session cache membership check (404 not found / 403 not
//! enrolled).  Only a fully validated request is upgraded.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use sb_protocol::{error_codes, is_valid_user_id, ChatMessage, Role, SystemFrame};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::session_cache::ValidateError;
use crate::socket::Socket;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline; refreshed by every inbound frame, pongs included.
const READ_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    user_id: Option<String>,
    role: Option<String>,
    session_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(user_id) = query.user_id.filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing user_id").into_response();
    };
    let Some(role_raw) = query.role.filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing role").into_response();
    };
    let Some(session_id) = query.session_id.filter(|v| !v.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    if !is_valid_user_id(&user_id) {
        return (StatusCode::BAD_REQUEST, "malformed user_id").into_response();
    }
    let Ok(role) = role_raw.parse::<Role>() else {
        return (StatusCode::BAD_REQUEST, "role must be student or instructor").into_response();
    };
    match state.cache.validate(&session_id, &user_id, role).await {
        Ok(()) => {}
        Err(ValidateError::SessionNotFound) => {
            return (StatusCode::NOT_FOUND, "session not found").into_response();
        }
        Err(ValidateError::Unauthorized) => {
            return (StatusCode::FORBIDDEN, "user is not enrolled in this session")
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id, role, session_id))
}

async fn handle_connection(
    ws: WebSocket,
    state: AppState,
    user_id: String,
    role: Role,
    session_id: String,
) {
    let (sink, mut stream) = ws.split();
    let (socket, egress) = Socket::new();
    let egress_task = tokio::spawn(egress.run(sink));
    socket.set_credentials(&user_id, role, &session_id).await;

    if let Err(e) = state.hub.submit_registration(socket.clone()) {
        warn!(user_id = %user_id, error = %e, "registration not accepted, dropping connection");
        socket.close();
        let _ = egress_task.await;
        return;
    }
    info!(user_id = %user_id, role = %role, session_id = %session_id, "connected");

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            inbound = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_text(&state, &socket, text.as_str()).await;
                    }
                    // Pings are answered by the transport; both directions
                    // count as liveness and refresh the deadline.
                    Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        info!(user_id = %user_id, "peer closed");
                        break;
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        debug!(user_id = %user_id, "ignoring binary frame");
                    }
                    Ok(Some(Err(e))) => {
                        warn!(user_id = %user_id, error = %e, "read error");
                        break;
                    }
                    Err(_) => {
                        warn!(user_id = %user_id, "read deadline expired");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if socket.send_frame(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    socket.close();
    if state.hub.submit_deregistration(socket.clone()).is_err() {
        // Hub full or stopped; unregister directly rather than leak the entry.
        state.index.unregister(&socket).await;
    }
    let _ = egress_task.await;
    info!(user_id = %user_id, "disconnected");
}

async fn handle_text(state: &AppState, socket: &Arc<Socket>, text: &str) {
    let message: ChatMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "unparseable message frame");
            let frame = SystemFrame::error(
                error_codes::INVALID_MESSAGE,
                "message could not be parsed",
            );
            let _ = socket.write_json(&frame).await;
            return;
        }
    };
    if state.hub.submit_message(socket.clone(), message).is_err() {
        let frame = SystemFrame::error(error_codes::SERVER_BUSY, "server is busy, retry shortly");
        let _ = socket.write_json(&frame).await;
    }
}
