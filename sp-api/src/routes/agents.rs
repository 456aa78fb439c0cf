//! Agent registration (REST) and the Gateway WebSocket (§4.2, §4.7). The
//! handshake and message loop mirror the existing agent-WS pattern closely:
//! an initial blocking recv for the auth frame, then a bidirectional
//! `tokio::select!` once authenticated.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use sp_protocol::{close_codes, AgentMessage, Capacity};
use sp_store::model::Platform;

use crate::error::ApiError;
use crate::state::ApiState;

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/agents", post(register_agent))
        .route("/agents/{agent_id}/rotate-key", post(rotate_agent_key))
        .route("/agents/ws", get(agent_ws))
}

#[derive(Debug, Serialize)]
struct RegisteredAgentResponse {
    agent_id: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    agent_id: String,
    platform: String,
    #[serde(default)]
    region: Option<String>,
    capacity: Capacity,
}

async fn register_agent(
    State(state): State<ApiState>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<Json<RegisteredAgentResponse>, ApiError> {
    let platform = Platform::parse(&req.platform)
        .ok_or_else(|| ApiError(sp_common::AppError::validation(format!("unknown platform {}", req.platform))))?;
    let registered = state
        .registry
        .register_agent(&req.agent_id, platform, req.region.as_deref(), req.capacity)
        .map_err(ApiError)?;
    Ok(Json(RegisteredAgentResponse { agent_id: registered.agent.agent_id, api_key: registered.api_key }))
}

async fn rotate_agent_key(
    State(state): State<ApiState>,
    Path(agent_id): Path<String>,
) -> Result<Json<RegisteredAgentResponse>, ApiError> {
    let rotated = state.registry.rotate_agent_key(&agent_id).map_err(ApiError)?;
    Ok(Json(RegisteredAgentResponse { agent_id: rotated.agent.agent_id, api_key: rotated.api_key }))
}

async fn agent_ws(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_ws(state, socket))
}

async fn handle_agent_ws(state: ApiState, mut socket: WebSocket) {
    let auth_msg = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await;
    let (agent_id, api_key) = match auth_msg {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AgentMessage>(&text) {
            Ok(AgentMessage::Register { agent_id, api_key, .. }) => (agent_id, api_key),
            _ => {
                warn!("agent WS: expected register frame, got something else");
                close_with(&mut socket, close_codes::PROTOCOL_ERROR, "expected register frame").await;
                return;
            }
        },
        _ => {
            warn!("agent WS: auth timeout or connection error");
            close_with(&mut socket, close_codes::PROTOCOL_ERROR, "auth timeout").await;
            return;
        }
    };

    if state.registry.authenticate(&agent_id, &api_key).is_err() {
        warn!(agent_id, "agent WS: authentication failed");
        close_with(&mut socket, close_codes::AUTH_FAILED, "authentication failed").await;
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel(32);
    let outcome = match state.registry.on_agent_connected(&agent_id, tx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(agent_id, "agent WS: connect failed: {e}");
            close_with(&mut socket, close_codes::PROTOCOL_ERROR, "connect failed").await;
            return;
        }
    };
    info!(agent_id, websocket_id = %outcome.websocket_id, "agent connected");

    let known_sessions = state
        .store
        .list_non_terminal_sessions_for_agent(&agent_id)
        .map(|sessions| sessions.into_iter().map(|s| s.id).collect::<Vec<_>>())
        .unwrap_or_default();
    let registered = json!({
        "type": "registered",
        "timestamp": state.clock.now(),
        "payload": {"known_session_ids": known_sessions},
    });
    if socket.send(Message::Text(registered.to_string().into())).await.is_err() {
        let _ = state.registry.on_agent_disconnected(&agent_id, &outcome.websocket_id).await;
        return;
    }

    // Reconnect replay (§4.4): resend everything still in flight for this
    // agent now that it has a live connection again.
    if let Err(e) = state.dispatcher.replay_in_flight(&agent_id).await {
        warn!(agent_id, "reconnect replay failed: {e}");
    }

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(message) => {
                        let Ok(json) = serde_json::to_string(&message) else { continue };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // The channel was dropped because a newer connection for
                    // this agent_id replaced ours in the registry.
                    None => {
                        close_with(&mut socket, close_codes::SUPERSEDED, "superseded").await;
                        return;
                    }
                }
            }
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound_frame(&state, &agent_id, &text).await {
                            close_with(&mut socket, close_codes::PROTOCOL_ERROR, "malformed frame").await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(agent_id, "agent WS read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = state.registry.on_agent_disconnected(&agent_id, &outcome.websocket_id).await;
    info!(agent_id, "agent WS closed");
}

const KNOWN_INBOUND_TYPES: &[&str] =
    &["register", "heartbeat", "command_ack", "command_result", "session_status"];

/// Dispatches one inbound text frame. Returns `false` when the connection
/// must be closed with `PROTOCOL_ERROR` (unparseable JSON, or JSON that
/// names a known `type` but doesn't match its shape) — a `type` the Gateway
/// simply doesn't recognise is logged and ignored instead, per §4.2.
async fn handle_inbound_frame(state: &ApiState, agent_id: &str, text: &str) -> bool {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(agent_id, "malformed agent frame (invalid JSON): {e}");
            return false;
        }
    };

    let frame_type = value.get("type").and_then(|t| t.as_str());
    match frame_type {
        Some(t) if KNOWN_INBOUND_TYPES.contains(&t) => {}
        Some(other) => {
            warn!(agent_id, frame_type = other, "unknown agent frame type, ignoring");
            return true;
        }
        None => {
            warn!(agent_id, "malformed agent frame (missing type)");
            return false;
        }
    }

    match serde_json::from_value::<AgentMessage>(value) {
        Ok(AgentMessage::Heartbeat { .. }) => {
            if let Err(e) = state.registry.record_heartbeat(agent_id) {
                warn!(agent_id, "record_heartbeat failed: {e}");
            }
        }
        Ok(AgentMessage::CommandAck { command_id }) => {
            if let Err(e) = state.dispatcher.handle_ack(&command_id) {
                warn!(agent_id, command_id, "handle_ack failed: {e}");
            }
        }
        Ok(AgentMessage::CommandResult { command_id, success, error, .. }) => {
            if let Err(e) = state.dispatcher.handle_result(&command_id, success, error.as_deref()) {
                warn!(agent_id, command_id, "handle_result failed: {e}");
            }
        }
        Ok(AgentMessage::SessionStatus { session_id, state: reported, .. }) => {
            match state.sessions.apply_agent_observed_state(&session_id, reported) {
                Ok(_) => {}
                Err(e) => warn!(agent_id, session_id, "apply_agent_observed_state failed: {e}"),
            }
        }
        Ok(AgentMessage::Register { .. }) => {
            // Duplicate register on an already-authenticated connection; ignore.
        }
        Err(e) => {
            warn!(agent_id, "frame claims a known type but doesn't match its shape: {e}");
            return false;
        }
    }
    true
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}
