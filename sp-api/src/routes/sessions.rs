//! The §6 "Boundary exposed to external API layer" — `create_session`,
//! `get_session`, `list_sessions`, `set_desired_state`, `on_user_connect`,
//! `on_user_heartbeat`, `on_user_disconnect`. Authenticating the end user
//! making these calls is the caller's responsibility, not this crate's.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use sp_protocol::TemplateManifest;
use sp_sessions::DesiredStateRequest;
use sp_store::model::{Platform, Session};

use crate::error::ApiError;
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/desired-state", patch(set_desired_state))
        .route("/sessions/{id}/connections", post(connect))
        .route("/connections/{id}/heartbeat", post(heartbeat))
        .route("/connections/{id}", delete(disconnect))
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    id: String,
    user_id: String,
    template_id: String,
    platform: &'static str,
    desired_state: &'static str,
    observed_state: &'static str,
    assigned_agent_id: Option<String>,
    idle_timeout: String,
    max_duration: Option<String>,
    url: Option<String>,
    last_activity: chrono::DateTime<chrono::Utc>,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            template_id: s.template_id,
            platform: s.platform.as_str(),
            desired_state: s.desired_state.as_str(),
            observed_state: s.observed_state.as_str(),
            assigned_agent_id: s.assigned_agent_id,
            idle_timeout: s.idle_timeout,
            max_duration: s.max_duration,
            url: s.url,
            last_activity: s.last_activity,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    user_id: String,
    template_id: String,
    platform: String,
    manifest: TemplateManifest,
    idle_timeout: String,
    #[serde(default)]
    max_duration: Option<String>,
}

async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let platform = Platform::parse(&req.platform)
        .ok_or_else(|| ApiError(sp_common::AppError::validation(format!("unknown platform {}", req.platform))))?;

    let session = state.sessions.create_session(
        &req.user_id,
        &req.template_id,
        platform,
        &req.manifest,
        &req.idle_timeout,
        req.max_duration.as_deref(),
    )?;
    info!(session_id = %session.id, user_id = %req.user_id, "session created via API");
    Ok(Json(session.into()))
}

async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.sessions.get_session(&id)?;
    Ok(Json(session.into()))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    user_id: String,
}

async fn list_sessions(
    State(state): State<ApiState>,
    Query(q): Query<ListSessionsQuery>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    let sessions = state.sessions.list_sessions_for_user(&q.user_id)?;
    Ok(Json(sessions.into_iter().map(SessionResponse::from).collect()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DesiredStateBody {
    Running,
    Hibernated,
    Terminated,
}

#[derive(Debug, Deserialize)]
struct SetDesiredStateRequest {
    state: DesiredStateBody,
}

async fn set_desired_state(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<SetDesiredStateRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let desired = match req.state {
        DesiredStateBody::Running => DesiredStateRequest::Running,
        DesiredStateBody::Hibernated => DesiredStateRequest::Hibernated,
        DesiredStateBody::Terminated => DesiredStateRequest::Terminated,
    };
    let session = state.sessions.set_desired_state(&id, desired)?;
    Ok(Json(session.into()))
}

#[derive(Debug, Serialize)]
struct ConnectionResponse {
    connection_id: String,
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    user_id: String,
    client_fingerprint: String,
}

async fn connect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let connection = state.connections.on_connect(&session_id, &req.user_id, &req.client_fingerprint)?;
    Ok(Json(ConnectionResponse { connection_id: connection.id, session_id: connection.session_id }))
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(connection_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.connections.on_heartbeat(&connection_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn disconnect(
    State(state): State<ApiState>,
    Path(connection_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.connections.on_disconnect(&connection_id)?;
    Ok(StatusCode::NO_CONTENT)
}
