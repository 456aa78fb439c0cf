use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use sp_common::AppError;

/// Maps the §7 error taxonomy onto HTTP status the way the caller expects —
/// this is the only place that decision is made, so every route stays a
/// thin translation from request to domain call.
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

impl From<sp_sessions::TransitionError> for ApiError {
    fn from(e: sp_sessions::TransitionError) -> Self {
        Self(e.into())
    }
}

impl From<sp_connections::ConnectionError> for ApiError {
    fn from(e: sp_connections::ConnectionError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Auth => (StatusCode::UNAUTHORIZED, "authentication failed".to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Store(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Transport(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Agent(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}
