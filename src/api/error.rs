use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::CoreError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 403 - Browser request from an origin that is not allowed.
    OriginNotAllowed,
    /// 404 - Generic not-found.
    NotFound,
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 404 - A specific job id was not found in the session.
    JobNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - The command cannot be run.
    InvalidCommand(String),
    /// 409 - Operation not allowed in the session's current state.
    InvalidState(String),
    /// 503 - A session or subscriber ceiling has been reached.
    ResourceExhausted(String),
    /// 500 - Failed to create a session (PTY spawn error, etc.).
    SessionCreateFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidState(_) => StatusCode::CONFLICT,
            ApiError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SessionCreateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::NotFound => "not_found",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::JobNotFound(_) => "job_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidCommand(_) => "invalid_command",
            ApiError::InvalidState(_) => "invalid_state",
            ApiError::ResourceExhausted(_) => "resource_exhausted",
            ApiError::SessionCreateFailed(_) => "session_create_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header, or a ?ticket= from POST /auth/ws-ticket on WebSocket upgrades.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::OriginNotAllowed => "Request origin is not allowed.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::JobNotFound(id) => format!("Job not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidCommand(detail) => format!("Invalid command: {}.", detail),
            ApiError::InvalidState(detail) => format!("Invalid state: {}.", detail),
            ApiError::ResourceExhausted(detail) => format!("Resource exhausted: {}.", detail),
            ApiError::SessionCreateFailed(detail) => {
                format!("Failed to create session: {}.", detail)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { kind: "session", id } => ApiError::SessionNotFound(id),
            CoreError::NotFound { kind: "job", id } => ApiError::JobNotFound(id),
            CoreError::NotFound { .. } => ApiError::NotFound,
            CoreError::ResourceExhausted(detail) => ApiError::ResourceExhausted(detail),
            CoreError::SpawnFailed(e) => {
                tracing::error!(error = %e, "failed to spawn session shell");
                ApiError::SessionCreateFailed(e.to_string())
            }
            CoreError::BufferClosed => {
                ApiError::InternalError("append to closed output buffer".to_string())
            }
            CoreError::InvalidState(detail) => ApiError::InvalidState(detail),
            CoreError::InvalidCommand(detail) => ApiError::InvalidCommand(detail),
            CoreError::InvalidArgument(detail) => ApiError::InvalidRequest(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
