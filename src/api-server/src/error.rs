use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gateguard_authz::error::AuthzError;
use serde_json::json;
use tracing::warn;

pub type Result<T> = std::result::Result<T, ApiError>;

/// HTTP-facing errors
///
/// Response bodies carry a stable code and a generic message; the underlying
/// detail is only logged.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authorization error: {0}")]
    AuthzError(#[from] AuthzError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::AuthzError(e) => match e {
                AuthzError::SessionNotFound => (
                    StatusCode::UNAUTHORIZED,
                    "unauthenticated",
                    "Session not found or expired".into(),
                ),
                AuthzError::InvalidToken(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_token", "Access token rejected".into())
                }
                AuthzError::PermissionsUnavailable { .. }
                | AuthzError::PolicySyncFailure(_)
                | AuthzError::CircuitOpen(_)
                | AuthzError::Timeout(_)
                | AuthzError::Overloaded(_)
                | AuthzError::Upstream(_)
                | AuthzError::CacheError(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "unavailable",
                    "A dependency is temporarily unavailable".into(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error".into(),
                ),
            },
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone()),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone())
            }
            ApiError::InternalError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "Internal server error".into(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            warn!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": code,
            "message": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
