use chrono::{DateTime, Utc};
use gateguard_authz::policy::PolicyStoreStatus;
use gateguard_authz::{AuthRequest, Session};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Tokens of a completed login
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Access token (JWT)
    #[validate(length(min = 1, max = 16384))]
    pub access_token: String,

    #[validate(length(min = 1, max = 16384))]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

/// Current user as seen through the session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub subject_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub access_token_expired: bool,
    pub refresh_token_expired: bool,
}

impl From<&Session> for MeResponse {
    fn from(session: &Session) -> Self {
        Self {
            subject_id: session.subject_id.clone(),
            username: session.username.clone(),
            email: session.email.clone(),
            access_token_expired: session.is_access_token_expired(),
            refresh_token_expired: session.is_refresh_token_expired(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    /// Whether a server-side session existed
    pub deleted: bool,
}

/// Liveness plus policy store state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub policy: PolicyStatusResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatusResponse {
    pub version: u64,
    pub rules: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub stale: bool,
}

impl From<PolicyStoreStatus> for PolicyStatusResponse {
    fn from(status: PolicyStoreStatus) -> Self {
        Self {
            version: status.version,
            rules: status.rules,
            last_success: status.last_success,
            consecutive_failures: status.consecutive_failures,
            stale: status.stale,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub updated: bool,
    pub version: u64,
    pub rules: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvictResponse {
    pub subject_id: String,
    pub evicted: bool,
}

/// Ad-hoc decision check
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    #[validate(length(min = 1, max = 16))]
    pub method: String,

    #[validate(length(min = 1, max = 2048), custom(function = "validate_path"))]
    pub path: String,

    #[validate(length(min = 1, max = 255))]
    pub subject_id: Option<String>,
}

impl From<AuthorizationRequest> for AuthRequest {
    fn from(req: AuthorizationRequest) -> Self {
        let request = AuthRequest::new(req.method, req.path);
        match req.subject_id {
            Some(subject) => request.with_subject(subject),
            None => request,
        }
    }
}

fn validate_path(path: &str) -> Result<(), validator::ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(validator::ValidationError::new("path_must_start_with_slash"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    pub allowed: bool,
    /// Allow basis or deny reason
    pub reason: String,
    pub matched_rule: Option<String>,
    pub required_permission: Option<String>,
    pub policy_version: u64,
    pub stale_permissions: bool,
    pub latency_us: u64,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}
