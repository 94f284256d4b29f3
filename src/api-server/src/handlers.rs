use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use gateguard_authz::{AuthRequest, SyncOutcome};
use std::sync::Arc;
use tracing::{debug, info};
use validator::Validate;

use crate::{
    error::{ApiError, Result},
    middleware::session_id,
    models::*,
    routes::ApiDoc,
    state::AppState,
    SESSION_COOKIE,
};

/// Liveness and policy store status
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let policy = state.runtime.policies.status();
    let status = if policy.version > 0 { "UP" } else { "STARTING" };

    Json(HealthResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime_seconds: state.uptime_seconds(),
        policy: policy.into(),
    })
}

/// Aggregated downstream health
#[utoipa::path(
    get,
    path = "/health/downstream",
    responses(
        (status = 200, description = "Every downstream is up"),
        (status = 503, description = "At least one downstream is down")
    ),
    tag = "health"
)]
pub async fn downstream_health(State(state): State<Arc<AppState>>) -> Response {
    let health = state.runtime.health.check_all().await;
    let status = if health.is_up() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

/// Prometheus metrics
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus text exposition", body = String, content_type = "text/plain")
    ),
    tag = "health"
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response> {
    let body = state.runtime.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// Create a server-side session
#[utoipa::path(
    post,
    path = "/auth/session",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created, SESSION_ID cookie set", body = CreateSessionResponse),
        (status = 400, description = "Invalid request or token", body = ErrorResponse),
        (status = 503, description = "Session store unavailable", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(CookieJar, Json<CreateSessionResponse>)> {
    req.validate()
        .map_err(|e| ApiError::ValidationError(e.to_string()))?;

    let sessions = &state.runtime.sessions;
    let session_id = sessions
        .create(&req.access_token, req.refresh_token.as_deref())
        .await?;

    let max_age = time::Duration::seconds(sessions.ttl().as_secs() as i64);
    let cookie = Cookie::build((SESSION_COOKIE, session_id.clone()))
        .http_only(true)
        .secure(state.server.cookie_secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(max_age);

    Ok((jar.add(cookie), Json(CreateSessionResponse { session_id })))
}

/// Current user
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Session user", body = MeResponse),
        (status = 401, description = "No or unknown session", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<MeResponse>> {
    let id = session_id(&headers).ok_or_else(|| ApiError::Unauthorized("No session".into()))?;
    let session = state.runtime.sessions.get(&id).await?;
    Ok(Json(MeResponse::from(&session)))
}

/// Log out: delete the session and clear the cookie
#[utoipa::path(
    delete,
    path = "/auth/session",
    responses(
        (status = 200, description = "Session removed", body = LogoutResponse)
    ),
    tag = "sessions"
)]
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<LogoutResponse>)> {
    let deleted = match session_id(&headers) {
        Some(id) => state.runtime.sessions.delete(&id).await?,
        None => false,
    };

    let jar = jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/"));
    Ok((jar, Json(LogoutResponse { deleted })))
}

/// Trigger a policy refresh now
#[utoipa::path(
    post,
    path = "/internal/policies/refresh",
    responses(
        (status = 200, description = "Refresh outcome", body = RefreshResponse),
        (status = 401, description = "Missing or invalid internal API key", body = ErrorResponse)
    ),
    tag = "internal"
)]
pub async fn refresh_policies(State(state): State<Arc<AppState>>) -> Json<RefreshResponse> {
    let outcome = state.runtime.policies.refresh().await;
    info!(?outcome, "Policy refresh requested");

    Json(match outcome {
        SyncOutcome::Updated { version, rules } => RefreshResponse {
            updated: true,
            version,
            rules: Some(rules),
            error: None,
        },
        SyncOutcome::Failed {
            error,
            retained_version,
        } => RefreshResponse {
            updated: false,
            version: retained_version,
            rules: None,
            error: Some(error),
        },
    })
}

/// Drop a subject's cached permissions
#[utoipa::path(
    delete,
    path = "/internal/permissions/{subject_id}",
    params(
        ("subject_id" = String, Path, description = "Subject whose permissions are evicted")
    ),
    responses(
        (status = 200, description = "Evicted", body = EvictResponse),
        (status = 503, description = "Distributed tier unavailable", body = ErrorResponse)
    ),
    tag = "internal"
)]
pub async fn evict_permissions(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<EvictResponse>> {
    if subject_id.trim().is_empty() {
        return Err(ApiError::BadRequest("subject id is required".into()));
    }

    state.runtime.resolver.evict(&subject_id).await?;
    Ok(Json(EvictResponse {
        subject_id,
        evicted: true,
    }))
}

/// Evaluate a decision without forwarding anything
#[utoipa::path(
    post,
    path = "/internal/authorize",
    request_body = AuthorizationRequest,
    responses(
        (status = 200, description = "Authorization decision", body = AuthorizationResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "internal"
)]
pub async fn check_authorization(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthorizationRequest>,
) -> Result<Json<AuthorizationResponse>> {
    req.validate()
        .map_err(|e| ApiError::ValidationError(e.to_string()))?;

    let request: AuthRequest = req.into();
    let decision = state.runtime.pipeline.authorize(&request).await;

    Ok(Json(AuthorizationResponse {
        allowed: decision.is_allowed(),
        reason: decision.decision.label().to_string(),
        matched_rule: decision.matched_rule.clone(),
        required_permission: decision.required_permission.clone(),
        policy_version: decision.policy_version,
        stale_permissions: decision.stale_permissions,
        latency_us: decision.latency_us,
    }))
}

/// OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    use utoipa::OpenApi;
    Json(ApiDoc::openapi())
}

/// Anything authorized that the gateway itself does not serve
pub async fn not_found(uri: axum::http::Uri) -> ApiError {
    debug!(path = %uri.path(), "No route");
    ApiError::NotFound("No such route".into())
}
