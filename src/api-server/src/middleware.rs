//! Middleware layer for the API server
//!
//! - Authorization of every request outside the gateway's own endpoints
//! - Per-principal rate limiting ahead of the decision pipeline
//! - Internal API key check
//! - CORS configuration

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use gateguard_authz::resilience::{RateLimitDecision, RateLimitKey};
use gateguard_authz::session::fingerprint;
use gateguard_authz::{AllowBasis, AuthDecision, AuthRequest, AuthzError, Decision, DenyReason};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::state::AppState;
use crate::{
    AUTHZ_PERMISSION_HEADER, INTERNAL_KEY_HEADER, SESSION_COOKIE, SESSION_HEADER, USER_ID_HEADER,
};

/// Request ID header name
pub const X_REQUEST_ID: &str = "x-request-id";

/// Configure CORS middleware
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(X_REQUEST_ID),
            HeaderName::from_static(SESSION_HEADER),
        ])
        .expose_headers([HeaderName::from_static(X_REQUEST_ID)])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Paths served by the gateway itself and never run through the pipeline
///
/// Exact routes only; anything else under these prefixes is authorized like any
/// other request.
pub fn is_gateway_endpoint(path: &str) -> bool {
    const EXACT: [&str; 8] = [
        "/health",
        "/health/downstream",
        "/metrics",
        "/auth/session",
        "/auth/me",
        "/internal/policies/refresh",
        "/internal/authorize",
        "/api-docs/openapi.json",
    ];

    if EXACT.contains(&path) {
        return true;
    }

    // `/internal/permissions/:subject_id`
    path.strip_prefix("/internal/permissions/")
        .map(|subject| !subject.is_empty() && !subject.contains('/'))
        .unwrap_or(false)
}

/// Session id from the `SESSION_ID` cookie, else the `X-Session-Id` header
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Identity behind a request's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSubject {
    Anonymous,
    Subject(String),
    /// A session was presented but the store could not be read
    Unresolved,
}

/// Look up the request's session; store failures yield `Unresolved`
pub async fn resolve_subject(state: &AppState, headers: &HeaderMap) -> SessionSubject {
    let Some(id) = session_id(headers) else {
        return SessionSubject::Anonymous;
    };

    match state.runtime.sessions.get(&id).await {
        Ok(session) => SessionSubject::Subject(session.subject_id),
        Err(AuthzError::SessionNotFound) => {
            debug!(session = %fingerprint(&id), "Unknown session, treating request as anonymous");
            SessionSubject::Anonymous
        }
        Err(err) => {
            warn!(
                session = %fingerprint(&id),
                error = %err,
                "Session lookup failed, continuing with an unresolved identity"
            );
            SessionSubject::Unresolved
        }
    }
}

/// Anonymous caller address: first `X-Forwarded-For` hop when trusted, else the peer
pub fn client_addr(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.retry_after_secs()));
}

/// 429 with the window's limit headers and `Retry-After`
pub fn rate_limited_response(decision: &RateLimitDecision) -> Response {
    let body = Json(json!({
        "error": "rate_limited",
        "message": "Too many requests",
        "status": StatusCode::TOO_MANY_REQUESTS.as_u16(),
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    set_rate_limit_headers(response.headers_mut(), decision);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
    response
}

/// Authorization middleware
///
/// Resolves the subject from the session, counts the request against its rate
/// limit, runs the decision pipeline and either forwards the request (with
/// `X-User-Id` / `X-AuthZ-Perm` set) or answers with a structured
/// 400/401/403/429/503.
pub async fn authorize_request(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if is_gateway_endpoint(&path) {
        return next.run(request).await;
    }

    // never trust identity headers from the client
    request.headers_mut().remove(USER_ID_HEADER);
    request.headers_mut().remove(AUTHZ_PERMISSION_HEADER);

    let auth_request = AuthRequest::new(request.method().as_str(), path.as_str());
    let (auth_request, subject) = match resolve_subject(&state, request.headers()).await {
        SessionSubject::Anonymous => (auth_request, None),
        SessionSubject::Subject(subject) => (auth_request.with_subject(subject.as_str()), Some(subject)),
        SessionSubject::Unresolved => (auth_request.with_identity_unavailable(), None),
    };

    let limiter = &state.runtime.rate_limiter;
    let rate_limit = if limiter.is_enabled() {
        let key = match &subject {
            Some(subject) => RateLimitKey::Subject(subject.clone()),
            None => RateLimitKey::Client(client_addr(&request, state.server.trust_forwarded_for)),
        };
        let outcome = limiter.check(&key).await;
        if !outcome.allowed {
            info!(path = %path, tier = outcome.tier.as_str(), "Request rate limited");
            return rate_limited_response(&outcome);
        }
        Some(outcome)
    } else {
        None
    };

    let decision = state.runtime.pipeline.authorize(&auth_request).await;

    match &decision.decision {
        Decision::Allow { basis } => {
            let permission = match basis {
                AllowBasis::PermissionGranted => decision
                    .required_permission
                    .as_deref()
                    .and_then(|p| HeaderValue::from_str(p).ok()),
                _ => None,
            };

            if let Some(value) = subject.as_deref().and_then(|s| HeaderValue::from_str(s).ok()) {
                request.headers_mut().insert(USER_ID_HEADER, value);
            }
            if let Some(value) = &permission {
                request.headers_mut().insert(AUTHZ_PERMISSION_HEADER, value.clone());
            }
            request.extensions_mut().insert(decision.clone());

            let mut response = next.run(request).await;
            if let Some(value) = permission {
                response.headers_mut().insert(AUTHZ_PERMISSION_HEADER, value);
            }
            if let Some(outcome) = &rate_limit {
                set_rate_limit_headers(response.headers_mut(), outcome);
            }
            response
        }
        Decision::Deny { reason } => {
            info!(
                decision_id = %decision.id,
                path = %path,
                reason = reason.as_str(),
                "Request denied"
            );
            deny_response(reason, &decision)
        }
    }
}

/// Structured denial without internal detail
pub fn deny_response(reason: &DenyReason, decision: &AuthDecision) -> Response {
    let (status, error, message) = match reason {
        DenyReason::Unauthenticated => (
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "Authentication required",
        ),
        DenyReason::MissingPermission { .. } => {
            (StatusCode::FORBIDDEN, "forbidden", "Insufficient permissions")
        }
        DenyReason::NoRuleMatched => (StatusCode::FORBIDDEN, "forbidden", "Access denied"),
        DenyReason::MalformedPath => (StatusCode::BAD_REQUEST, "bad_request", "Malformed request path"),
        DenyReason::PermissionsUnavailable
        | DenyReason::PolicyUnavailable
        | DenyReason::IdentityUnavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            "Authorization is temporarily unavailable",
        ),
    };

    let body = Json(json!({
        "error": error,
        "message": message,
        "status": status.as_u16(),
        "decisionId": decision.id,
    }));

    (status, body).into_response()
}

/// Internal API key check for `/internal/*`
///
/// Open when no key is configured.
pub async fn require_internal_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.server.internal_api_key {
        let presented = request
            .headers()
            .get(INTERNAL_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        // blake3::Hash equality is constant time
        if blake3::hash(presented.as_bytes()) != blake3::hash(expected.as_bytes()) {
            warn!(path = %request.uri().path(), "Rejected internal request");
            return ApiError::Unauthorized("Invalid internal API key".into()).into_response();
        }
    }

    next.run(request).await
}
