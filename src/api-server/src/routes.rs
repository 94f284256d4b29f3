//! Route definitions for the API server
//!
//! - Health and metrics endpoints
//! - Session endpoints
//! - Internal maintenance endpoints (internal API key)
//! - OpenAPI document
//!
//! Every other path goes through [`middleware::authorize_request`] and, once
//! admitted, reaches the fallback.

use crate::{handlers, middleware, state::AppState};
use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// OpenAPI documentation configuration
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gateguard API",
        version = "1.0.0",
        description = "Edge authorization gateway: sessions, health and maintenance endpoints",
    ),
    paths(
        handlers::health_check,
        handlers::downstream_health,
        handlers::metrics,
        handlers::create_session,
        handlers::me,
        handlers::delete_session,
        handlers::refresh_policies,
        handlers::evict_permissions,
        handlers::check_authorization,
    ),
    components(
        schemas(
            crate::models::HealthResponse,
            crate::models::PolicyStatusResponse,
            crate::models::CreateSessionRequest,
            crate::models::CreateSessionResponse,
            crate::models::MeResponse,
            crate::models::LogoutResponse,
            crate::models::RefreshResponse,
            crate::models::EvictResponse,
            crate::models::AuthorizationRequest,
            crate::models::AuthorizationResponse,
            crate::models::ErrorResponse,
        )
    ),
    tags(
        (name = "health", description = "Health and monitoring endpoints"),
        (name = "sessions", description = "Server-side session endpoints"),
        (name = "internal", description = "Maintenance endpoints guarded by the internal API key"),
    )
)]
pub struct ApiDoc;

/// Create the application router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    let internal_routes = Router::new()
        .route("/policies/refresh", post(handlers::refresh_policies))
        .route("/permissions/:subject_id", delete(handlers::evict_permissions))
        .route("/authorize", post(handlers::check_authorization))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_internal_key,
        ));

    let request_timeout = Duration::from_secs(state.server.request_timeout);

    Router::new()
        // Health and metrics
        .route("/health", get(handlers::health_check))
        .route("/health/downstream", get(handlers::downstream_health))
        .route("/metrics", get(handlers::metrics))
        // Sessions
        .route(
            "/auth/session",
            post(handlers::create_session).delete(handlers::delete_session),
        )
        .route("/auth/me", get(handlers::me))
        // Maintenance
        .nest("/internal", internal_routes)
        // OpenAPI documentation
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .fallback(handlers::not_found)
        // Authorization runs for every request, matched or not
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::authorize_request,
        ))
        .with_state(state)
        // Add middleware layers (executed bottom to top)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
