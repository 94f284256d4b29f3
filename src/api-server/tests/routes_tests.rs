//! Router-level tests driven through `tower::ServiceExt::oneshot`

use api_server::{routes::create_router, AppState, ServerConfig};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use gateguard_authz::cache::{DistributedCache, InMemoryDistributedCache};
use gateguard_authz::error::{AuthzError, Result};
use gateguard_authz::health::HealthProbe;
use gateguard_authz::{EndpointProtection, GatewayConfig, GatewayRuntime, IdentityClient};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const JWT_SECRET: &str = "router-test-secret";
const INTERNAL_KEY: &str = "internal-key";

struct StaticIdentity {
    rules: Vec<EndpointProtection>,
    permissions: HashMap<String, Vec<String>>,
}

#[async_trait]
impl IdentityClient for StaticIdentity {
    async fn list_policies(&self) -> Result<Vec<EndpointProtection>> {
        Ok(self.rules.clone())
    }

    async fn permission_codes(&self, subject: &str) -> Result<Vec<String>> {
        Ok(self.permissions.get(subject).cloned().unwrap_or_default())
    }

    async fn role_names(&self, _subject: &str) -> Result<Vec<String>> {
        Ok(vec!["USER".to_string()])
    }
}

struct AlwaysUp;

#[async_trait]
impl HealthProbe for AlwaysUp {
    async fn probe(&self, _url: &str) -> Result<Value> {
        Ok(json!({ "status": "UP" }))
    }
}

/// Shared tier that is down for every operation
struct FailingCache;

#[async_trait]
impl DistributedCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(AuthzError::CacheError("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Err(AuthzError::CacheError("connection refused".into()))
    }

    async fn replace(&self, _key: &str, _value: &str) -> Result<bool> {
        Err(AuthzError::CacheError("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(AuthzError::CacheError("connection refused".into()))
    }

    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64> {
        Err(AuthzError::CacheError("connection refused".into()))
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

fn identity() -> StaticIdentity {
    StaticIdentity {
        rules: vec![
            EndpointProtection::protected("/api/orders/**", "GET", "order:read")
                .with_id("orders-read"),
            EndpointProtection::public("/auth/**", "*").with_id("auth-public"),
            EndpointProtection::authenticated("/api/profile", "GET").with_id("profile"),
        ],
        permissions: HashMap::from([
            ("reader".to_string(), vec!["order:read".to_string()]),
            ("nobody".to_string(), vec![]),
        ]),
    }
}

fn gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.session.jwt_secret = Some(JWT_SECRET.to_string());
    config
}

async fn build_app(
    config: GatewayConfig,
    cache: Arc<dyn DistributedCache>,
    server: ServerConfig,
) -> Router {
    let runtime = GatewayRuntime::new(config, Arc::new(identity()), cache, Arc::new(AlwaysUp)).unwrap();
    assert!(runtime.policies.refresh().await.is_updated());

    create_router(Arc::new(AppState::new(Arc::new(runtime), server)))
}

async fn app(internal_key: Option<&str>) -> Router {
    let server = ServerConfig {
        internal_api_key: internal_key.map(str::to_string),
        cookie_secure: false,
        ..Default::default()
    };

    build_app(gateway_config(), Arc::new(InMemoryDistributedCache::new()), server).await
}

fn token(subject: &str) -> String {
    let claims = json!({
        "sub": subject,
        "exp": chrono::Utc::now().timestamp() + 3600,
        "preferred_username": subject,
        "email": format!("{}@example.com", subject),
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn login(app: &Router, subject: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "accessToken": token(subject) }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("SESSION_ID="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));

    let body = body_json(response).await;
    body["sessionId"].as_str().unwrap().to_string()
}

fn get(uri: &str, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(id) = session {
        builder = builder.header(header::COOKIE, format!("SESSION_ID={}", id));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_policy_snapshot() {
    let app = app(None).await;
    let response = app.oneshot(get("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["policy"]["version"], 1);
    assert_eq!(body["policy"]["rules"], 3);
}

#[tokio::test]
async fn test_downstream_health_without_targets_is_up() {
    let app = app(None).await;
    let response = app.oneshot(get("/health/downstream", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_and_openapi() {
    let app = app(None).await;

    let response = app.clone().oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gateguard_policy_rules 3"));

    let response = app.oneshot(get("/api-docs/openapi.json", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert!(doc["paths"]["/auth/session"].is_object());
    assert!(doc["paths"]["/internal/authorize"].is_object());
}

#[tokio::test]
async fn test_session_lifecycle() {
    let app = app(None).await;

    let response = app.clone().oneshot(get("/auth/me", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let session = login(&app, "reader").await;
    let response = app.clone().oneshot(get("/auth/me", Some(&session))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let me = body_json(response).await;
    assert_eq!(me["subjectId"], "reader");
    assert_eq!(me["email"], "reader@example.com");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/auth/session")
                .header(header::COOKIE, format!("SESSION_ID={}", session))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["deleted"], true);

    let response = app.oneshot(get("/auth/me", Some(&session))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_session_rejects_bad_token() {
    let app = app(None).await;
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/session")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "accessToken": "not-a-jwt" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_protected_path_decisions() {
    let app = app(None).await;

    let response = app.clone().oneshot(get("/api/orders/42", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "unauthenticated");
    assert!(body["decisionId"].is_string());

    let nobody = login(&app, "nobody").await;
    let response = app
        .clone()
        .oneshot(get("/api/orders/42", Some(&nobody)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // allowed, but the gateway serves nothing at this path
    let reader = login(&app, "reader").await;
    let response = app
        .clone()
        .oneshot(get("/api/orders/42", Some(&reader)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers().get("x-authz-perm").unwrap(), "order:read");

    let response = app.oneshot(get("/api/unknown", Some(&reader))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_public_and_authenticated_rules() {
    let app = app(None).await;

    let response = app.clone().oneshot(get("/auth/login", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get("x-authz-perm").is_none());

    let response = app.clone().oneshot(get("/api/profile", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let session = login(&app, "nobody").await;
    let response = app.oneshot(get("/api/profile", Some(&session))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_session_is_anonymous() {
    let app = app(None).await;
    let response = app
        .oneshot(get("/api/orders/1", Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_internal_endpoints_require_key() {
    let app = app(Some(INTERNAL_KEY)).await;

    let refresh = |key: Option<&str>| {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/internal/policies/refresh");
        if let Some(key) = key {
            builder = builder.header("x-internal-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    };

    let response = app.clone().oneshot(refresh(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.clone().oneshot(refresh(Some("wrong"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(refresh(Some(INTERNAL_KEY))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["updated"], true);
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn test_evict_and_check_authorization() {
    let app = app(None).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/internal/permissions/reader")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["subjectId"], "reader");
    assert_eq!(body["evicted"], true);

    let check = |subject: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/internal/authorize")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "method": "GET", "path": "/api/orders/7", "subjectId": subject })
                    .to_string(),
            ))
            .unwrap()
    };

    let response = app.clone().oneshot(check("reader")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["requiredPermission"], "order:read");
    assert_eq!(body["matchedRule"], "/api/orders/**");

    let response = app.oneshot(check("nobody")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["allowed"], false);
}

// ============================================================================
// DEGRADED SESSION STORE
// ============================================================================

#[tokio::test]
async fn test_session_store_outage_only_affects_rules_needing_a_subject() {
    let server = ServerConfig {
        cookie_secure: false,
        ..Default::default()
    };
    let app = build_app(gateway_config(), Arc::new(FailingCache), server).await;
    let session = "a".repeat(43);

    // public rule: admitted, then answered by the fallback
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/auth/login")
                .header(header::COOKIE, format!("SESSION_ID={}", session))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    for uri in ["/api/profile", "/api/orders/1"] {
        let response = app.clone().oneshot(get(uri, Some(&session))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        let body = body_json(response).await;
        assert_eq!(body["error"], "unavailable");
    }

    // no session presented: plain anonymous denial
    let response = app.clone().oneshot(get("/api/profile", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dot_segments_cannot_reach_protected_routes() {
    let app = app(None).await;

    let response = app
        .clone()
        .oneshot(get("/auth/../api/orders/123", None))
        .await
        .unwrap();
    assert_eq!(
        response.status(),
        StatusCode::UNAUTHORIZED,
        "Resolved path falls under the protected orders rule"
    );

    let response = app
        .clone()
        .oneshot(get("/auth/..%2fapi/orders/123", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// RATE LIMITING
// ============================================================================

#[tokio::test]
async fn test_anonymous_clients_are_rate_limited() {
    let mut config = gateway_config();
    config.rate_limit.anonymous_limit = 2;
    let server = ServerConfig {
        cookie_secure: false,
        trust_forwarded_for: true,
        ..Default::default()
    };
    let app = build_app(config, Arc::new(InMemoryDistributedCache::new()), server).await;

    let from = |addr: &str| {
        Request::builder()
            .uri("/auth/login")
            .header("x-forwarded-for", addr)
            .body(Body::empty())
            .unwrap()
    };

    for remaining in ["1", "0"] {
        let response = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let limited = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key(header::RETRY_AFTER));
    let body = body_json(limited).await;
    assert_eq!(body["error"], "rate_limited");

    // other clients and gateway endpoints are unaffected
    let other = app.clone().oneshot(from("198.51.100.1")).await.unwrap();
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
    let health = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authenticated_subjects_get_their_own_limit() {
    let mut config = gateway_config();
    config.rate_limit.anonymous_limit = 1;
    config.rate_limit.authenticated_limit = 3;
    let server = ServerConfig {
        cookie_secure: false,
        ..Default::default()
    };
    let app = build_app(config, Arc::new(InMemoryDistributedCache::new()), server).await;
    let session = login(&app, "reader").await;

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/api/orders/1", Some(&session))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let limited = app.clone().oneshot(get("/api/orders/1", Some(&session))).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["x-ratelimit-limit"], "3");
}
