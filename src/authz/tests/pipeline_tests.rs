//! End-to-end decision pipeline tests

mod common;

use common::{order_rules, runtime, MockIdentity};
use gateguard_authz::{
    AllowBasis, AuthRequest, Decision, DenyReason, GatewayConfig, GatewayRuntime, PolicyEffect,
};
use std::sync::Arc;

async fn ready_runtime(config: GatewayConfig) -> (GatewayRuntime, Arc<MockIdentity>) {
    let identity = MockIdentity::new();
    identity.set_rules(order_rules());
    identity.grant("reader", &["order:read"]);
    identity.grant("nobody", &[]);
    let rt = runtime(config, identity.clone());
    assert!(rt.policies.refresh().await.is_updated());
    (rt, identity)
}

// ============================================================================
// ORDER SERVICE EXAMPLE
// ============================================================================

#[tokio::test]
async fn test_reader_can_read_orders() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/api/orders/42").with_subject("reader"))
        .await;

    assert_eq!(
        decision.decision,
        Decision::Allow { basis: AllowBasis::PermissionGranted }
    );
    assert_eq!(decision.matched_rule.as_deref(), Some("/api/orders/**"));
    assert_eq!(decision.matched_rule_id.as_deref(), Some("orders-read"));
    assert_eq!(decision.required_permission.as_deref(), Some("order:read"));
    assert_eq!(decision.policy_version, 1);
    assert!(!decision.stale_permissions);
}

#[tokio::test]
async fn test_reader_cannot_write_orders() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("POST", "/api/orders").with_subject("reader"))
        .await;

    assert_eq!(
        decision.deny_reason(),
        Some(&DenyReason::MissingPermission { required: "order:write".into() })
    );
}

#[tokio::test]
async fn test_subject_without_permission_is_denied() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/api/orders/42").with_subject("nobody"))
        .await;

    assert!(matches!(
        decision.deny_reason(),
        Some(DenyReason::MissingPermission { .. })
    ));
}

#[tokio::test]
async fn test_anonymous_protected_request_is_unauthenticated() {
    let (rt, identity) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt.pipeline.authorize(&AuthRequest::new("GET", "/api/orders/42")).await;

    assert_eq!(decision.deny_reason(), Some(&DenyReason::Unauthenticated));
    assert_eq!(identity.permission_calls(), 0, "No lookup without a subject");
}

#[tokio::test]
async fn test_auth_paths_are_public() {
    let (rt, identity) = ready_runtime(GatewayConfig::default()).await;

    for path in ["/auth/login", "/auth/callback", "/auth/a/b/c"] {
        let decision = rt.pipeline.authorize(&AuthRequest::new("POST", path)).await;
        assert_eq!(
            decision.decision,
            Decision::Allow { basis: AllowBasis::PublicRule },
            "{} should be public",
            path
        );
    }
    assert_eq!(identity.permission_calls(), 0);
}

#[tokio::test]
async fn test_authenticated_rule() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let anonymous = rt.pipeline.authorize(&AuthRequest::new("GET", "/api/profile")).await;
    assert_eq!(anonymous.deny_reason(), Some(&DenyReason::Unauthenticated));

    let signed_in = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/api/profile").with_subject("nobody"))
        .await;
    assert_eq!(
        signed_in.decision,
        Decision::Allow { basis: AllowBasis::Authenticated }
    );
}

// ============================================================================
// PATH NORMALIZATION
// ============================================================================

#[tokio::test]
async fn test_dot_segments_do_not_escape_public_rules() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    for path in ["/auth/../api/orders/123", "/auth/%2E%2E/api/orders/123", "/auth/./../api/orders/123"] {
        let anonymous = rt.pipeline.authorize(&AuthRequest::new("GET", path)).await;
        assert_eq!(
            anonymous.deny_reason(),
            Some(&DenyReason::Unauthenticated),
            "{} must resolve to the protected orders rule",
            path
        );
        assert_eq!(anonymous.matched_rule.as_deref(), Some("/api/orders/**"));
    }

    let nobody = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/auth/../api/orders/123").with_subject("nobody"))
        .await;
    assert!(matches!(
        nobody.deny_reason(),
        Some(DenyReason::MissingPermission { .. })
    ));
}

#[tokio::test]
async fn test_encoded_separator_is_malformed() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/auth/..%2Fapi/orders/123"))
        .await;

    assert_eq!(decision.deny_reason(), Some(&DenyReason::MalformedPath));
    assert!(decision.matched_rule.is_none());
}

// ============================================================================
// UNRESOLVED IDENTITY
// ============================================================================

#[tokio::test]
async fn test_unresolved_identity_only_affects_rules_needing_a_subject() {
    let (rt, identity) = ready_runtime(GatewayConfig::default()).await;

    let public = rt
        .pipeline
        .authorize(&AuthRequest::new("POST", "/auth/login").with_identity_unavailable())
        .await;
    assert_eq!(public.decision, Decision::Allow { basis: AllowBasis::PublicRule });

    for path in ["/api/orders/1", "/api/profile"] {
        let decision = rt
            .pipeline
            .authorize(&AuthRequest::new("GET", path).with_identity_unavailable())
            .await;
        let reason = decision.deny_reason().unwrap();
        assert_eq!(reason, &DenyReason::IdentityUnavailable);
        assert!(reason.is_dependency_failure());
    }
    assert_eq!(identity.permission_calls(), 0);
}

// ============================================================================
// DEFAULTS
// ============================================================================

#[tokio::test]
async fn test_unmatched_request_denied_by_default() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/internal/unknown").with_subject("reader"))
        .await;

    assert_eq!(decision.deny_reason(), Some(&DenyReason::NoRuleMatched));
    assert!(decision.matched_rule.is_none());
}

#[tokio::test]
async fn test_unmatched_request_allowed_when_configured() {
    let mut config = GatewayConfig::default();
    config.pipeline.no_rule_matched = PolicyEffect::Allow;
    let (rt, _) = ready_runtime(config).await;

    let decision = rt.pipeline.authorize(&AuthRequest::new("GET", "/internal/unknown")).await;
    assert_eq!(
        decision.decision,
        Decision::Allow { basis: AllowBasis::DefaultAllow }
    );
}

#[tokio::test]
async fn test_permissions_unavailable_denies() {
    let (rt, identity) = ready_runtime(GatewayConfig::default()).await;
    identity.fail_permissions(true);

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/api/orders/1").with_subject("reader"))
        .await;

    let reason = decision.deny_reason().unwrap();
    assert_eq!(reason, &DenyReason::PermissionsUnavailable);
    assert!(reason.is_dependency_failure());
}

#[tokio::test]
async fn test_permissions_unavailable_fail_open() {
    let mut config = GatewayConfig::default();
    config.pipeline.on_permissions_unavailable = PolicyEffect::Allow;
    let (rt, identity) = ready_runtime(config).await;
    identity.fail_permissions(true);

    let decision = rt
        .pipeline
        .authorize(&AuthRequest::new("GET", "/api/orders/1").with_subject("reader"))
        .await;

    assert_eq!(decision.decision, Decision::Allow { basis: AllowBasis::FailOpen });
}

#[tokio::test]
async fn test_decisions_are_counted() {
    let (rt, _) = ready_runtime(GatewayConfig::default()).await;

    rt.pipeline.authorize(&AuthRequest::new("GET", "/auth/login")).await;
    rt.pipeline.authorize(&AuthRequest::new("GET", "/api/orders/1")).await;

    let metrics = &rt.metrics;
    assert_eq!(metrics.counter_value(&metrics.decisions, &["allow", "public_rule"]), 1);
    assert_eq!(metrics.counter_value(&metrics.decisions, &["deny", "unauthenticated"]), 1);
}
