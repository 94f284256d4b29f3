//! Decision pipeline
//!
//! Turns an [`AuthRequest`] into an [`AuthDecision`] using the current policy
//! snapshot and the subject's resolved permissions, with metrics and audit logging.

pub mod decision;
pub mod metrics;

pub use decision::{AllowBasis, AuthDecision, AuthRequest, Decision, DenyReason};
pub use metrics::GatewayMetrics;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::policy::{normalize_path, PolicyStore, Verdict};
use crate::resolver::PermissionResolver;

/// Outcome applied when the pipeline has no rule-based answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Decision when no rule matches the request
    pub no_rule_matched: PolicyEffect,

    /// Decision when a protected request's permissions cannot be resolved
    pub on_permissions_unavailable: PolicyEffect,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            no_rule_matched: PolicyEffect::Deny,
            on_permissions_unavailable: PolicyEffect::Deny,
        }
    }
}

/// Authorization pipeline
///
/// # Architecture
///
/// ```text
/// Request → path check → stale check → PolicySnapshot::match_rule → Verdict
///                                                        │
///             Public ─────────────────────────────────▶ Allow
///             Authenticated ── subject? ──────────────▶ Allow / Deny
///             RequiresPermission ── PermissionResolver ▶ Allow / Deny
///             NoRuleMatched ── configured default ────▶ Allow / Deny
///                                                        ↓
///                                                    [Metrics]
/// ```
pub struct DecisionPipeline {
    policies: Arc<PolicyStore>,
    resolver: PermissionResolver,
    config: PipelineConfig,
    metrics: Arc<GatewayMetrics>,
}

impl DecisionPipeline {
    pub fn new(
        policies: Arc<PolicyStore>,
        resolver: PermissionResolver,
        config: PipelineConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        info!(
            no_rule_matched = ?config.no_rule_matched,
            on_permissions_unavailable = ?config.on_permissions_unavailable,
            "Decision pipeline initialized"
        );

        Self {
            policies,
            resolver,
            config,
            metrics,
        }
    }

    /// Authorize a request
    ///
    /// # Pipeline
    ///
    /// 1. Deny with `MalformedPath` if the path carries encoded separators
    /// 2. Deny with `PolicyUnavailable` if the snapshot is untrusted (fail-closed only)
    /// 3. Match the normalized path against the snapshot
    /// 4. Resolve permissions when the winning rule requires one
    /// 5. Record metrics
    ///
    /// Never fails: dependency errors become deny (or fail-open) decisions.
    pub async fn authorize(&self, request: &AuthRequest) -> AuthDecision {
        let start = Instant::now();

        debug!(
            method = %request.method,
            path = %request.path,
            authenticated = request.subject.is_some(),
            "Authorization request"
        );

        let decision = self.decide(request).await;
        self.finalize(request, decision, start)
    }

    async fn decide(&self, request: &AuthRequest) -> AuthDecision {
        let Some(path) = normalize_path(&request.path) else {
            warn!(path = %request.path, "Rejecting path with encoded separators");
            return AuthDecision::deny(DenyReason::MalformedPath)
                .with_policy_version(self.policies.snapshot().version());
        };

        if self.policies.policy_unavailable() {
            warn!(path = %request.path, "Policy snapshot is stale, failing closed");
            return AuthDecision::deny(DenyReason::PolicyUnavailable)
                .with_policy_version(self.policies.snapshot().version());
        }

        let snapshot = self.policies.snapshot();
        let rule = snapshot.match_rule(&request.method, &path);
        let verdict = rule.map(|r| r.verdict()).unwrap_or(Verdict::NoRuleMatched);

        let decision = match verdict {
            Verdict::Public => AuthDecision::allow(AllowBasis::PublicRule),

            Verdict::Authenticated => match &request.subject {
                Some(_) => AuthDecision::allow(AllowBasis::Authenticated),
                None => Self::missing_subject(request),
            },

            Verdict::RequiresPermission(required) => match &request.subject {
                None => Self::missing_subject(request),
                Some(subject) => self.check_permission(subject, &required).await,
            },

            Verdict::NoRuleMatched => {
                info!(
                    method = %request.method,
                    path = %request.path,
                    default = ?self.config.no_rule_matched,
                    "No protection rule matched"
                );
                match self.config.no_rule_matched {
                    PolicyEffect::Allow => AuthDecision::allow(AllowBasis::DefaultAllow),
                    PolicyEffect::Deny => AuthDecision::deny(DenyReason::NoRuleMatched),
                }
            }
        };

        decision
            .with_rule(rule)
            .with_policy_version(snapshot.version())
    }

    /// Denial for a rule that needs a subject when none was resolved
    fn missing_subject(request: &AuthRequest) -> AuthDecision {
        if request.identity_unavailable {
            AuthDecision::deny(DenyReason::IdentityUnavailable)
        } else {
            AuthDecision::deny(DenyReason::Unauthenticated)
        }
    }

    async fn check_permission(&self, subject: &str, required: &str) -> AuthDecision {
        match self.resolver.resolve(subject).await {
            Ok(resolved) => {
                let stale = resolved.is_stale();
                let decision = if resolved.permissions.has_permission(required) {
                    AuthDecision::allow(AllowBasis::PermissionGranted)
                } else {
                    debug!(subject, required, "Subject lacks required permission");
                    AuthDecision::deny(DenyReason::MissingPermission {
                        required: required.to_string(),
                    })
                };
                decision.with_stale_permissions(stale)
            }
            Err(err) => {
                warn!(subject, required, error = %err, "Permission resolution failed");
                match self.config.on_permissions_unavailable {
                    PolicyEffect::Allow => AuthDecision::allow(AllowBasis::FailOpen),
                    PolicyEffect::Deny => AuthDecision::deny(DenyReason::PermissionsUnavailable),
                }
            }
        }
    }

    fn finalize(&self, request: &AuthRequest, mut decision: AuthDecision, start: Instant) -> AuthDecision {
        let elapsed = start.elapsed();
        decision.latency_us = elapsed.as_micros() as u64;

        let outcome = if decision.is_allowed() { "allow" } else { "deny" };
        self.metrics.record_decision(outcome, decision.decision.label(), elapsed);

        debug!(
            decision_id = %decision.id,
            outcome,
            reason = decision.decision.label(),
            method = %request.method,
            path = %request.path,
            matched_rule = decision.matched_rule.as_deref().unwrap_or("-"),
            policy_version = decision.policy_version,
            stale_permissions = decision.stale_permissions,
            latency_us = decision.latency_us,
            "Authorization decision"
        );

        decision
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
