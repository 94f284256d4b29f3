//! Authorization request and decision types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::CompiledRule;
use crate::types::SubjectId;

/// Authorization request
///
/// The subject is already authenticated by the caller (resolved from the session
/// handle); `None` means anonymous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectId>,
    /// The caller presented an identity that could not be looked up
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub identity_unavailable: bool,
}

impl AuthRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            subject: None,
            identity_unavailable: false,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Mark the identity as unknown because its store failed; rules that need a
    /// subject deny with `IdentityUnavailable` instead of `Unauthenticated`
    pub fn with_identity_unavailable(mut self) -> Self {
        self.subject = None;
        self.identity_unavailable = true;
        self
    }
}

/// Why a request was allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowBasis {
    PublicRule,
    PermissionGranted,
    Authenticated,
    /// No rule matched and the configured default is allow
    DefaultAllow,
    /// Permissions could not be resolved and the configured policy is allow
    FailOpen,
}

impl AllowBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowBasis::PublicRule => "public_rule",
            AllowBasis::PermissionGranted => "permission_granted",
            AllowBasis::Authenticated => "authenticated",
            AllowBasis::DefaultAllow => "default_allow",
            AllowBasis::FailOpen => "fail_open",
        }
    }
}

/// Why a request was denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DenyReason {
    MissingPermission { required: String },
    Unauthenticated,
    NoRuleMatched,
    PermissionsUnavailable,
    PolicyUnavailable,
    /// Session lookup failed, so the subject is unknown
    IdentityUnavailable,
    /// Path with encoded separators, rejected before matching
    MalformedPath,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::MissingPermission { .. } => "missing_permission",
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::NoRuleMatched => "no_rule_matched",
            DenyReason::PermissionsUnavailable => "permissions_unavailable",
            DenyReason::PolicyUnavailable => "policy_unavailable",
            DenyReason::IdentityUnavailable => "identity_unavailable",
            DenyReason::MalformedPath => "malformed_path",
        }
    }

    /// Denials caused by an unavailable dependency rather than by the subject
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            DenyReason::PermissionsUnavailable
                | DenyReason::PolicyUnavailable
                | DenyReason::IdentityUnavailable
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Decision {
    Allow { basis: AllowBasis },
    Deny { reason: DenyReason },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// Metric/log label of the basis or reason
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow { basis } => basis.as_str(),
            Decision::Deny { reason } => reason.as_str(),
        }
    }
}

/// Authorization decision with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDecision {
    /// Unique decision ID
    pub id: String,

    pub decision: Decision,

    /// Pattern of the winning rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,

    /// Permission code the winning rule asked for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,

    /// Snapshot version the decision was made against
    pub policy_version: u64,

    /// Permissions came from an expired local entry
    pub stale_permissions: bool,

    /// Decision timestamp (milliseconds since epoch)
    pub timestamp: i64,

    /// Time spent deciding, in microseconds
    pub latency_us: u64,
}

impl AuthDecision {
    pub fn new(decision: Decision) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            decision,
            matched_rule: None,
            matched_rule_id: None,
            required_permission: None,
            policy_version: 0,
            stale_permissions: false,
            timestamp: Utc::now().timestamp_millis(),
            latency_us: 0,
        }
    }

    /// Create an allow decision
    pub fn allow(basis: AllowBasis) -> Self {
        Self::new(Decision::Allow { basis })
    }

    /// Create a deny decision
    pub fn deny(reason: DenyReason) -> Self {
        Self::new(Decision::Deny { reason })
    }

    pub fn with_rule(mut self, rule: Option<&CompiledRule>) -> Self {
        if let Some(rule) = rule {
            self.matched_rule = Some(rule.pattern().to_string());
            self.matched_rule_id = rule.rule().id.clone();
            self.required_permission = rule.rule().permission().map(str::to_string);
        }
        self
    }

    pub fn with_policy_version(mut self, version: u64) -> Self {
        self.policy_version = version;
        self
    }

    pub fn with_stale_permissions(mut self, stale: bool) -> Self {
        self.stale_permissions = stale;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match &self.decision {
            Decision::Deny { reason } => Some(reason),
            Decision::Allow { .. } => None,
        }
    }
}
