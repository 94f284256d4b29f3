//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unique subject (user) identifier as issued by the identity provider
pub type SubjectId = String;

/// Unique rule identifier
pub type RuleId = String;

/// Permission code, e.g. `order:read`
pub type PermissionCode = String;

/// Audit metadata carried by every endpoint protection rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Endpoint protection rule as published by the identity service
///
/// Read-only inside the gateway: rules are replaced wholesale on every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProtection {
    /// Rule identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RuleId>,

    /// Multi-segment wildcard path pattern (e.g. `/api/orders/**`)
    pub pattern: String,

    /// HTTP method or `*`
    #[serde(default = "default_method")]
    pub method: String,

    /// Permission code required to access the endpoint
    #[serde(default, alias = "permissionCode")]
    pub required_permission: Option<PermissionCode>,

    /// Public endpoints need no authentication at all
    #[serde(default, rename = "isPublic", alias = "public")]
    pub is_public: bool,

    /// Higher priority wins
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub deleted: bool,

    #[serde(flatten)]
    pub audit: AuditMetadata,
}

fn default_method() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

impl EndpointProtection {
    /// Create an active rule requiring a permission code
    pub fn protected(
        pattern: impl Into<String>,
        method: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            pattern: pattern.into(),
            method: method.into(),
            required_permission: Some(permission.into()),
            is_public: false,
            priority: 0,
            active: true,
            deleted: false,
            audit: AuditMetadata::default(),
        }
    }

    /// Create an active public rule
    pub fn public(pattern: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            required_permission: None,
            is_public: true,
            ..Self::protected(pattern, method, String::new())
        }
    }

    /// Create an active rule that only requires an authenticated subject
    pub fn authenticated(pattern: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            required_permission: None,
            ..Self::protected(pattern, method, String::new())
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn mark_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Whether the rule takes part in matching
    pub fn is_enforced(&self) -> bool {
        self.active && !self.deleted
    }

    /// Required permission with blank codes treated as absent
    pub fn permission(&self) -> Option<&str> {
        self.required_permission
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
    }
}

/// Permission codes and role names granted to one subject
///
/// Immutable once built; the resolver replaces sets wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalPermissionSet {
    pub subject_id: SubjectId,
    pub permission_codes: BTreeSet<PermissionCode>,
    pub role_names: BTreeSet<String>,
    pub fetched_at: DateTime<Utc>,
}

impl PrincipalPermissionSet {
    pub fn new<P, R>(subject_id: impl Into<String>, permissions: P, roles: R) -> Self
    where
        P: IntoIterator<Item = String>,
        R: IntoIterator<Item = String>,
    {
        Self {
            subject_id: subject_id.into(),
            permission_codes: permissions.into_iter().collect(),
            role_names: roles.into_iter().collect(),
            fetched_at: Utc::now(),
        }
    }

    pub fn has_permission(&self, code: &str) -> bool {
        self.permission_codes.contains(code)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role_names.contains(role)
    }
}
