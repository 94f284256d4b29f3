//! Error types for the authorization engine

use thiserror::Error;

/// Authorization engine errors
///
/// Cloneable so a single failed load can be handed to every coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum AuthzError {
    /// Policy sync could not produce a new snapshot (previous one is retained)
    #[error("Policy sync failed: {0}")]
    PolicySyncFailure(String),

    /// Permissions could not be resolved and no stale value was available
    #[error("Permissions unavailable for subject {subject}: {cause}")]
    PermissionsUnavailable { subject: String, cause: String },

    /// Circuit breaker rejected the call without invoking it
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Operation exceeded its time bound
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Worker pool could not admit the task in time
    #[error("Worker pool saturated: {0}")]
    Overloaded(String),

    /// Identity service or downstream answered with an error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Distributed or local cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Path pattern could not be compiled
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Access token could not be decoded or validated
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Session does not exist (or has expired in the distributed tier)
    #[error("Session not found")]
    SessionNotFound,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthzError {
    /// Failures caused by an unavailable dependency rather than by the input
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthzError::CircuitOpen(_)
                | AuthzError::Timeout(_)
                | AuthzError::Overloaded(_)
                | AuthzError::Upstream(_)
                | AuthzError::CacheError(_)
        )
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(e: serde_json::Error) -> Self {
        AuthzError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for AuthzError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthzError::Timeout(e.to_string())
        } else {
            AuthzError::Upstream(e.to_string())
        }
    }
}

impl From<prometheus::Error> for AuthzError {
    fn from(e: prometheus::Error) -> Self {
        AuthzError::Internal(format!("metrics: {}", e))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for AuthzError {
    fn from(e: redis::RedisError) -> Self {
        AuthzError::CacheError(e.to_string())
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
