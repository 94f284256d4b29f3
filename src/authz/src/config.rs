//! Gateway configuration
//!
//! Every component owns its config struct; [`GatewayConfig`] aggregates them and is
//! what the server loads from YAML. All sections are optional and fall back to
//! [`Default`].

use crate::cache::DistributedConfig;
use crate::engine::PipelineConfig;
use crate::error::{AuthzError, Result};
use crate::health::HealthConfig;
use crate::identity::IdentityConfig;
use crate::policy::PolicySyncConfig;
use crate::resilience::{CircuitConfig, PoolConfig, RateLimitConfig, RetryConfig};
use crate::resolver::ResolverConfig;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub identity: IdentityConfig,
    pub policy: PolicySyncConfig,
    pub permissions: ResolverConfig,
    pub pipeline: PipelineConfig,
    pub circuit_breaker: CircuitConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub pool: PoolConfig,
    pub distributed: DistributedConfig,
    pub session: SessionConfig,
    pub health: HealthConfig,
}

impl GatewayConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| AuthzError::Config(e.to_string()))
    }

    /// Load and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AuthzError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.identity.base_url.trim().is_empty() {
            return Err(AuthzError::Config("identity.base_url must be set".into()));
        }

        if self.permissions.local_capacity == 0 {
            return Err(AuthzError::Config(
                "permissions.local_capacity must be greater than 0".into(),
            ));
        }

        if self.permissions.local_ttl.is_zero() || self.permissions.distributed_ttl.is_zero() {
            return Err(AuthzError::Config("permission TTLs must be greater than 0".into()));
        }

        if self.policy.sync_interval.is_zero() {
            return Err(AuthzError::Config("policy.sync_interval_ms must be greater than 0".into()));
        }

        if self.session.ttl.is_zero() {
            return Err(AuthzError::Config("session.ttl_secs must be greater than 0".into()));
        }

        if self.pool.max_concurrent == 0 || self.health.max_concurrent_probes == 0 {
            return Err(AuthzError::Config("worker pools need at least one permit".into()));
        }

        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.rate_limit.validate()?;

        for target in &self.health.downstreams {
            if target.name.trim().is_empty() || target.url.trim().is_empty() {
                return Err(AuthzError::Config(
                    "health downstreams need a name and a url".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde adapter storing a `Duration` as integer seconds
pub mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
