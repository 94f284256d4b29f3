//! Per-principal rate limiting shared through the distributed tier
//!
//! Fixed windows aligned to wall-clock time, so every gateway instance counts
//! into the same `ratelimit:<principal>:<window>` key. Authenticated subjects and
//! anonymous clients get separate limits. When the distributed tier cannot be
//! reached the count falls back to a per-instance table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::DistributedCache;
use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Requests per window for callers without a session
    pub anonymous_limit: u64,

    /// Requests per window for a resolved subject
    pub authenticated_limit: u64,

    #[serde(rename = "window_secs", with = "crate::config::secs")]
    pub window: Duration,

    /// Bound on the shared counter round trip before falling back locally
    #[serde(rename = "op_timeout_ms", with = "crate::config::millis")]
    pub op_timeout: Duration,

    /// Principals tracked by the local fallback table
    pub local_capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous_limit: 100,
            authenticated_limit: 1000,
            window: Duration::from_secs(60),
            op_timeout: Duration::from_millis(200),
            local_capacity: 100_000,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.window.is_zero() {
            return Err(AuthzError::Config("rate_limit.window_secs must be greater than 0".into()));
        }
        if self.anonymous_limit == 0 || self.authenticated_limit == 0 {
            return Err(AuthzError::Config("rate limits must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Limit tier a principal falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    Anonymous,
    Authenticated,
}

impl RateLimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Anonymous => "anonymous",
            RateLimitTier::Authenticated => "authenticated",
        }
    }
}

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Resolved subject id
    Subject(String),
    /// Client address of an anonymous caller
    Client(String),
}

impl RateLimitKey {
    pub fn tier(&self) -> RateLimitTier {
        match self {
            RateLimitKey::Subject(_) => RateLimitTier::Authenticated,
            RateLimitKey::Client(_) => RateLimitTier::Anonymous,
        }
    }

    fn principal(&self) -> String {
        match self {
            RateLimitKey::Subject(subject) => format!("user:{}", subject),
            RateLimitKey::Client(addr) => format!("ip:{}", addr),
        }
    }
}

/// Outcome of one rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: RateLimitTier,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window closes
    pub reset_after: Duration,
    /// Counted in the local table because the shared counter was unreachable
    pub local_fallback: bool,
}

impl RateLimitDecision {
    /// Whole seconds a rejected caller should wait, never zero
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }
}

/// Fixed-window limiter over the distributed tier
pub struct RateLimiter {
    config: RateLimitConfig,
    distributed: Arc<dyn DistributedCache>,
    metrics: Arc<GatewayMetrics>,
    /// principal → (window index, count)
    local: DashMap<String, (u64, u64)>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        distributed: Arc<dyn DistributedCache>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            distributed,
            metrics,
            local: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn limit_for(&self, tier: RateLimitTier) -> u64 {
        match tier {
            RateLimitTier::Anonymous => self.config.anonymous_limit,
            RateLimitTier::Authenticated => self.config.authenticated_limit,
        }
    }

    /// Count one request against `key` and report whether it may proceed
    pub async fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        let tier = key.tier();
        let limit = self.limit_for(tier);

        let window_ms = (self.config.window.as_millis() as u64).max(1);
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let window = now_ms / window_ms;
        let reset_after = Duration::from_millis(window_ms - now_ms % window_ms);

        let principal = key.principal();
        let counter_key = format!("ratelimit:{}:{}", principal, window);

        let shared = tokio::time::timeout(
            self.config.op_timeout,
            self.distributed.increment(&counter_key, self.config.window),
        )
        .await;

        let (count, local_fallback) = match shared {
            Ok(Ok(count)) => (count, false),
            Ok(Err(e)) => {
                warn!(principal = %principal, error = %e, "Shared rate limit counter failed, counting locally");
                self.metrics.record_distributed_error("increment");
                (self.count_locally(principal, window), true)
            }
            Err(_) => {
                warn!(principal = %principal, timeout = ?self.config.op_timeout, "Shared rate limit counter timed out, counting locally");
                self.metrics.record_distributed_error("increment");
                (self.count_locally(principal, window), true)
            }
        };

        let allowed = count <= limit;
        let result = if allowed { "allowed" } else { "limited" };
        self.metrics
            .rate_limit_decisions
            .with_label_values(&[tier.as_str(), result])
            .inc();

        if !allowed {
            debug!(tier = tier.as_str(), count, limit, "Rate limit exceeded");
        }

        RateLimitDecision {
            allowed,
            tier,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
            local_fallback,
        }
    }

    fn count_locally(&self, principal: String, window: u64) -> u64 {
        if !self.local.contains_key(&principal) && self.local.len() >= self.config.local_capacity {
            self.local.retain(|_, (w, _)| *w == window);
        }

        let mut entry = self.local.entry(principal).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        entry.1
    }
}
