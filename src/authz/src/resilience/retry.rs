//! Retry with exponential backoff around breaker-guarded calls
//!
//! Every attempt goes back through the breaker, so an open circuit ends the
//! retries immediately. Only transport-level failures are retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one; 1 disables retrying
    pub max_attempts: u32,

    #[serde(rename = "initial_backoff_ms", with = "crate::config::millis")]
    pub initial_backoff: Duration,

    #[serde(rename = "max_backoff_ms", with = "crate::config::millis")]
    pub max_backoff: Duration,

    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AuthzError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(AuthzError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(AuthzError::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Errors worth another attempt
///
/// Breaker rejections, pool saturation and bad input are returned as they are.
pub fn is_retryable(err: &AuthzError) -> bool {
    matches!(err, AuthzError::Upstream(_) | AuthzError::Timeout(_))
}

/// Shared retry policy for identity service calls
pub struct RetryPolicy {
    config: RetryConfig,
    metrics: Arc<GatewayMetrics>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (1-based), before jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.config.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.config.initial_backoff.mul_f64(factor);
        delay.min(self.config.max_backoff)
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut made = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if made < self.config.max_attempts && is_retryable(&err) => {
                    // 0.5x to 1.5x of the backoff
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    let delay = self.backoff(made).mul_f64(jitter);
                    debug!(operation, attempt = made, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
                    self.metrics.retries.with_label_values(&[operation]).inc();
                    tokio::time::sleep(delay).await;
                    made += 1;
                }
                Err(err) => {
                    if made > 1 {
                        warn!(operation, attempts = made, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig {
                max_attempts,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                multiplier: 2.0,
            },
            Arc::new(GatewayMetrics::new().unwrap()),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.backoff(1), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let policy = policy(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let value = policy
            .run("permissions", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AuthzError::Upstream("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            policy.metrics.counter_value(&policy.metrics.retries, &["permissions"]),
            2
        );
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let policy = policy(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .run("policies", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AuthzError::Timeout("slow".into()))
            })
            .await;

        assert!(matches!(result, Err(AuthzError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_retried() {
        let policy = policy(3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = policy
            .run("permissions", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AuthzError::CircuitOpen("identity-service".into()))
            })
            .await;

        assert!(matches!(result, Err(AuthzError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RetryConfig::default();
        assert!(config.validate().is_ok());

        config.max_attempts = 0;
        assert!(config.validate().is_err());

        config.max_attempts = 2;
        config.multiplier = 0.5;
        assert!(config.validate().is_err());
    }
}
