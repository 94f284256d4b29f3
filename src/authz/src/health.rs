//! Downstream health aggregation
//!
//! Probes every configured downstream concurrently, each bounded by its own timeout
//! and never routed through the circuit breaker, and annotates the result with the
//! breaker's current state and window rates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};
use crate::resilience::{CircuitBreakerRegistry, CircuitState, WorkerPool};

/// One downstream health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamTarget {
    /// Downstream name; also the name of its circuit breaker
    pub name: String,
    pub url: String,
    /// Per-target override of the probe timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DownstreamTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout_ms: None,
        }
    }

    pub fn probe_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Health aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "probe_timeout_ms", with = "crate::config::millis")]
    pub probe_timeout: Duration,

    /// Probes allowed in flight at once
    pub max_concurrent_probes: usize,

    pub downstreams: Vec<DownstreamTarget>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            max_concurrent_probes: 16,
            downstreams: Vec::new(),
        }
    }
}

/// Issues one liveness request
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Body of a successful probe (`Null` when it is not JSON)
    async fn probe(&self, url: &str) -> Result<serde_json::Value>;
}

/// `reqwest`-backed probe; any non-2xx answer is a failure
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AuthzError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> Result<serde_json::Value> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthzError::Upstream(format!("health endpoint answered {}", status)));
        }
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Up => "UP",
            HealthStatus::Down => "DOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub circuit_state: CircuitState,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateHealth {
    /// `UP` only when every downstream is up
    pub status: HealthStatus,
    pub services: Vec<ServiceHealth>,
    pub checked_at: DateTime<Utc>,
}

impl AggregateHealth {
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }
}

pub struct HealthAggregator {
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
    breakers: Arc<CircuitBreakerRegistry>,
    pool: Arc<WorkerPool>,
    metrics: Arc<GatewayMetrics>,
}

impl HealthAggregator {
    pub fn new(
        config: HealthConfig,
        probe: Arc<dyn HealthProbe>,
        breakers: Arc<CircuitBreakerRegistry>,
        pool: Arc<WorkerPool>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            probe,
            breakers,
            pool,
            metrics,
        }
    }

    /// Probe all downstreams concurrently
    pub async fn check_all(&self) -> AggregateHealth {
        let checks = self.config.downstreams.iter().map(|target| self.check(target));
        let services = join_all(checks).await;

        let status = if services.iter().all(|s| s.status == HealthStatus::Up) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };

        debug!(
            status = status.as_str(),
            downstreams = services.len(),
            "Downstream health aggregated"
        );

        AggregateHealth {
            status,
            services,
            checked_at: Utc::now(),
        }
    }

    async fn check(&self, target: &DownstreamTarget) -> ServiceHealth {
        let limit = target.probe_timeout(self.config.probe_timeout);
        let probe = self.probe.clone();
        let url = target.url.clone();

        // timed inside the pooled task so queueing for a permit is not counted
        let pooled = self
            .pool
            .run(async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(limit, probe.probe(&url))
                    .await
                    .map_err(|_| AuthzError::Timeout(format!("health probe exceeded {:?}", limit)))
                    .and_then(|answer| answer);
                Ok((outcome, started.elapsed()))
            })
            .await;

        let (result, elapsed) = match pooled {
            Ok((outcome, elapsed)) => (outcome, elapsed),
            Err(err) => (Err(err), Duration::ZERO),
        };
        let response_time_ms = elapsed.as_millis() as u64;
        let stats = self.breakers.breaker(&target.name).get_stats();

        let (status, error, details) = match result {
            Ok(body) => (HealthStatus::Up, None, Some(body).filter(|b| !b.is_null())),
            Err(err) => {
                warn!(service = %target.name, error = %err, "Downstream health probe failed");
                (HealthStatus::Down, Some(err.to_string()), None)
            }
        };

        self.metrics
            .health_probes
            .with_label_values(&[target.name.as_str(), status.as_str()])
            .inc();

        ServiceHealth {
            name: target.name.clone(),
            status,
            response_time_ms,
            circuit_state: stats.state,
            failure_rate: stats.failure_rate,
            slow_call_rate: stats.slow_call_rate,
            error,
            details,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }
}
