//! Component wiring
//!
//! Builds every engine component from one [`GatewayConfig`] so the HTTP layer and
//! tests share the same assembly.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{build_distributed, DistributedCache};
use crate::config::GatewayConfig;
use crate::engine::{DecisionPipeline, GatewayMetrics};
use crate::error::Result;
use crate::health::{HealthAggregator, HealthProbe, HttpHealthProbe};
use crate::identity::{HttpIdentityClient, IdentityClient};
use crate::policy::{PolicyStore, PolicySyncer};
use crate::resilience::{CircuitBreakerRegistry, PoolConfig, RateLimiter, RetryPolicy, WorkerPool};
use crate::resolver::{PermissionResolver, ResolverDeps};
use crate::session::SessionManager;

/// Every engine component, wired together
pub struct GatewayRuntime {
    pub config: GatewayConfig,
    pub metrics: Arc<GatewayMetrics>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryPolicy>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Permission loads and policy refreshes
    pub fetch_pool: Arc<WorkerPool>,
    /// Health probes
    pub probe_pool: Arc<WorkerPool>,
    pub distributed: Arc<dyn DistributedCache>,
    pub policies: Arc<PolicyStore>,
    pub resolver: PermissionResolver,
    pub pipeline: Arc<DecisionPipeline>,
    pub sessions: Arc<SessionManager>,
    pub health: Arc<HealthAggregator>,
}

impl GatewayRuntime {
    /// Wire the engine around explicit collaborators
    pub fn new(
        config: GatewayConfig,
        identity: Arc<dyn IdentityClient>,
        distributed: Arc<dyn DistributedCache>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(GatewayMetrics::new()?);
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            metrics.clone(),
        ));
        let retry = Arc::new(RetryPolicy::new(config.retry.clone(), metrics.clone()));
        let fetch_pool = Arc::new(WorkerPool::new("fetch", &config.pool, metrics.clone()));
        let probe_pool = Arc::new(WorkerPool::new(
            "probe",
            &PoolConfig {
                max_concurrent: config.health.max_concurrent_probes,
                max_wait: config.pool.max_wait,
            },
            metrics.clone(),
        ));

        let service_name = config.identity.service_name.clone();

        let policies = Arc::new(PolicyStore::new(
            identity.clone(),
            breakers.clone(),
            retry.clone(),
            fetch_pool.clone(),
            service_name.clone(),
            config.policy.clone(),
            metrics.clone(),
        ));

        let resolver = PermissionResolver::new(
            config.permissions.clone(),
            service_name,
            config.identity.fetch_timeout,
            ResolverDeps {
                distributed: distributed.clone(),
                identity,
                breakers: breakers.clone(),
                retry: retry.clone(),
                pool: fetch_pool.clone(),
                metrics: metrics.clone(),
            },
        );

        let pipeline = Arc::new(DecisionPipeline::new(
            policies.clone(),
            resolver.clone(),
            config.pipeline.clone(),
            metrics.clone(),
        ));

        let sessions = Arc::new(SessionManager::new(
            distributed.clone(),
            config.session.clone(),
            metrics.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            distributed.clone(),
            metrics.clone(),
        ));

        let health = Arc::new(HealthAggregator::new(
            config.health.clone(),
            probe,
            breakers.clone(),
            probe_pool.clone(),
            metrics.clone(),
        ));

        info!(
            identity = %config.identity.base_url,
            distributed = distributed.backend(),
            downstreams = config.health.downstreams.len(),
            "Gateway runtime assembled"
        );

        Ok(Self {
            config,
            metrics,
            breakers,
            retry,
            rate_limiter,
            fetch_pool,
            probe_pool,
            distributed,
            policies,
            resolver,
            pipeline,
            sessions,
            health,
        })
    }

    /// Wire the engine with the HTTP identity client and the configured backends
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let identity = Arc::new(HttpIdentityClient::new(config.identity.clone())?);
        let distributed = build_distributed(&config.distributed)?;
        let probe = Arc::new(HttpHealthProbe::new()?);
        Self::new(config, identity, distributed, probe)
    }

    /// Start the background policy sync loop
    pub fn spawn_policy_sync(&self) -> (JoinHandle<()>, CancellationToken) {
        let syncer = PolicySyncer::new(self.policies.clone(), self.config.policy.sync_interval);
        let shutdown = syncer.shutdown_token();
        (syncer.spawn(), shutdown)
    }
}
