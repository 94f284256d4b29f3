//! Two-tier permission resolver
//!
//! ```text
//! resolve(subject)
//!   ├─ LocalTier hit ───────────────────────────────▶ Local
//!   └─ miss: join or start the subject's single load
//!        load (detached task on the worker pool)
//!          ├─ DistributedCache hit ─▶ commit local ─▶ Distributed
//!          └─ identity service (breaker + timeout)
//!                 ─▶ write distributed ─▶ commit local ─▶ Upstream
//!   load failed: stale local value ─▶ Stale, otherwise PermissionsUnavailable
//! ```
//!
//! Every load carries a generation number. `evict` drops the in-flight entry, so a
//! load that finishes afterwards sees a different (or no) generation and throws its
//! result away instead of resurrecting evicted permissions. `evict` also records a
//! per-subject watermark: distributed entries fetched before it are treated as
//! misses, which covers writes that land in the shared tier after the delete.
//!
//! A local copy never outlives its distributed entry: its freshness is capped at
//! `fetched_at + distributed_ttl`.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::{DistributedCache, LocalTier, Lookup};
use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};
use crate::identity::IdentityClient;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy, WorkerPool};
use crate::types::PrincipalPermissionSet;

/// Watermarks kept before expired ones are pruned
const WATERMARK_PRUNE_THRESHOLD: usize = 1024;

/// Key of a subject's permission set in the distributed tier
pub fn permissions_key(subject: &str) -> String {
    format!("authz:perms:{}", subject)
}

/// Permission resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Maximum subjects held in the local tier
    pub local_capacity: usize,

    #[serde(rename = "local_ttl_secs", with = "crate::config::secs")]
    pub local_ttl: Duration,

    /// How long past its TTL a local entry may still be served after a failed load
    #[serde(rename = "stale_grace_secs", with = "crate::config::secs")]
    pub stale_grace: Duration,

    #[serde(rename = "distributed_ttl_secs", with = "crate::config::secs")]
    pub distributed_ttl: Duration,

    /// Bound on each distributed tier round trip
    #[serde(rename = "distributed_op_timeout_ms", with = "crate::config::millis")]
    pub distributed_op_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            local_capacity: 100_000,
            local_ttl: Duration::from_secs(60),
            stale_grace: Duration::from_secs(300),
            distributed_ttl: Duration::from_secs(3600),
            distributed_op_timeout: Duration::from_millis(500),
        }
    }
}

/// Tier that answered a resolve call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSource {
    Local,
    Distributed,
    Upstream,
    /// Expired local value served because the reload failed
    Stale,
}

impl PermissionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionSource::Local => "local",
            PermissionSource::Distributed => "distributed",
            PermissionSource::Upstream => "upstream",
            PermissionSource::Stale => "stale",
        }
    }
}

/// Permission set together with where it came from
#[derive(Debug, Clone)]
pub struct ResolvedPermissions {
    pub permissions: Arc<PrincipalPermissionSet>,
    pub source: PermissionSource,
    /// Joined a load started by another caller
    pub coalesced: bool,
}

impl ResolvedPermissions {
    pub fn is_stale(&self) -> bool {
        self.source == PermissionSource::Stale
    }
}

/// Resolver counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    pub local_entries: usize,
    pub local_hits: u64,
    pub distributed_hits: u64,
    pub upstream_fetches: u64,
    pub coalesced_waits: u64,
    pub stale_served: u64,
    pub failures: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct Loaded {
    permissions: Arc<PrincipalPermissionSet>,
    source: PermissionSource,
}

type SharedLoad = Shared<BoxFuture<'static, Result<Loaded>>>;

struct InFlight {
    generation: u64,
    load: SharedLoad,
}

#[derive(Default)]
struct Counters {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    upstream_fetches: AtomicU64,
    coalesced_waits: AtomicU64,
    stale_served: AtomicU64,
    failures: AtomicU64,
}

struct ResolverInner {
    local: LocalTier<Arc<PrincipalPermissionSet>>,
    distributed: Arc<dyn DistributedCache>,
    identity: Arc<dyn IdentityClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryPolicy>,
    pool: Arc<WorkerPool>,
    service_name: String,
    fetch_timeout: Duration,
    config: ResolverConfig,
    metrics: Arc<GatewayMetrics>,
    in_flight: DashMap<String, InFlight>,
    generation: AtomicU64,
    /// subject → time of its last eviction
    evicted: DashMap<String, DateTime<Utc>>,
    counters: Counters,
}

/// Subject → permission set resolver with local and distributed tiers
#[derive(Clone)]
pub struct PermissionResolver {
    inner: Arc<ResolverInner>,
}

/// Collaborators shared with the rest of the engine
pub struct ResolverDeps {
    pub distributed: Arc<dyn DistributedCache>,
    pub identity: Arc<dyn IdentityClient>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: Arc<RetryPolicy>,
    pub pool: Arc<WorkerPool>,
    pub metrics: Arc<GatewayMetrics>,
}

impl PermissionResolver {
    /// `service_name` selects the breaker, `fetch_timeout` bounds one fetch-through
    pub fn new(
        config: ResolverConfig,
        service_name: impl Into<String>,
        fetch_timeout: Duration,
        deps: ResolverDeps,
    ) -> Self {
        let local = LocalTier::new(config.local_capacity, config.local_ttl, config.stale_grace);

        Self {
            inner: Arc::new(ResolverInner {
                local,
                distributed: deps.distributed,
                identity: deps.identity,
                breakers: deps.breakers,
                retry: deps.retry,
                pool: deps.pool,
                service_name: service_name.into(),
                fetch_timeout,
                config,
                metrics: deps.metrics,
                in_flight: DashMap::new(),
                generation: AtomicU64::new(0),
                evicted: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Resolve a subject's permission set
    ///
    /// At most one load per subject is in flight; concurrent callers share it.
    /// Dropping the returned future only abandons this caller's wait.
    pub async fn resolve(&self, subject: &str) -> Result<ResolvedPermissions> {
        if subject.trim().is_empty() {
            return Err(AuthzError::PermissionsUnavailable {
                subject: subject.to_string(),
                cause: "empty subject id".into(),
            });
        }

        if let Some(permissions) = self.inner.local.get(subject) {
            self.inner.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.record_lookup(PermissionSource::Local.as_str());
            return Ok(ResolvedPermissions {
                permissions,
                source: PermissionSource::Local,
                coalesced: false,
            });
        }

        let (load, coalesced) = self.join_or_start(subject);

        match load.await {
            Ok(loaded) => {
                self.inner.metrics.record_lookup(loaded.source.as_str());
                Ok(ResolvedPermissions {
                    permissions: loaded.permissions,
                    source: loaded.source,
                    coalesced,
                })
            }
            Err(err) => self.fall_back(subject, err),
        }
    }

    fn join_or_start(&self, subject: &str) -> (SharedLoad, bool) {
        match self.inner.in_flight.entry(subject.to_string()) {
            Entry::Occupied(entry) => {
                self.inner.counters.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                debug!(subject, "Joining in-flight permission load");
                (entry.get().load.clone(), true)
            }
            Entry::Vacant(entry) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let load = ResolverInner::start_load(self.inner.clone(), subject.to_string(), generation);
                entry.insert(InFlight {
                    generation,
                    load: load.clone(),
                });
                (load, false)
            }
        }
    }

    fn fall_back(&self, subject: &str, err: AuthzError) -> Result<ResolvedPermissions> {
        match self.inner.local.lookup(subject) {
            Lookup::Fresh(permissions) => Ok(ResolvedPermissions {
                permissions,
                source: PermissionSource::Local,
                coalesced: false,
            }),
            Lookup::Stale(permissions) => {
                self.inner.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.record_lookup(PermissionSource::Stale.as_str());
                warn!(subject, error = %err, "Serving stale permissions after failed load");
                Ok(ResolvedPermissions {
                    permissions,
                    source: PermissionSource::Stale,
                    coalesced: false,
                })
            }
            Lookup::Missing => {
                self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.record_lookup("unavailable");
                warn!(subject, error = %err, "Permissions unavailable");
                Err(AuthzError::PermissionsUnavailable {
                    subject: subject.to_string(),
                    cause: err.to_string(),
                })
            }
        }
    }

    /// Remove a subject from both tiers and abandon any in-flight load for it
    pub async fn evict(&self, subject: &str) -> Result<()> {
        self.inner.record_eviction(subject);
        self.inner.in_flight.remove(subject);
        let was_local = self.inner.local.remove(subject);

        let key = permissions_key(subject);
        let was_distributed = self.inner.distributed_op("delete", self.inner.distributed.delete(&key)).await?;

        info!(subject, was_local, was_distributed, "Evicted cached permissions");
        Ok(())
    }

    /// Fresh local entry, without touching the other tiers
    pub fn peek_local(&self, subject: &str) -> Option<Arc<PrincipalPermissionSet>> {
        match self.inner.local.lookup(subject) {
            Lookup::Fresh(permissions) => Some(permissions),
            _ => None,
        }
    }

    pub fn stats(&self) -> ResolverStats {
        let counters = &self.inner.counters;
        ResolverStats {
            local_entries: self.inner.local.len(),
            local_hits: counters.local_hits.load(Ordering::Relaxed),
            distributed_hits: counters.distributed_hits.load(Ordering::Relaxed),
            upstream_fetches: counters.upstream_fetches.load(Ordering::Relaxed),
            coalesced_waits: counters.coalesced_waits.load(Ordering::Relaxed),
            stale_served: counters.stale_served.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.inner.config
    }
}

impl ResolverInner {
    /// Build the shared load future; the task is spawned on first poll, after the
    /// in-flight entry exists
    fn start_load(inner: Arc<Self>, subject: String, generation: u64) -> SharedLoad {
        async move {
            let task_inner = inner.clone();
            let task_subject = subject.clone();
            let result = inner
                .pool
                .run(async move {
                    let result = task_inner.load(&task_subject, generation).await;
                    task_inner.finish(&task_subject, generation);
                    result
                })
                .await;
            inner.finish(&subject, generation);
            result
        }
        .boxed()
        .shared()
    }

    async fn load(&self, subject: &str, generation: u64) -> Result<Loaded> {
        let key = permissions_key(subject);

        if let Some(permissions) = self.read_distributed(subject, &key).await {
            let permissions = Arc::new(permissions);
            self.counters.distributed_hits.fetch_add(1, Ordering::Relaxed);
            self.commit_local(subject, generation, permissions.clone());
            return Ok(Loaded {
                permissions,
                source: PermissionSource::Distributed,
            });
        }

        let permissions = Arc::new(self.fetch_upstream(subject).await?);
        self.counters.upstream_fetches.fetch_add(1, Ordering::Relaxed);

        if !self.is_current(subject, generation) {
            debug!(subject, "Load superseded by eviction, not writing the shared tier");
            return Ok(Loaded {
                permissions,
                source: PermissionSource::Upstream,
            });
        }

        self.write_distributed(&key, &permissions).await;
        if !self.commit_local(subject, generation, permissions.clone()) {
            debug!(subject, "Load superseded by eviction, discarding result");
            if let Err(e) = self.distributed_op("delete", self.distributed.delete(&key)).await {
                warn!(subject, error = %e, "Could not discard superseded permissions");
            }
        }

        Ok(Loaded {
            permissions,
            source: PermissionSource::Upstream,
        })
    }

    async fn fetch_upstream(&self, subject: &str) -> Result<PrincipalPermissionSet> {
        let breaker = self.breakers.breaker(&self.service_name);
        let (breaker, identity) = (&breaker, &self.identity);
        let limit = self.fetch_timeout;
        // stamped before the request so an eviction during the fetch orders after it
        let started = Utc::now();

        let (permissions, roles) = self
            .retry
            .run("permissions", move || {
                breaker.call(limit, move || async move {
                    tokio::try_join!(identity.permission_codes(subject), identity.role_names(subject))
                })
            })
            .await?;

        debug!(
            subject,
            permissions = permissions.len(),
            roles = roles.len(),
            "Fetched permissions from identity service"
        );
        let mut fetched = PrincipalPermissionSet::new(subject, permissions, roles);
        fetched.fetched_at = started;
        Ok(fetched)
    }

    fn is_current(&self, subject: &str, generation: u64) -> bool {
        self.in_flight
            .get(subject)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Insert into the local tier only if this load is still the current one
    fn commit_local(&self, subject: &str, generation: u64, permissions: Arc<PrincipalPermissionSet>) -> bool {
        let current = self.in_flight.get(subject);
        match current {
            Some(entry) if entry.generation == generation => {
                let deadline = self.distributed_deadline(&permissions);
                self.local.insert_until(subject, permissions, deadline);
                true
            }
            _ => false,
        }
    }

    /// When the distributed copy of `permissions` expires
    fn distributed_deadline(&self, permissions: &PrincipalPermissionSet) -> Instant {
        let age = (Utc::now() - permissions.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Instant::now() + self.config.distributed_ttl.saturating_sub(age)
    }

    fn record_eviction(&self, subject: &str) {
        let now = Utc::now();
        self.evicted.insert(subject.to_string(), now);

        if self.evicted.len() > WATERMARK_PRUNE_THRESHOLD {
            let ttl = self.config.distributed_ttl;
            self.evicted
                .retain(|_, at| (now - *at).to_std().map(|age| age < ttl).unwrap_or(true));
        }
    }

    /// Fetched no later than the subject's last eviction
    fn predates_eviction(&self, subject: &str, permissions: &PrincipalPermissionSet) -> bool {
        self.evicted
            .get(subject)
            .is_some_and(|evicted_at| permissions.fetched_at <= *evicted_at)
    }

    fn finish(&self, subject: &str, generation: u64) {
        self.in_flight
            .remove_if(subject, |_, entry| entry.generation == generation);
    }

    async fn read_distributed(&self, subject: &str, key: &str) -> Option<PrincipalPermissionSet> {
        let raw = match self.distributed_op("get", self.distributed.get(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Distributed tier read failed, falling through");
                return None;
            }
        };

        match serde_json::from_str::<PrincipalPermissionSet>(&raw) {
            Ok(permissions) if self.predates_eviction(subject, &permissions) => {
                debug!(subject, fetched_at = %permissions.fetched_at, "Ignoring distributed entry older than last eviction");
                None
            }
            Ok(permissions) => Some(permissions),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable distributed entry");
                None
            }
        }
    }

    async fn write_distributed(&self, key: &str, permissions: &PrincipalPermissionSet) {
        let raw = match serde_json::to_string(permissions) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Could not encode permissions");
                return;
            }
        };

        let write = self
            .distributed
            .set(key, &raw, self.config.distributed_ttl);
        if let Err(e) = self.distributed_op("set", write).await {
            warn!(key, error = %e, "Distributed tier write failed");
        }
    }

    /// Bound a distributed tier call and count its failures
    async fn distributed_op<T>(
        &self,
        operation: &str,
        op: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = match tokio::time::timeout(self.config.distributed_op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(AuthzError::Timeout(format!(
                "distributed {} exceeded {:?}",
                operation, self.config.distributed_op_timeout
            ))),
        };

        if result.is_err() {
            self.metrics.record_distributed_error(operation);
        }
        result.map_err(|e| match e {
            AuthzError::Timeout(_) | AuthzError::CacheError(_) => e,
            other => AuthzError::CacheError(other.to_string()),
        })
    }
}
