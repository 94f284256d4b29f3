//! Policy store and synchronization
//!
//! The store holds one immutable [`PolicySnapshot`] behind a `watch` channel.
//! `refresh()` builds a complete replacement off to the side and swaps it in with a
//! single send, so matchers see either the old or the new rule set, never a mix.
//! A failed refresh leaves the current snapshot untouched.

pub mod matcher;
pub mod pattern;

pub use matcher::{CompiledRule, MethodMatcher, PolicySnapshot, Verdict};
pub use pattern::{normalize_path, PathPattern};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};
use crate::identity::IdentityClient;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy, WorkerPool};

/// What the pipeline does with a snapshot that could not be refreshed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicyMode {
    /// Keep enforcing the last good snapshot
    ServeStale,
    /// Deny with `PolicyUnavailable` once the snapshot can no longer be trusted
    FailClosed,
}

/// Policy sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySyncConfig {
    #[serde(rename = "sync_interval_ms", with = "crate::config::millis")]
    pub sync_interval: Duration,

    /// Bound on one full rule-list fetch
    #[serde(rename = "sync_timeout_ms", with = "crate::config::millis")]
    pub sync_timeout: Duration,

    /// How long startup waits for the first snapshot
    #[serde(rename = "startup_grace_ms", with = "crate::config::millis")]
    pub startup_grace: Duration,

    pub stale_policy: StalePolicyMode,

    /// Snapshot age after which `fail_closed` stops trusting it
    #[serde(rename = "max_staleness_ms", with = "crate::config::millis")]
    pub max_staleness: Duration,
}

impl Default for PolicySyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_secs(10),
            stale_policy: StalePolicyMode::ServeStale,
            max_staleness: Duration::from_secs(300),
        }
    }
}

/// Result of one refresh, returned to on-demand callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncOutcome {
    Updated { version: u64, rules: usize },
    Failed { error: String, retained_version: u64 },
}

impl SyncOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, SyncOutcome::Updated { .. })
    }
}

/// Store health for `/health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStoreStatus {
    pub version: u64,
    pub rules: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub stale: bool,
}

#[derive(Debug, Default)]
struct SyncState {
    last_success: Option<DateTime<Utc>>,
    last_success_at: Option<Instant>,
    last_attempt_failed: bool,
    last_error: Option<String>,
    consecutive_failures: u64,
    total_failures: u64,
}

/// Versioned, atomically swapped rule snapshot fed by the identity service
pub struct PolicyStore {
    source: Arc<dyn IdentityClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: Arc<RetryPolicy>,
    pool: Arc<WorkerPool>,
    service_name: String,
    config: PolicySyncConfig,
    metrics: Arc<GatewayMetrics>,
    snapshot_tx: watch::Sender<Arc<PolicySnapshot>>,
    state: Mutex<SyncState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PolicyStore {
    pub fn new(
        source: Arc<dyn IdentityClient>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: Arc<RetryPolicy>,
        pool: Arc<WorkerPool>,
        service_name: impl Into<String>,
        config: PolicySyncConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(PolicySnapshot::empty()));

        Self {
            source,
            breakers,
            retry,
            pool,
            service_name: service_name.into(),
            config,
            metrics,
            snapshot_tx,
            state: Mutex::new(SyncState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver notified on every swap
    pub fn subscribe(&self) -> watch::Receiver<Arc<PolicySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn match_request(&self, method: &str, path: &str) -> Verdict {
        self.snapshot().match_request(method, path)
    }

    /// Fetch the full rule list and swap in a new snapshot
    ///
    /// Never fails: errors are recorded, logged and reported in the outcome while
    /// the previous snapshot keeps serving. Concurrent refreshes run one at a time.
    pub async fn refresh(&self) -> SyncOutcome {
        let _serialized = self.refresh_lock.lock().await;
        let started = Instant::now();

        match self.fetch_snapshot().await {
            Ok(snapshot) => {
                let version = snapshot.version();
                let rules = snapshot.len();
                self.snapshot_tx.send_replace(Arc::new(snapshot));

                {
                    let mut state = self.state.lock();
                    state.last_success = Some(Utc::now());
                    state.last_success_at = Some(Instant::now());
                    state.last_attempt_failed = false;
                    state.last_error = None;
                    state.consecutive_failures = 0;
                }

                self.metrics.record_sync(true);
                self.metrics.policy_rules.set(rules as i64);
                self.metrics.policy_version.set(version as i64);
                info!(
                    version,
                    rules,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Policy snapshot updated"
                );

                SyncOutcome::Updated { version, rules }
            }
            Err(err) => {
                let failure = AuthzError::PolicySyncFailure(err.to_string());
                let retained_version = self.snapshot().version();

                let consecutive = {
                    let mut state = self.state.lock();
                    state.last_attempt_failed = true;
                    state.last_error = Some(err.to_string());
                    state.consecutive_failures += 1;
                    state.total_failures += 1;
                    state.consecutive_failures
                };

                self.metrics.record_sync(false);
                warn!(
                    error = %failure,
                    retained_version,
                    consecutive_failures = consecutive,
                    "Policy sync failed, keeping previous snapshot"
                );

                SyncOutcome::Failed {
                    error: err.to_string(),
                    retained_version,
                }
            }
        }
    }

    async fn fetch_snapshot(&self) -> Result<PolicySnapshot> {
        let source = self.source.clone();
        let breaker = self.breakers.breaker(&self.service_name);
        let retry = self.retry.clone();
        let limit = self.config.sync_timeout;

        let rules = self
            .pool
            .run(async move {
                let (source, breaker) = (&source, &breaker);
                retry
                    .run("policies", move || breaker.call(limit, move || source.list_policies()))
                    .await
            })
            .await?;

        debug!(received = rules.len(), "Building policy snapshot");
        let next_version = self.snapshot().version() + 1;
        PolicySnapshot::build(next_version, rules)
    }

    /// Wait until the first snapshot is in place or `grace` elapses
    pub async fn wait_ready(&self, grace: Duration) -> bool {
        let mut rx = self.snapshot_tx.subscribe();
        let ready = tokio::time::timeout(grace, rx.wait_for(|snapshot| snapshot.version() > 0)).await;
        matches!(ready, Ok(Ok(_)))
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().version() > 0
    }

    /// Whether the current snapshot is no longer known to be current
    pub fn is_stale(&self) -> bool {
        let state = self.state.lock();
        let too_old = match state.last_success_at {
            Some(at) => at.elapsed() > self.config.max_staleness,
            None => true,
        };
        state.last_attempt_failed || too_old
    }

    /// True when `fail_closed` is configured and the snapshot cannot be trusted
    pub fn policy_unavailable(&self) -> bool {
        self.config.stale_policy == StalePolicyMode::FailClosed && self.is_stale()
    }

    pub fn status(&self) -> PolicyStoreStatus {
        let snapshot = self.snapshot();
        let stale = self.is_stale();
        let state = self.state.lock();

        PolicyStoreStatus {
            version: snapshot.version(),
            rules: snapshot.len(),
            last_success: state.last_success,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            stale,
        }
    }

    pub fn config(&self) -> &PolicySyncConfig {
        &self.config
    }
}

/// Background loop refreshing the store on a fixed interval
pub struct PolicySyncer {
    store: Arc<PolicyStore>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl PolicySyncer {
    pub fn new(store: Arc<PolicyStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the loop; the first refresh runs immediately
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "Policy sync loop started");

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("Policy sync loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcome = self.store.refresh().await;
                        debug!(?outcome, "Scheduled policy sync finished");
                    }
                }
            }
        })
    }
}
