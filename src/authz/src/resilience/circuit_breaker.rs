use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};

/// Circuit breaker states following the classic pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all requests pass through
    Closed,
    /// Failing state - reject all requests immediately
    Open,
    /// Testing recovery - allow limited requests to test
    HalfOpen,
}

impl CircuitState {
    pub fn as_metric_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Number of most recent calls the rates are computed over
    pub window_size: usize,
    /// Calls that must be recorded before the rates are evaluated
    pub minimum_calls: usize,
    /// Failure percentage that opens the circuit
    pub failure_rate_threshold: f64,
    /// Slow-call percentage that opens the circuit
    pub slow_call_rate_threshold: f64,
    /// Calls slower than this count as slow
    #[serde(rename = "slow_call_duration_ms", with = "crate::config::millis")]
    pub slow_call_duration: Duration,
    /// Duration to wait before transitioning from Open to HalfOpen
    #[serde(rename = "open_cooldown_ms", with = "crate::config::millis")]
    pub open_cooldown: Duration,
    /// Maximum number of concurrent trial calls in HalfOpen state
    pub half_open_max_calls: usize,
    /// Trial successes needed to close from HalfOpen
    pub success_threshold: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration: Duration::from_secs(2),
            open_cooldown: Duration::from_secs(10),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.minimum_calls == 0 {
            return Err(AuthzError::Config(
                "circuit_breaker window_size and minimum_calls must be positive".into(),
            ));
        }
        if self.minimum_calls > self.window_size {
            return Err(AuthzError::Config(
                "circuit_breaker minimum_calls cannot exceed window_size".into(),
            ));
        }
        let in_range = |rate: f64| rate > 0.0 && rate <= 100.0;
        if !in_range(self.failure_rate_threshold) || !in_range(self.slow_call_rate_threshold) {
            return Err(AuthzError::Config(
                "circuit_breaker rate thresholds must be within (0, 100]".into(),
            ));
        }
        if self.half_open_max_calls == 0 || self.success_threshold == 0 {
            return Err(AuthzError::Config(
                "circuit_breaker half-open limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    failed: bool,
    slow: bool,
}

/// Internal state tracking
#[derive(Debug)]
struct StateData {
    state: CircuitState,
    window: VecDeque<CallOutcome>,
    half_open_in_flight: usize,
    half_open_successes: usize,
    opened_at: Option<Instant>,
    last_state_change: Instant,
}

impl StateData {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(window_size),
            half_open_in_flight: 0,
            half_open_successes: 0,
            opened_at: None,
            last_state_change: Instant::now(),
        }
    }

    fn rates(&self) -> (f64, f64) {
        if self.window.is_empty() {
            return (0.0, 0.0);
        }
        let total = self.window.len() as f64;
        let failed = self.window.iter().filter(|o| o.failed).count() as f64;
        let slow = self.window.iter().filter(|o| o.slow).count() as f64;
        (failed * 100.0 / total, slow * 100.0 / total)
    }
}

#[derive(Debug, Default)]
struct Counters {
    successes: AtomicU64,
    failures: AtomicU64,
    slow_calls: AtomicU64,
    rejected: AtomicU64,
    trips: AtomicU64,
}

/// Ticket handed out by admission; trial tickets hold a half-open slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Circuit breaker for one named downstream
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state_data: RwLock<StateData>,
    counters: Counters,
    metrics: Arc<GatewayMetrics>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, metrics: Arc<GatewayMetrics>) -> Self {
        let name = name.into();
        metrics
            .breaker_state
            .with_label_values(&[name.as_str()])
            .set(CircuitState::Closed.as_metric_value());

        Self {
            state_data: RwLock::new(StateData::new(config.window_size)),
            name,
            config,
            counters: Counters::default(),
            metrics,
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejected immediately with [`AuthzError::CircuitOpen`] while open. The
    /// operation is bounded by `limit`; a timeout is recorded as a failure.
    pub async fn call<F, T, Fut>(&self, limit: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = match self.try_acquire() {
            Some(admission) => admission,
            None => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.observe_call("rejected", None);
                return Err(AuthzError::CircuitOpen(self.name.clone()));
            }
        };

        let mut guard = CallGuard {
            breaker: self,
            admission,
            completed: false,
        };

        let start = Instant::now();
        let result = timeout(limit, f()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(value)) => {
                guard.complete(false, elapsed);
                self.observe_call("success", Some(elapsed));
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.complete(true, elapsed);
                self.observe_call("failure", Some(elapsed));
                Err(e)
            }
            Err(_) => {
                guard.complete(true, elapsed);
                self.observe_call("timeout", Some(elapsed));
                Err(AuthzError::Timeout(format!(
                    "{} did not answer within {:?}",
                    self.name, limit
                )))
            }
        }
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen after cooldown
    fn try_acquire(&self) -> Option<Admission> {
        let mut state = self.state_data.write();

        match state.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = state
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.open_cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return None;
                }
                self.transition_to_half_open(&mut state);
                state.half_open_in_flight = 1;
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight < self.config.half_open_max_calls {
                    state.half_open_in_flight += 1;
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
        }
    }

    fn release_trial(&self) {
        let mut state = self.state_data.write();
        if state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.record_call(false, Duration::ZERO);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.record_call(true, Duration::ZERO);
    }

    /// Record a call outcome with its duration
    pub fn record_call(&self, failed: bool, elapsed: Duration) {
        let slow = elapsed >= self.config.slow_call_duration;
        if failed {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        }
        if slow {
            self.counters.slow_calls.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state_data.write();
        match state.state {
            CircuitState::Closed => {
                state.window.push_back(CallOutcome { failed, slow });
                while state.window.len() > self.config.window_size {
                    state.window.pop_front();
                }

                if state.window.len() >= self.config.minimum_calls {
                    let (failure_rate, slow_rate) = state.rates();
                    if failure_rate >= self.config.failure_rate_threshold
                        || slow_rate >= self.config.slow_call_rate_threshold
                    {
                        warn!(
                            service = %self.name,
                            failure_rate,
                            slow_call_rate = slow_rate,
                            "Circuit breaker tripped"
                        );
                        self.transition_to_open(&mut state);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    self.transition_to_open(&mut state);
                } else {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.config.success_threshold {
                        self.transition_to_closed(&mut state);
                    }
                }
            }
            CircuitState::Open => {
                debug!(service = %self.name, "Outcome recorded while open");
            }
        }
    }

    /// Get current circuit state
    pub fn get_state(&self) -> CircuitState {
        self.state_data.read().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force circuit to open state (for manual control)
    pub fn force_open(&self) {
        let mut state = self.state_data.write();
        if state.state != CircuitState::Open {
            self.transition_to_open(&mut state);
            info!("Circuit breaker for {} manually opened", self.name);
        }
    }

    /// Reset circuit breaker to initial state
    pub fn reset(&self) {
        let mut state = self.state_data.write();
        self.transition_to_closed(&mut state);
        info!("Circuit breaker for {} reset", self.name);
    }

    /// Get statistics about the circuit breaker
    pub fn get_stats(&self) -> CircuitStats {
        let state = self.state_data.read();
        let (failure_rate, slow_call_rate) = state.rates();
        CircuitStats {
            state: state.state,
            failure_rate,
            slow_call_rate,
            buffered_calls: state.window.len(),
            time_in_current_state: state.last_state_change.elapsed(),
            total_successes: self.counters.successes.load(Ordering::Relaxed),
            total_failures: self.counters.failures.load(Ordering::Relaxed),
            total_slow_calls: self.counters.slow_calls.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            total_trips: self.counters.trips.load(Ordering::Relaxed),
        }
    }

    fn observe_call(&self, outcome: &str, elapsed: Option<Duration>) {
        self.metrics
            .breaker_calls
            .with_label_values(&[self.name.as_str(), outcome])
            .inc();
        if let Some(elapsed) = elapsed {
            self.metrics
                .breaker_call_duration
                .with_label_values(&[self.name.as_str()])
                .observe(elapsed.as_secs_f64());
        }
    }

    // State transition helpers
    fn transition_to_open(&self, state: &mut StateData) {
        info!(service = %self.name, from = state.state.as_str(), "Circuit breaker transitioning to OPEN");
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.half_open_in_flight = 0;
        state.half_open_successes = 0;
        state.last_state_change = Instant::now();
        self.counters.trips.fetch_add(1, Ordering::Relaxed);
        self.publish_state(CircuitState::Open);
    }

    fn transition_to_half_open(&self, state: &mut StateData) {
        info!(service = %self.name, "Circuit breaker transitioning to HALF_OPEN");
        state.state = CircuitState::HalfOpen;
        state.window.clear();
        state.half_open_in_flight = 0;
        state.half_open_successes = 0;
        state.last_state_change = Instant::now();
        self.publish_state(CircuitState::HalfOpen);
    }

    fn transition_to_closed(&self, state: &mut StateData) {
        info!(service = %self.name, from = state.state.as_str(), "Circuit breaker transitioning to CLOSED");
        state.state = CircuitState::Closed;
        state.window.clear();
        state.opened_at = None;
        state.half_open_in_flight = 0;
        state.half_open_successes = 0;
        state.last_state_change = Instant::now();
        self.publish_state(CircuitState::Closed);
    }

    fn publish_state(&self, to: CircuitState) {
        self.metrics
            .breaker_state
            .with_label_values(&[self.name.as_str()])
            .set(to.as_metric_value());
        self.metrics
            .breaker_transitions
            .with_label_values(&[self.name.as_str(), to.as_str()])
            .inc();
    }
}

/// Releases a half-open slot if the guarded call is dropped before completing
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    completed: bool,
}

impl CallGuard<'_> {
    fn complete(&mut self, failed: bool, elapsed: Duration) {
        self.completed = true;
        if self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
        self.breaker.record_call(failed, elapsed);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.completed && self.admission == Admission::Trial {
            self.breaker.release_trial();
        }
    }
}

/// Statistics snapshot for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Percentage of failed calls in the current window
    pub failure_rate: f64,
    /// Percentage of slow calls in the current window
    pub slow_call_rate: f64,
    pub buffered_calls: usize,
    pub time_in_current_state: Duration,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_slow_calls: u64,
    pub total_rejected: u64,
    pub total_trips: u64,
}

/// Lazily created breakers sharing one configuration
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Arc<GatewayMetrics>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            metrics,
        }
    }

    /// Breaker for a downstream name, created on first use
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(service = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    name,
                    self.config.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Stats of every breaker created so far, sorted by name
    pub fn snapshot(&self) -> Vec<(String, CircuitStats)> {
        let mut stats: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }
}
