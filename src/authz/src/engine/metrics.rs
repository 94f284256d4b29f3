//! Prometheus metrics for the authorization engine
//!
//! One registry per engine instance; the HTTP layer renders it at `/metrics`.

use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

const NAMESPACE: &str = "gateguard";

/// Engine metrics exposed to Prometheus
pub struct GatewayMetrics {
    /// Decisions by outcome (allow/deny) and basis or reason
    pub decisions: IntCounterVec,

    /// End-to-end decision latency in seconds
    pub decision_latency: Histogram,

    /// Policy sync attempts by result
    pub policy_syncs: IntCounterVec,

    /// Rules in the current snapshot
    pub policy_rules: IntGauge,

    /// Version of the current snapshot
    pub policy_version: IntGauge,

    /// Permission lookups by answering source
    pub permission_lookups: IntCounterVec,

    /// Distributed tier errors by operation
    pub distributed_errors: IntCounterVec,

    /// Breaker state per downstream (0=closed, 1=open, 2=half-open)
    pub breaker_state: IntGaugeVec,

    /// Breaker-guarded calls by downstream and outcome
    pub breaker_calls: IntCounterVec,

    /// Breaker state transitions by downstream and target state
    pub breaker_transitions: IntCounterVec,

    /// Guarded call latency in seconds
    pub breaker_call_duration: HistogramVec,

    /// Tasks refused by a saturated worker pool
    pub pool_rejections: IntCounterVec,

    /// Session operations by operation and result
    pub session_operations: IntCounterVec,

    /// Health probes by downstream and status
    pub health_probes: IntCounterVec,

    /// Retried identity service calls by operation
    pub retries: IntCounterVec,

    /// Rate limit checks by tier and result
    pub rate_limit_decisions: IntCounterVec,

    registry: Registry,
}

impl GatewayMetrics {
    /// Create and register all engine metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let decisions = counter_vec(
            &registry,
            "authz_decisions_total",
            "Authorization decisions",
            &["outcome", "reason"],
        )?;

        let decision_latency = Histogram::with_opts(
            HistogramOpts::new("authz_decision_duration_seconds", "Decision latency")
                .namespace(NAMESPACE)
                .buckets(vec![
                    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ]),
        )?;
        registry.register(Box::new(decision_latency.clone()))?;

        let policy_syncs = counter_vec(
            &registry,
            "policy_syncs_total",
            "Policy sync attempts",
            &["result"],
        )?;

        let policy_rules = IntGauge::with_opts(
            Opts::new("policy_rules", "Rules in the active snapshot").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(policy_rules.clone()))?;

        let policy_version = IntGauge::with_opts(
            Opts::new("policy_snapshot_version", "Version of the active snapshot")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(policy_version.clone()))?;

        let permission_lookups = counter_vec(
            &registry,
            "permission_lookups_total",
            "Permission lookups by answering source",
            &["source"],
        )?;

        let distributed_errors = counter_vec(
            &registry,
            "distributed_cache_errors_total",
            "Distributed tier errors",
            &["operation"],
        )?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            )
            .namespace(NAMESPACE),
            &["service"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let breaker_calls = counter_vec(
            &registry,
            "circuit_breaker_calls_total",
            "Guarded calls by outcome",
            &["service", "outcome"],
        )?;

        let breaker_transitions = counter_vec(
            &registry,
            "circuit_breaker_transitions_total",
            "Circuit breaker state transitions",
            &["service", "to"],
        )?;

        let breaker_call_duration = HistogramVec::new(
            HistogramOpts::new("circuit_breaker_call_duration_seconds", "Guarded call latency")
                .namespace(NAMESPACE),
            &["service"],
        )?;
        registry.register(Box::new(breaker_call_duration.clone()))?;

        let pool_rejections = counter_vec(
            &registry,
            "worker_pool_rejections_total",
            "Tasks refused by a saturated worker pool",
            &["pool"],
        )?;

        let session_operations = counter_vec(
            &registry,
            "session_operations_total",
            "Session operations",
            &["operation", "result"],
        )?;

        let health_probes = counter_vec(
            &registry,
            "health_probes_total",
            "Downstream health probes",
            &["service", "status"],
        )?;

        let retries = counter_vec(
            &registry,
            "upstream_retries_total",
            "Retried identity service calls",
            &["operation"],
        )?;

        let rate_limit_decisions = counter_vec(
            &registry,
            "rate_limit_decisions_total",
            "Rate limit checks",
            &["tier", "result"],
        )?;

        Ok(Self {
            decisions,
            decision_latency,
            policy_syncs,
            policy_rules,
            policy_version,
            permission_lookups,
            distributed_errors,
            breaker_state,
            breaker_calls,
            breaker_transitions,
            breaker_call_duration,
            pool_rejections,
            session_operations,
            health_probes,
            retries,
            rate_limit_decisions,
            registry,
        })
    }

    pub fn record_decision(&self, outcome: &str, reason: &str, latency: Duration) {
        self.decisions.with_label_values(&[outcome, reason]).inc();
        self.decision_latency.observe(latency.as_secs_f64());
    }

    pub fn record_sync(&self, succeeded: bool) {
        let result = if succeeded { "success" } else { "failure" };
        self.policy_syncs.with_label_values(&[result]).inc();
    }

    pub fn record_lookup(&self, source: &str) {
        self.permission_lookups.with_label_values(&[source]).inc();
    }

    pub fn record_distributed_error(&self, operation: &str) {
        self.distributed_errors.with_label_values(&[operation]).inc();
    }

    pub fn record_session(&self, operation: &str, result: &str) {
        self.session_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    /// Value of a labelled counter, zero when never touched
    pub fn counter_value(&self, counter: &IntCounterVec, labels: &[&str]) -> u64 {
        counter.with_label_values(labels).get()
    }

    /// Registry backing these metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| crate::error::AuthzError::Internal(format!("metrics encoding: {}", e)))
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
