//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use gateguard_authz::cache::{DistributedCache, InMemoryDistributedCache};
use gateguard_authz::error::{AuthzError, Result};
use gateguard_authz::health::HealthProbe;
use gateguard_authz::{EndpointProtection, GatewayConfig, GatewayRuntime, IdentityClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable identity service
#[derive(Default)]
pub struct MockIdentity {
    rules: Mutex<Vec<EndpointProtection>>,
    permissions: Mutex<HashMap<String, Vec<String>>>,
    roles: Mutex<HashMap<String, Vec<String>>>,
    delay: Mutex<Duration>,
    pub fail_policies: AtomicBool,
    pub fail_permissions: AtomicBool,
    /// Permission calls still to fail before answering normally
    pub flaky_permissions: AtomicUsize,
    pub policy_calls: AtomicUsize,
    pub permission_calls: AtomicUsize,
}

impl MockIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rules(&self, rules: Vec<EndpointProtection>) {
        *self.rules.lock() = rules;
    }

    pub fn grant(&self, subject: &str, permissions: &[&str]) {
        self.permissions.lock().insert(
            subject.to_string(),
            permissions.iter().map(|p| p.to_string()).collect(),
        );
        self.roles
            .lock()
            .insert(subject.to_string(), vec!["USER".to_string()]);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_policies(&self, fail: bool) {
        self.fail_policies.store(fail, Ordering::SeqCst);
    }

    pub fn fail_permissions(&self, fail: bool) {
        self.fail_permissions.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `calls` permission lookups
    pub fn fail_next_permissions(&self, calls: usize) {
        self.flaky_permissions.store(calls, Ordering::SeqCst);
    }

    pub fn permission_calls(&self) -> usize {
        self.permission_calls.load(Ordering::SeqCst)
    }

    pub fn policy_calls(&self) -> usize {
        self.policy_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl IdentityClient for MockIdentity {
    async fn list_policies(&self) -> Result<Vec<EndpointProtection>> {
        self.policy_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_policies.load(Ordering::SeqCst) {
            return Err(AuthzError::Upstream("identity service answered 503".into()));
        }
        Ok(self.rules.lock().clone())
    }

    async fn permission_codes(&self, subject: &str) -> Result<Vec<String>> {
        self.permission_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_permissions.load(Ordering::SeqCst) {
            return Err(AuthzError::Upstream("identity service answered 503".into()));
        }
        let flaky = self
            .flaky_permissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if flaky.is_ok() {
            return Err(AuthzError::Upstream("identity service reset the connection".into()));
        }
        Ok(self.permissions.lock().get(subject).cloned().unwrap_or_default())
    }

    async fn role_names(&self, subject: &str) -> Result<Vec<String>> {
        self.pause().await;
        if self.fail_permissions.load(Ordering::SeqCst) {
            return Err(AuthzError::Upstream("identity service answered 503".into()));
        }
        Ok(self.roles.lock().get(subject).cloned().unwrap_or_default())
    }
}

/// Probe that reports every downstream as up
pub struct AlwaysUp;

#[async_trait]
impl HealthProbe for AlwaysUp {
    async fn probe(&self, _url: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "status": "UP" }))
    }
}

/// Rules used across the end-to-end tests
pub fn order_rules() -> Vec<EndpointProtection> {
    vec![
        EndpointProtection::protected("/api/orders/**", "GET", "order:read").with_id("orders-read"),
        EndpointProtection::protected("/api/orders/**", "POST", "order:write").with_id("orders-write"),
        EndpointProtection::public("/auth/**", "*").with_id("auth-public"),
        EndpointProtection::authenticated("/api/profile", "GET").with_id("profile"),
    ]
}

pub fn runtime(config: GatewayConfig, identity: Arc<MockIdentity>) -> GatewayRuntime {
    GatewayRuntime::new(
        config,
        identity,
        Arc::new(InMemoryDistributedCache::new()),
        Arc::new(AlwaysUp),
    )
    .unwrap()
}

pub fn runtime_with_cache(
    config: GatewayConfig,
    identity: Arc<MockIdentity>,
    cache: Arc<dyn DistributedCache>,
) -> GatewayRuntime {
    GatewayRuntime::new(config, identity, cache, Arc::new(AlwaysUp)).unwrap()
}
