//! Shared cache tier interface and the in-process backend

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::{AuthzError, Result};

/// Key/value tier shared by every gateway instance
///
/// Values are opaque strings (JSON documents); expiry is owned by the backend.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Overwrite an existing value keeping its remaining TTL; `false` if absent
    async fn replace(&self, key: &str, value: &str) -> Result<bool>;

    /// Remove a value; `true` if it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically add one to a counter, creating it with `ttl` when absent
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;
}

/// Process-local backend for single-instance deployments and tests
#[derive(Default)]
pub struct InMemoryDistributedCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Ok(Some(value.clone()));
            }
        }

        self.entries
            .remove_if(key, |_, (_, expires_at)| Instant::now() >= *expires_at);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) if Instant::now() < entry.1 => {
                entry.0 = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(key)
            .map(|(_, (_, expires_at))| Instant::now() < expires_at)
            .unwrap_or(false))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| ("0".to_string(), now + ttl));
        if now >= entry.1 {
            *entry = ("0".to_string(), now + ttl);
        }

        let next = entry
            .0
            .parse::<u64>()
            .map_err(|_| AuthzError::CacheError(format!("{} does not hold a counter", key)))?
            + 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
