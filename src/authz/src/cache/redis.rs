//! Redis-backed distributed tier

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use super::distributed::DistributedCache;
use crate::error::{AuthzError, Result};

/// Backoff for (re)connecting: `factor * base^n` ms over `RECONNECT_RETRIES` tries
const RECONNECT_BASE: u64 = 2;
const RECONNECT_FACTOR_MS: u64 = 50;
const RECONNECT_RETRIES: usize = 3;

/// Redis cache over a lazily opened, self-reconnecting connection
///
/// The manager re-establishes the multiplexed connection after an I/O error.
pub struct RedisDistributedCache {
    client: redis::Client,
    prefix: Option<String>,
    connection: OnceCell<ConnectionManager>,
}

impl RedisDistributedCache {
    /// Create a client; no connection is made until first use
    pub fn new(url: &str, prefix: Option<&str>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AuthzError::Config(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
            connection: OnceCell::new(),
        })
    }

    /// Build a full key with prefix.
    fn key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }

    /// Shared connection manager; a failed first connect is retried on the next call
    async fn connection(&self) -> Result<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening redis connection");
                ConnectionManager::new_with_backoff(
                    self.client.clone(),
                    RECONNECT_BASE,
                    RECONNECT_FACTOR_MS,
                    RECONNECT_RETRIES,
                )
                .await
                .map_err(AuthzError::from)
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let millis = (ttl.as_millis() as u64).max(1);
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(key = key, ttl_ms = millis, "Redis cache set");
        Ok(())
    }

    async fn replace(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        debug!(key = key, removed, "Redis cache delete");
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("PEXPIRE")
                .arg(&key)
                .arg((ttl.as_millis() as u64).max(1))
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(count)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
