//! Cache tiers
//!
//! ```text
//! resolve ─▶ LocalTier (per instance, bounded, short TTL)
//!               │ miss
//!               ▼
//!            DistributedCache (shared: Redis or in-memory, long TTL)
//! ```

pub mod distributed;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

pub use distributed::{DistributedCache, InMemoryDistributedCache};
pub use local::{LocalTier, LocalTierStats, Lookup};
#[cfg(feature = "redis")]
pub use self::redis::RedisDistributedCache;

#[cfg(not(feature = "redis"))]
use crate::error::AuthzError;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Distributed tier backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributedBackend {
    Redis,
    Memory,
}

/// Distributed tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub backend: DistributedBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Optional namespace prepended to every key
    pub key_prefix: Option<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            backend: DistributedBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: None,
        }
    }
}

/// Build the configured distributed tier
pub fn build_distributed(config: &DistributedConfig) -> Result<Arc<dyn DistributedCache>> {
    match config.backend {
        DistributedBackend::Memory => {
            info!("Using in-memory distributed tier");
            Ok(Arc::new(InMemoryDistributedCache::new()))
        }
        #[cfg(feature = "redis")]
        DistributedBackend::Redis => {
            info!(url = %config.redis_url, "Using redis distributed tier");
            Ok(Arc::new(RedisDistributedCache::new(
                &config.redis_url,
                config.key_prefix.as_deref(),
            )?))
        }
        #[cfg(not(feature = "redis"))]
        DistributedBackend::Redis => Err(AuthzError::Config(
            "redis backend requested but the `redis` feature is disabled".into(),
        )),
    }
}
