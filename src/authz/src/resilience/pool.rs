//! Bounded worker pool (bulkhead)
//!
//! Caps how many upstream-bound tasks run at once. Admission waits at most
//! `max_wait` for a permit, then the task runs as its own tokio task so a
//! caller that stops waiting does not cancel it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Tasks allowed to run concurrently
    pub max_concurrent: usize,

    /// Longest a task may queue for a permit before `Overloaded`
    #[serde(rename = "max_wait_ms", with = "crate::config::millis")]
    pub max_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_wait: Duration::from_secs(1),
        }
    }
}

pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    capacity: usize,
    max_wait: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: &PoolConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            capacity: config.max_concurrent,
            max_wait: config.max_wait,
            metrics,
        }
    }

    /// Run a task on the pool and wait for its result
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match tokio::time::timeout(self.max_wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(AuthzError::Internal(format!("worker pool {} is closed", self.name)));
            }
            Err(_) => {
                warn!(pool = %self.name, max_wait = ?self.max_wait, "Worker pool saturated");
                self.metrics
                    .pool_rejections
                    .with_label_values(&[self.name.as_str()])
                    .inc();
                return Err(AuthzError::Overloaded(format!(
                    "{} pool had no free worker within {:?}",
                    self.name, self.max_wait
                )));
            }
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        handle
            .await
            .map_err(|e| AuthzError::Internal(format!("{} worker task failed: {}", self.name, e)))?
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn pool(max_concurrent: usize, max_wait: Duration) -> WorkerPool {
        WorkerPool::new(
            "test",
            &PoolConfig {
                max_concurrent,
                max_wait,
            },
            Arc::new(GatewayMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_runs_task_and_returns_result() {
        let pool = pool(2, Duration::from_millis(100));
        let value = pool.run(async { Ok::<_, AuthzError>(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_propagates_task_error() {
        let pool = pool(1, Duration::from_millis(100));
        let result = pool
            .run(async { Err::<(), _>(AuthzError::Upstream("down".into())) })
            .await;
        assert!(matches!(result, Err(AuthzError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_saturation_returns_overloaded() {
        let pool = Arc::new(pool(1, Duration::from_millis(50)));

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.run(async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, AuthzError>(())
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = pool.run(async { Ok::<_, AuthzError>(()) }).await;
        assert!(matches!(result, Err(AuthzError::Overloaded(_))));
        assert!(busy.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = Arc::new(pool(3, Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..12).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.run(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, AuthzError>(())
                })
                .await
            }
        });

        let results = futures::future::join_all(tasks).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_task() {
        let pool = pool(1, Duration::from_millis(100));
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let waiting = pool.run(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, AuthzError>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), waiting).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
