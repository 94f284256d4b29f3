//! Resilience primitives guarding every upstream call
//!
//! - [`CircuitBreaker`] per downstream name, kept in a [`CircuitBreakerRegistry`]
//! - [`WorkerPool`] bounding concurrent upstream-bound work
//! - [`RetryPolicy`] re-running failed identity calls through the breaker
//! - [`RateLimiter`] counting requests per principal in the distributed tier

pub mod circuit_breaker;
pub mod pool;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitState, CircuitStats,
};
pub use pool::{PoolConfig, WorkerPool};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitKey, RateLimitTier, RateLimiter};
pub use retry::{RetryConfig, RetryPolicy};
