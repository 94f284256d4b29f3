//! # Gateguard Authorization Engine
//!
//! Edge authorization and resilience for an API gateway.
//!
//! ## Features
//!
//! - **Policy snapshots** synced from the identity service and swapped atomically
//! - **Path matching** with `*`/`**` patterns and deterministic precedence
//! - **Two-tier permission cache** (local + Redis) with request coalescing
//! - **Circuit breakers**, retries and a bounded worker pool around every upstream call
//! - **Per-principal rate limiting** shared across instances
//! - **Downstream health aggregation**
//! - **Server-side sessions** keyed by opaque ids
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateguard_authz::{AuthRequest, GatewayConfig, GatewayRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = GatewayRuntime::from_config(GatewayConfig::default())?;
//!     runtime.policies.refresh().await;
//!
//!     let request = AuthRequest::new("GET", "/api/orders/42").with_subject("user-1");
//!     let decision = runtime.pipeline.authorize(&request).await;
//!
//!     if decision.is_allowed() {
//!         println!("Access granted!");
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod identity;
pub mod policy;
pub mod resilience;
pub mod resolver;
pub mod runtime;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use engine::{
    AllowBasis, AuthDecision, AuthRequest, Decision, DecisionPipeline, DenyReason, GatewayMetrics,
    PipelineConfig, PolicyEffect,
};
pub use error::{AuthzError, Result};
pub use health::{AggregateHealth, HealthAggregator, HealthStatus, ServiceHealth};
pub use identity::{HttpIdentityClient, IdentityClient};
pub use policy::{PolicySnapshot, PolicyStore, SyncOutcome, Verdict};
pub use resilience::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitState, RateLimiter, RetryPolicy, WorkerPool,
};
pub use resolver::{PermissionResolver, PermissionSource, ResolvedPermissions};
pub use runtime::GatewayRuntime;
pub use session::{Session, SessionManager};
pub use types::{EndpointProtection, PrincipalPermissionSet};

/// Version of the engine crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
