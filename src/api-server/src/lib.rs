//! Gateguard HTTP surface
//!
//! Axum router exposing sessions, health, metrics and internal maintenance
//! endpoints, with a middleware that authorizes every other request through the
//! decision pipeline.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, Result};
pub use server::{AppConfig, Server, ServerBuilder, ServerConfig};
pub use state::AppState;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "SESSION_ID";

/// Header alternative to the session cookie
pub const SESSION_HEADER: &str = "x-session-id";

/// Header carrying the permission that admitted a protected request
pub const AUTHZ_PERMISSION_HEADER: &str = "x-authz-perm";

/// Header carrying the authenticated subject to downstream handlers
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header carrying the internal API key
pub const INTERNAL_KEY_HEADER: &str = "x-internal-api-key";
