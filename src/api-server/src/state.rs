use gateguard_authz::GatewayRuntime;
use std::sync::Arc;
use std::time::Instant;

use crate::server::ServerConfig;

/// Application state shared across handlers
pub struct AppState {
    /// Engine components
    pub runtime: Arc<GatewayRuntime>,

    /// HTTP settings (cookie flags, internal API key)
    pub server: ServerConfig,

    /// Server start time for uptime calculation
    pub start_time: Instant,

    /// Application version
    pub version: String,
}

impl AppState {
    pub fn new(runtime: Arc<GatewayRuntime>, server: ServerConfig) -> Self {
        Self {
            runtime,
            server,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
