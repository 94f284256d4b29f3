//! HTTP server setup and lifecycle management
//!
//! This module handles:
//! - Server and file configuration
//! - Engine start-up (first policy sync within the grace period)
//! - Graceful shutdown on signals (SIGTERM, SIGINT)

use crate::{routes, state::AppState};
use anyhow::{Context, Result};
use gateguard_authz::{GatewayConfig, GatewayRuntime};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout in seconds
    pub request_timeout: u64,
    /// Required value of `X-Internal-Api-Key` on `/internal/*`; open when unset
    pub internal_api_key: Option<String>,
    /// `Secure` flag on the session cookie
    pub cookie_secure: bool,
    /// Take the anonymous client address from `X-Forwarded-For` (behind a trusted proxy)
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: 30,
            internal_api_key: None,
            cookie_secure: true,
            trust_forwarded_for: false,
        }
    }
}

/// Configuration file layout: engine sections plus `server`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(flatten)]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Load a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// HTTP server instance
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Start the server and block until shutdown signal
    ///
    /// This function:
    /// 1. Starts the background policy sync and waits for the first snapshot
    /// 2. Creates a TCP listener
    /// 3. Serves requests until SIGTERM or SIGINT
    /// 4. Stops the sync loop
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let runtime = self.state.runtime.clone();

        info!("Starting Gateguard");
        info!(host = %self.config.host, port = self.config.port, "Configuration loaded");

        let (sync_handle, sync_shutdown) = runtime.spawn_policy_sync();
        let grace = runtime.config.policy.startup_grace;
        if runtime.policies.wait_ready(grace).await {
            info!(version = runtime.policies.snapshot().version(), "Initial policy snapshot loaded");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "No policy snapshot within the startup grace period, serving with an empty rule set"
            );
        }

        // Create TCP listener
        let listener = TcpListener::bind(&addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        let local_addr = listener.local_addr()?;
        info!("Server listening on http://{}", local_addr);
        info!("Health check endpoint: http://{}/health", local_addr);
        info!("Metrics endpoint: http://{}/metrics", local_addr);

        let app = routes::create_router(self.state.clone());

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error");

        sync_shutdown.cancel();
        if let Err(e) = sync_handle.await {
            warn!(error = %e, "Policy sync task ended abnormally");
        }

        served?;
        info!("Server shutdown complete");
        Ok(())
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the application state
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }
}

/// Wait for shutdown signal
///
/// Listens for:
/// - SIGTERM (kill command, docker stop, kubernetes)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }

    info!("Shutdown signal received, waiting for active connections to close...");
}

/// Builder for creating a server with custom configuration
pub struct ServerBuilder {
    config: ServerConfig,
    runtime: Option<Arc<GatewayRuntime>>,
}

impl ServerBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            runtime: None,
        }
    }

    /// Replace the whole server configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the host to bind to
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port to listen on
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the request timeout in seconds
    pub fn request_timeout(mut self, timeout: u64) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the engine runtime
    pub fn runtime(mut self, runtime: Arc<GatewayRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the server
    pub fn build(self) -> Result<Server> {
        let runtime = self
            .runtime
            .context("Engine runtime is required")?;

        let state = Arc::new(AppState::new(runtime, self.config.clone()));
        Ok(Server::new(self.config, state))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
