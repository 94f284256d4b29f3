//! Gateguard server binary
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings (0.0.0.0:8080, in-memory distributed tier)
//! cargo run --bin gateguard
//!
//! # Load a configuration file and override the port
//! cargo run --bin gateguard -- --config gateguard.yaml --port 9090
//!
//! # Enable debug logging
//! RUST_LOG=debug cargo run --bin gateguard
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Log filter (trace, debug, info, warn, error)
//! - `GATEGUARD_CONFIG`: Path to the YAML configuration file
//! - `GATEGUARD_HOST` / `GATEGUARD_PORT`: Listen address
//! - `GATEGUARD_IDENTITY_URL`: Identity service base URL
//! - `GATEGUARD_DISTRIBUTED_BACKEND` / `GATEGUARD_REDIS_URL`: Distributed tier
//! - `GATEGUARD_INTERNAL_API_KEY`: Key required on `/internal/*`
//! - `GATEGUARD_JWT_SECRET`: HS256 secret used to verify access tokens

use anyhow::{Context, Result};
use api_server::{AppConfig, ServerBuilder};
use clap::{Parser, ValueEnum};
use gateguard_authz::cache::DistributedBackend;
use gateguard_authz::GatewayRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Gateguard edge authorization gateway
#[derive(Parser, Debug)]
#[command(
    name = "gateguard",
    version,
    about = "Edge authorization and resilience gateway",
    long_about = None
)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "GATEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'H', long, env = "GATEGUARD_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "GATEGUARD_PORT")]
    port: Option<u16>,

    /// Request timeout in seconds
    #[arg(long, env = "GATEGUARD_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Identity service base URL
    #[arg(long, env = "GATEGUARD_IDENTITY_URL")]
    identity_url: Option<String>,

    /// Distributed tier backend (redis or memory)
    #[arg(long, env = "GATEGUARD_DISTRIBUTED_BACKEND", value_parser = parse_backend)]
    distributed_backend: Option<DistributedBackend>,

    /// Redis connection URL
    #[arg(long, env = "GATEGUARD_REDIS_URL")]
    redis_url: Option<String>,

    /// Key required on internal endpoints
    #[arg(long, env = "GATEGUARD_INTERNAL_API_KEY", hide_env_values = true)]
    internal_api_key: Option<String>,

    /// HS256 secret for access token verification
    #[arg(long, env = "GATEGUARD_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Issue session cookies without the Secure flag (local development)
    #[arg(long, env = "GATEGUARD_INSECURE_COOKIES")]
    insecure_cookies: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "GATEGUARD_LOG_FORMAT")]
    log_format: LogFormat,

    /// Log level used when RUST_LOG is not set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_backend(value: &str) -> std::result::Result<DistributedBackend, String> {
    match value.to_ascii_lowercase().as_str() {
        "redis" => Ok(DistributedBackend::Redis),
        "memory" => Ok(DistributedBackend::Memory),
        other => Err(format!("unknown backend '{}', expected redis or memory", other)),
    }
}

impl Args {
    /// Load the configuration file (if any) and apply command line overrides
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::default(),
        };

        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(timeout) = self.request_timeout {
            config.server.request_timeout = timeout;
        }
        if let Some(key) = &self.internal_api_key {
            config.server.internal_api_key = Some(key.clone());
            config.gateway.identity.api_key = Some(key.clone());
        }
        if self.insecure_cookies {
            config.server.cookie_secure = false;
        }
        if let Some(url) = &self.identity_url {
            config.gateway.identity.base_url = url.clone();
        }
        if let Some(backend) = self.distributed_backend {
            config.gateway.distributed.backend = backend;
        }
        if let Some(url) = &self.redis_url {
            config.gateway.distributed.redis_url = url.clone();
        }
        if let Some(secret) = &self.jwt_secret {
            config.gateway.session.jwt_secret = Some(secret.clone());
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config()?;
    let runtime = GatewayRuntime::from_config(config.gateway)
        .context("Failed to initialize the authorization engine")?;

    let server = ServerBuilder::new()
        .config(config.server)
        .runtime(Arc::new(runtime))
        .build()?;

    info!("Press Ctrl+C to shutdown gracefully");

    if let Err(e) = server.run().await {
        error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize tracing/logging subsystem
fn init_tracing(args: &Args) -> Result<()> {
    let log_level = args.log_level.parse::<tracing::Level>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', using 'info'", args.log_level);
        tracing::Level::INFO
    });

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "gateguard={lvl},api_server={lvl},gateguard_authz={lvl},tower_http={http}",
            lvl = log_level,
            http = if log_level <= tracing::Level::DEBUG { "debug" } else { "info" },
        )
        .into()
    });

    if args.log_format == LogFormat::Json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(vec![
            "gateguard",
            "--host",
            "127.0.0.1",
            "--port",
            "9090",
            "--request-timeout",
            "60",
            "--distributed-backend",
            "redis",
        ]);

        assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(args.port, Some(9090));
        assert_eq!(args.request_timeout, Some(60));
        assert_eq!(args.distributed_backend, Some(DistributedBackend::Redis));
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_overrides_apply_to_defaults() {
        let args = Args::parse_from(vec![
            "gateguard",
            "--port",
            "9191",
            "--identity-url",
            "http://iam:9000",
            "--internal-api-key",
            "secret",
            "--insecure-cookies",
        ]);
        let config = args.load_config().unwrap();

        assert_eq!(config.server.port, 9191);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(!config.server.cookie_secure);
        assert_eq!(config.server.internal_api_key.as_deref(), Some("secret"));
        assert_eq!(config.gateway.identity.api_key.as_deref(), Some("secret"));
        assert_eq!(config.gateway.identity.base_url, "http://iam:9000");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = Args::try_parse_from(vec!["gateguard", "--distributed-backend", "etcd"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_json_logs() {
        let args = Args::parse_from(vec!["gateguard", "--log-format", "json"]);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_args_log_level() {
        let args = Args::parse_from(vec!["gateguard", "--log-level", "debug"]);
        assert_eq!(args.log_level, "debug");
    }
}
