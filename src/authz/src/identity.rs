//! Client for the identity/policy service
//!
//! The gateway only ever asks three questions: the active rule list, the permission
//! codes of a user and the role names of a user.

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{AuthzError, Result};
use crate::types::EndpointProtection;

/// Identity service operations consumed by the engine
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// All endpoint protection rules (filtering happens in the policy store)
    async fn list_policies(&self) -> Result<Vec<EndpointProtection>>;

    async fn permission_codes(&self, subject: &str) -> Result<Vec<String>>;

    async fn role_names(&self, subject: &str) -> Result<Vec<String>>;
}

/// Identity service connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL of the identity service
    pub base_url: String,

    /// Name of the circuit breaker guarding the identity service
    pub service_name: String,

    pub policies_path: String,
    pub permissions_path: String,
    pub roles_path: String,

    /// Header carrying the internal API key
    pub api_key_header: String,

    /// Internal API key, sent only when set
    pub api_key: Option<String>,

    /// Bound on one permission fetch-through (both calls)
    #[serde(rename = "fetch_timeout_ms", with = "crate::config::millis")]
    pub fetch_timeout: Duration,

    #[serde(rename = "connect_timeout_ms", with = "crate::config::millis")]
    pub connect_timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            service_name: "identity-service".to_string(),
            policies_path: "/api/internal/policies".to_string(),
            permissions_path: "/api/internal/permissions/user".to_string(),
            roles_path: "/api/internal/roles/keycloak".to_string(),
            api_key_header: "X-Internal-Api-Key".to_string(),
            api_key: None,
            fetch_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// HTTP implementation backed by `reqwest`
pub struct HttpIdentityClient {
    client: reqwest::Client,
    base_url: Url,
    config: IdentityConfig,
}

impl HttpIdentityClient {
    pub fn new(config: IdentityConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AuthzError::Config(format!("identity.base_url: {}", e)))?;

        if base_url.cannot_be_a_base() {
            return Err(AuthzError::Config(format!(
                "identity.base_url is not a base URL: {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AuthzError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Join path segments onto the base URL, encoding each segment
    fn url(&self, path: &str, subject: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AuthzError::Config("identity.base_url cannot take a path".into()))?;
            segments.pop_if_empty();
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
            if let Some(subject) = subject {
                segments.push(subject);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.config.api_key {
            request = request.header(self.config.api_key_header.as_str(), key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthzError::Upstream(format!(
                "{} answered {} for {}",
                self.config.service_name,
                status,
                url.path()
            )));
        }

        response.json::<T>().await.map_err(|e| {
            AuthzError::Upstream(format!("malformed payload from {}: {}", url.path(), e))
        })
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn list_policies(&self) -> Result<Vec<EndpointProtection>> {
        let url = self.url(&self.config.policies_path, None)?;
        let rules: Vec<EndpointProtection> = self.get_json(url).await?;
        debug!(count = rules.len(), "Fetched endpoint protection rules");
        Ok(rules)
    }

    async fn permission_codes(&self, subject: &str) -> Result<Vec<String>> {
        let url = self.url(&self.config.permissions_path, Some(subject))?;
        self.get_json(url).await
    }

    async fn role_names(&self, subject: &str) -> Result<Vec<String>> {
        let url = self.url(&self.config.roles_path, Some(subject))?;
        self.get_json(url).await
    }
}
