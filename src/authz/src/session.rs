//! Server-side sessions
//!
//! Sessions live in the distributed tier under `session:{id}` with a fixed TTL; the
//! tier's expiry is authoritative. Ids are 256-bit random values and never appear in
//! logs, which use a short BLAKE3 fingerprint instead.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::DistributedCache;
use crate::engine::metrics::GatewayMetrics;
use crate::error::{AuthzError, Result};

const SESSION_ID_BYTES: usize = 32;

/// Length of an encoded session id (32 bytes, unpadded base64url)
const SESSION_ID_LEN: usize = 43;

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a session in the distributed tier
    #[serde(rename = "ttl_secs", with = "crate::config::secs")]
    pub ttl: Duration,

    /// Assumed refresh token lifetime, counted from when it was stored
    #[serde(rename = "refresh_token_lifetime_secs", with = "crate::config::secs")]
    pub refresh_token_lifetime: Duration,

    /// Bound on one distributed-tier round trip
    #[serde(rename = "op_timeout_ms", with = "crate::config::millis")]
    pub op_timeout: Duration,

    /// HS256 secret; signatures are not checked here when unset
    pub jwt_secret: Option<String>,

    /// Expected `aud` claim, checked only when set
    pub jwt_audience: Option<String>,

    /// Clock skew tolerated on `exp`
    pub jwt_leeway_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            refresh_token_lifetime: Duration::from_secs(30 * 24 * 60 * 60),
            op_timeout: Duration::from_millis(500),
            jwt_secret: None,
            jwt_audience: None,
            jwt_leeway_secs: 60,
        }
    }
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub subject_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_access_token_expired(&self) -> bool {
        Utc::now() > self.access_token_expires_at
    }

    /// A session without a refresh token counts as expired
    pub fn is_refresh_token_expired(&self) -> bool {
        match self.refresh_token_expires_at {
            Some(at) => Utc::now() > at,
            None => true,
        }
    }
}

/// Claims read from the access token
#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl AccessClaims {
    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .ok_or_else(|| AuthzError::InvalidToken("exp claim out of range".into()))
    }
}

/// Access token decoder
pub struct TokenDecoder {
    key: DecodingKey,
    validation: Validation,
}

impl TokenDecoder {
    pub fn new(config: &SessionConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.jwt_leeway_secs;

        match &config.jwt_audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }

        let key = match &config.jwt_secret {
            Some(secret) => DecodingKey::from_secret(secret.as_bytes()),
            None => {
                validation.insecure_disable_signature_validation();
                DecodingKey::from_secret(&[])
            }
        };

        Self { key, validation }
    }

    pub fn decode(&self, token: &str) -> Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| AuthzError::InvalidToken(e.to_string()))?;

        if data.claims.sub.trim().is_empty() {
            return Err(AuthzError::InvalidToken("empty sub claim".into()));
        }
        Ok(data.claims)
    }
}

/// Short, non-reversible handle for logging a session id
pub fn fingerprint(session_id: &str) -> String {
    let hash = blake3::hash(session_id.as_bytes());
    hash.to_hex().as_str()[..12].to_string()
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn is_well_formed(session_id: &str) -> bool {
    session_id.len() == SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub struct SessionManager {
    store: Arc<dyn DistributedCache>,
    decoder: TokenDecoder,
    config: SessionConfig,
    metrics: Arc<GatewayMetrics>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn DistributedCache>, config: SessionConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            store,
            decoder: TokenDecoder::new(&config),
            config,
            metrics,
        }
    }

    /// Create a session from the tokens of a completed login
    pub async fn create(&self, access_token: &str, refresh_token: Option<&str>) -> Result<String> {
        let claims = self.decode_or_record("create", access_token)?;
        let now = Utc::now();

        let session = Session {
            subject_id: claims.sub.clone(),
            username: claims.preferred_username.clone(),
            email: claims.email.clone(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(str::to_string),
            access_token_expires_at: claims.expires_at()?,
            refresh_token_expires_at: refresh_token.map(|_| self.refresh_expiry(now)),
            created_at: now,
            updated_at: now,
        };

        let session_id = generate_session_id();
        let payload = serde_json::to_string(&session)?;
        let key = session_key(&session_id);

        let stored = self
            .bounded("create", self.store.set(&key, &payload, self.config.ttl))
            .await;
        self.record("create", &stored);
        stored?;

        info!(
            session = %fingerprint(&session_id),
            subject = %session.subject_id,
            ttl_secs = self.config.ttl.as_secs(),
            "Session created"
        );
        Ok(session_id)
    }

    /// Look up a session; missing, expired and malformed ids are all `SessionNotFound`
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        if !is_well_formed(session_id) {
            self.metrics.record_session("get", "not_found");
            return Err(AuthzError::SessionNotFound);
        }

        let key = session_key(session_id);
        let raw = self.bounded("get", self.store.get(&key)).await;
        let raw = match raw {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.record_session("get", "not_found");
                debug!(session = %fingerprint(session_id), "Session not found");
                return Err(AuthzError::SessionNotFound);
            }
            Err(err) => {
                self.metrics.record_session("get", "error");
                return Err(err);
            }
        };

        let session = serde_json::from_str::<Session>(&raw).map_err(|e| {
            self.metrics.record_session("get", "error");
            warn!(session = %fingerprint(session_id), error = %e, "Stored session is unreadable");
            AuthzError::from(e)
        })?;

        self.metrics.record_session("get", "ok");
        Ok(session)
    }

    /// Swap in refreshed tokens, keeping the session's remaining TTL
    pub async fn update_tokens(
        &self,
        session_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<Session> {
        let mut session = self.get(session_id).await?;
        let claims = self.decode_or_record("update", access_token)?;

        if claims.sub != session.subject_id {
            self.metrics.record_session("update", "error");
            return Err(AuthzError::InvalidToken(
                "refreshed token belongs to a different subject".into(),
            ));
        }

        let now = Utc::now();
        session.access_token = access_token.to_string();
        session.access_token_expires_at = claims.expires_at()?;
        if let Some(refresh) = refresh_token {
            session.refresh_token = Some(refresh.to_string());
            session.refresh_token_expires_at = Some(self.refresh_expiry(now));
        }
        session.username = claims.preferred_username.or(session.username);
        session.email = claims.email.or(session.email);
        session.updated_at = now;

        let payload = serde_json::to_string(&session)?;
        let replaced = self
            .bounded("update", self.store.replace(&session_key(session_id), &payload))
            .await;
        self.record("update", &replaced);

        if !replaced? {
            // expired between the read and the write
            return Err(AuthzError::SessionNotFound);
        }

        info!(session = %fingerprint(session_id), "Session tokens updated");
        Ok(session)
    }

    /// Delete a session; `true` if it existed
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        if !is_well_formed(session_id) {
            self.metrics.record_session("delete", "not_found");
            return Ok(false);
        }

        let deleted = self
            .bounded("delete", self.store.delete(&session_key(session_id)))
            .await;
        self.record("delete", &deleted);
        let existed = deleted?;

        info!(session = %fingerprint(session_id), existed, "Session deleted");
        Ok(existed)
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn refresh_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.refresh_token_lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn decode_or_record(&self, operation: &str, token: &str) -> Result<AccessClaims> {
        self.decoder.decode(token).map_err(|err| {
            self.metrics.record_session(operation, "invalid_token");
            warn!(operation, error = %err, "Rejected access token");
            err
        })
    }

    async fn bounded<T>(&self, operation: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(AuthzError::Timeout(format!(
                "session {} exceeded {:?}",
                operation, self.config.op_timeout
            ))),
        }
    }

    fn record<T>(&self, operation: &str, result: &Result<T>) {
        let label = if result.is_ok() { "ok" } else { "error" };
        self.metrics.record_session(operation, label);
        if let Err(err) = result {
            warn!(operation, error = %err, "Session store operation failed");
        }
    }
}
