//! RS256 JWT verification against a cached JWKS document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::bearer::{TokenProvider, token_fingerprint};
use crate::auth::verifier::{TokenVerifier, VerifiedAuth, VerifyError};

/// Default cache TTL in seconds (1 hour).
pub const DEFAULT_JWKS_CACHE_TTL_SECONDS: u64 = 3600;

/// Oldest key set still used when the endpoint cannot be reached (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

/// Key id used for keys published without a `kid`.
const DEFAULT_KID: &str = "default";

/// A single JSON Web Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url)
    pub n: Option<String>,
    /// RSA exponent (base64url)
    pub e: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Error)]
pub enum JwksError {
    #[error("Failed to fetch JWKS: {0}")]
    Fetch(String),
    #[error("Failed to parse JWKS: {0}")]
    Parse(String),
    #[error("No usable RSA signing keys in JWKS")]
    NoValidKeys,
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("No keys available in cache")]
    NoKeysAvailable,
}

/// Key set fetched from a JWKS endpoint, refreshed after a TTL.
pub struct JwksCache {
    jwks_url: String,
    cache_ttl: Duration,
    /// Fall back to the previous key set (up to [`MAX_STALE_CACHE_SECONDS`]) when a refresh fails.
    allow_stale: bool,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_fetch: RwLock<Option<Instant>>,
    client: reqwest::Client,
}

impl JwksCache {
    pub fn new(
        jwks_url: impl Into<String>,
        cache_ttl: Duration,
        allow_stale: bool,
        request_timeout: Duration,
    ) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        Ok(Self {
            jwks_url: jwks_url.into(),
            cache_ttl,
            allow_stale,
            keys: RwLock::new(HashMap::new()),
            last_fetch: RwLock::new(None),
            client,
        })
    }

    /// Decoding key for `kid` (any key when `None`), fetching when the cache is cold or stale.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksError> {
        let fresh = self
            .last_fetch
            .read()
            .await
            .is_some_and(|t| t.elapsed() <= self.cache_ttl);

        if fresh && let Some(key) = self.get_from_cache(kid).await {
            return Ok(key);
        }

        match self.fetch_keys().await {
            Ok(()) => self.get_from_cache(kid).await.ok_or_else(|| match kid {
                Some(k) => JwksError::KeyNotFound(k.to_string()),
                None => JwksError::NoKeysAvailable,
            }),
            Err(e) => {
                if self.allow_stale {
                    let stale_ok = self
                        .last_fetch
                        .read()
                        .await
                        .is_some_and(|t| t.elapsed() < Duration::from_secs(MAX_STALE_CACHE_SECONDS));

                    if stale_ok && let Some(key) = self.get_from_cache(kid).await {
                        warn!("JWKS fetch failed, using stale cache: {}", e);
                        return Ok(key);
                    }
                }
                Err(e)
            }
        }
    }

    async fn get_from_cache(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        match kid {
            Some(k) => keys.get(k).cloned(),
            None => keys.values().next().cloned(),
        }
    }

    /// Replace the cached key set with the endpoint's current contents.
    pub async fn fetch_keys(&self) -> Result<(), JwksError> {
        debug!("Fetching JWKS from {}", self.jwks_url);

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        let mut new_keys = HashMap::new();
        for jwk in document.keys {
            if jwk.kty != "RSA" {
                debug!("Skipping non-RSA key: {}", jwk.kty);
                continue;
            }
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }
            if jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
                continue;
            }

            match jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| DEFAULT_KID.to_string());
                    new_keys.insert(kid, key);
                }
                Err(e) => warn!("Failed to parse JWK: {}", e),
            }
        }

        if new_keys.is_empty() {
            return Err(JwksError::NoValidKeys);
        }

        let count = new_keys.len();
        *self.keys.write().await = new_keys;
        *self.last_fetch.write().await = Some(Instant::now());

        debug!("Cached {} JWKS key(s)", count);
        Ok(())
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn clear(&self) {
        self.keys.write().await.clear();
        *self.last_fetch.write().await = None;
    }
}

fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, JwksError> {
    let n = jwk
        .n
        .as_deref()
        .ok_or_else(|| JwksError::Parse("Missing 'n' in RSA key".to_string()))?;
    let e = jwk
        .e
        .as_deref()
        .ok_or_else(|| JwksError::Parse("Missing 'e' in RSA key".to_string()))?;

    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| JwksError::Parse(format!("Invalid RSA components: {}", e)))
}

/// [`TokenVerifier`] for RS256 JWTs signed by a key in a JWKS document.
pub struct JwksTokenVerifier {
    cache: Arc<JwksCache>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwksTokenVerifier {
    pub fn new(cache: Arc<JwksCache>) -> Self {
        Self {
            cache,
            issuer: None,
            audience: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn cache(&self) -> &Arc<JwksCache> {
        &self.cache
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwksTokenVerifier {
    async fn verify(&self, token: &str, _provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
        let header = decode_header(token)
            .map_err(|e| VerifyError::Rejected(format!("Invalid JWT header: {}", e)))?;

        let key = self.cache.get_key(header.kid.as_deref()).await?;

        let data = decode::<Map<String, Value>>(token, &key, &self.validation()).map_err(|e| {
            VerifyError::Rejected(format!("Signature verification failed: {}", e))
        })?;

        debug!("JWT {} verified", token_fingerprint(token));
        VerifiedAuth::from_claims(data.claims)
    }
}
