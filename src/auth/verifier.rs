//! Token verification seam and the verifiers shipped with the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::auth::bearer::{TokenProvider, token_fingerprint};
use crate::auth::jwks::JwksError;

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedAuth {
    pub sub: String,
    pub email: Option<String>,
    /// Every claim the verifier saw.
    #[serde(default)]
    pub claims: Map<String, Value>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl VerifiedAuth {
    /// Build from a claim set. `sub` is required; everything else is optional.
    pub fn from_claims(claims: Map<String, Value>) -> Result<Self, VerifyError> {
        let sub = claim_str(&claims, "sub")
            .ok_or_else(|| VerifyError::Rejected("token has no subject".to_string()))?;

        Ok(Self {
            email: claim_str(&claims, "email"),
            scopes: claim_scopes(&claims),
            client_id: claim_str(&claims, "client_id")
                .or_else(|| claim_str(&claims, "azp")),
            expires_at: claim_timestamp(&claims, "exp"),
            sub,
            claims,
        })
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The issuer or signature check said no.
    #[error("Token rejected: {0}")]
    Rejected(String),

    #[error("No verifier configured for {0} tokens")]
    Unsupported(TokenProvider),

    #[error("Token verification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Token verification request failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Jwks(#[from] JwksError),
}

/// Verifies a bearer token and reports who it belongs to.
///
/// `provider` is the shape-based classification from
/// [`TokenProvider::detect`], so one verifier can route tokens to the right
/// backend.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, provider: TokenProvider) -> Result<VerifiedAuth, VerifyError>;
}

/// Routes tokens to a per-provider verifier.
#[derive(Default, Clone)]
pub struct ProviderVerifier {
    google: Option<Arc<dyn TokenVerifier>>,
    jwt: Option<Arc<dyn TokenVerifier>>,
}

impl ProviderVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_google(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.google = Some(verifier);
        self
    }

    pub fn with_jwt(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.jwt = Some(verifier);
        self
    }

    /// True when no backend is configured.
    pub fn is_empty(&self) -> bool {
        self.google.is_none() && self.jwt.is_none()
    }
}

#[async_trait]
impl TokenVerifier for ProviderVerifier {
    async fn verify(&self, token: &str, provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
        let backend = match provider {
            TokenProvider::Google => self.google.as_ref(),
            TokenProvider::Jwt => self.jwt.as_ref(),
            TokenProvider::Unknown => None,
        };
        match backend {
            Some(verifier) => verifier.verify(token, provider).await,
            None => Err(VerifyError::Unsupported(provider)),
        }
    }
}

/// Verifies opaque Google access tokens against the OAuth2 `tokeninfo` endpoint.
pub struct GoogleTokenInfoVerifier {
    client: reqwest::Client,
    endpoint: Url,
    /// Reject tokens minted for a different OAuth client.
    expected_audience: Option<String>,
}

pub const GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

impl GoogleTokenInfoVerifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, VerifyError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| VerifyError::Transport(format!("invalid tokeninfo URL: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            expected_audience: None,
        })
    }

    pub fn with_expected_audience(mut self, audience: impl Into<String>) -> Self {
        self.expected_audience = Some(audience.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for GoogleTokenInfoVerifier {
    async fn verify(&self, token: &str, _provider: TokenProvider) -> Result<VerifiedAuth, VerifyError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("access_token", token);

        debug!("Verifying token {} via tokeninfo", token_fingerprint(token));

        // The request URL carries the token, so errors are reported without it.
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VerifyError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerifyError::Rejected(format!(
                "tokeninfo returned HTTP {}",
                status.as_u16()
            )));
        }

        let claims: Map<String, Value> = response
            .json()
            .await
            .map_err(|e| VerifyError::Transport(e.without_url().to_string()))?;

        if let Some(expected) = &self.expected_audience
            && claim_str(&claims, "aud").as_deref() != Some(expected.as_str())
        {
            return Err(VerifyError::Rejected(
                "token was issued to a different client".to_string(),
            ));
        }

        let verified = VerifiedAuth::from_claims(claims)?;
        if verified.expires_at.is_some_and(|exp| exp <= Utc::now()) {
            return Err(VerifyError::Rejected("token expired".to_string()));
        }
        Ok(verified)
    }
}

/// String claim, accepting numbers as well.
pub(crate) fn claim_str(claims: &Map<String, Value>, key: &str) -> Option<String> {
    match claims.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `aud` may be a single string or an array of strings.
pub(crate) fn claim_audience(claims: &Map<String, Value>) -> Vec<String> {
    match claims.get("aud") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Scopes from `scope` (space separated) or `scp` (string or array).
pub(crate) fn claim_scopes(claims: &Map<String, Value>) -> Vec<String> {
    for key in ["scope", "scp"] {
        match claims.get(key) {
            Some(Value::String(s)) => {
                return s.split_whitespace().map(str::to_string).collect();
            }
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
            _ => {}
        }
    }
    Vec::new()
}

/// Unix-seconds claim, given as a number or a numeric string.
pub(crate) fn claim_timestamp(claims: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let seconds = match claims.get(key)? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(seconds, 0)
}
