//! Composition root: one instance of each auth component, wired together.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::auth::{
    AuthenticatorConfig, GoogleTokenInfoVerifier, JwksCache, JwksTokenVerifier, ProviderVerifier,
    RequestAuthenticator, TokenVerifier,
};
use crate::config::GatewayAuthConfig;
use crate::credentials::{CredentialStore, build_credential_store};
use crate::error::GatewayError;
use crate::probe::AuthProbe;
use crate::retry::RetryPolicy;
use crate::session::SessionRegistry;

/// Shared services for a running gateway.
///
/// Lifecycle: [`from_config`](Self::from_config), then [`start`](Self::start)
/// to launch background work, then [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct AuthServices {
    pub config: Arc<GatewayAuthConfig>,
    pub credentials: Arc<dyn CredentialStore>,
    pub sessions: SessionRegistry,
    pub retry: RetryPolicy,
    pub authenticator: RequestAuthenticator,
    pub probe: AuthProbe,
}

impl AuthServices {
    pub async fn from_config(config: GatewayAuthConfig) -> Result<Self, GatewayError> {
        let credentials = build_credential_store(&config.credentials).await?;
        Self::with_store(config, credentials)
    }

    /// Build around an existing credential store.
    pub fn with_store(
        config: GatewayAuthConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let sessions = SessionRegistry::new(config.sessions.clone());
        let retry = RetryPolicy::new(config.retry.clone()).with_store(credentials.clone());

        let mut authenticator = RequestAuthenticator::new(sessions.clone())
            .with_verify_timeout(config.auth.verify_timeout());
        match build_verifier(&config.auth)? {
            Some(verifier) => authenticator = authenticator.with_verifier(verifier),
            None => info!("No token verifier configured; bearer tokens cannot be verified"),
        }

        let probe = AuthProbe::new(&config.probe)?;

        Ok(Self {
            config: Arc::new(config),
            credentials,
            sessions,
            retry,
            authenticator,
            probe,
        })
    }

    pub async fn start(&self) {
        self.sessions.start_sweeper().await;
    }

    pub async fn shutdown(&self) {
        self.sessions.stop_sweeper().await;
        info!("Auth services stopped");
    }
}

/// Verifiers for every backend named in `config`; `None` when there are none.
pub fn build_verifier(
    config: &AuthenticatorConfig,
) -> Result<Option<Arc<dyn TokenVerifier>>, GatewayError> {
    let mut verifier = ProviderVerifier::new();

    if let Some(jwks_url) = &config.jwks_url {
        let cache = JwksCache::new(
            jwks_url.clone(),
            Duration::from_secs(config.jwks_cache_seconds),
            config.allow_stale_jwks,
            config.verify_timeout(),
        )
        .map_err(|e| GatewayError::Verifier(e.to_string()))?;

        let mut jwt = JwksTokenVerifier::new(Arc::new(cache));
        if let Some(issuer) = &config.jwt_issuer {
            jwt = jwt.with_issuer(issuer.clone());
        }
        if let Some(audience) = &config.jwt_audience {
            jwt = jwt.with_audience(audience.clone());
        }
        info!("JWT verification enabled with JWKS from {}", jwks_url);
        verifier = verifier.with_jwt(Arc::new(jwt));
    }

    if let Some(url) = &config.google_tokeninfo_url {
        let mut google = GoogleTokenInfoVerifier::new(url, config.verify_timeout())
            .map_err(|e| GatewayError::Verifier(e.to_string()))?;
        if let Some(client_id) = &config.google_client_id {
            google = google.with_expected_audience(client_id.clone());
        }
        info!("Google access token verification enabled via {}", url);
        verifier = verifier.with_google(Arc::new(google));
    }

    if verifier.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Arc::new(verifier)))
    }
}
