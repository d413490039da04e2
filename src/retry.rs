//! Automatic retry for calls that fail because stored credentials went stale.
//!
//! A failure is *stale* when its message, including any chain of context
//! rendered by `{:#}`, contains one of [`STALE_CREDENTIAL_SIGNATURES`]. Stale failures are retried up to
//! `max_retries` times with exponential backoff, purging the identity's
//! stored tokens between attempts. Every other failure is returned
//! immediately as [`RetryError::Operation`], unchanged.
//!
//! When the budget runs out the caller receives exactly one
//! [`RetryError::Stale`], which means the user has to re-authenticate.
//!
//! ```ignore
//! // In-line block
//! let labels = policy
//!     .run(Some("a@example.com"), || async { gmail.list_labels().await })
//!     .await?;
//!
//! // Wrapped operation, called with an explicit identity
//! let send = policy.wrap(|identity| async move { gmail.send_as(&identity, &message).await });
//! send.call("a@example.com").await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialStore;
use crate::error::{GatewayError, StaleCredentialError};
use crate::guidance::{redact_secrets, redact_token};
use crate::types::Identity;

/// Lowercase provider error fragments that identify stale credentials.
pub const STALE_CREDENTIAL_SIGNATURES: &[&str] = &[
    "invalid_grant",
    "token expired",
    "token has been expired or revoked",
    "token has been revoked",
    "refresh token has expired",
    "invalid refresh token",
    "authorization code has already been used",
];

/// Whether an error message indicates stale credentials.
pub fn is_stale_credential_error(message: &str) -> bool {
    let message = message.to_lowercase();
    STALE_CREDENTIAL_SIGNATURES
        .iter()
        .any(|signature| message.contains(signature))
}

/// Process-wide retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// When false, wrapped calls run exactly once.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Purge the identity's stored tokens after each stale failure.
    #[serde(default = "default_clear_cache_on_fail")]
    pub clear_cache_on_fail: bool,
    /// Seconds; the wait before retry `n` (1-based) is `backoff_base^(n-1)`,
    /// capped at [`MAX_BACKOFF_DELAY`]. Must be finite and positive.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
}

/// Longest wait between two attempts, whatever the base.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(300);

fn valid_backoff_base(base: f64) -> bool {
    base.is_finite() && base > 0.0
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_clear_cache_on_fail() -> bool {
    true
}

fn default_backoff_base() -> f64 {
    2.0
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !valid_backoff_base(self.backoff_base) {
            return Err(GatewayError::InvalidConfig(format!(
                "retry.backoff_base must be a finite number greater than zero, got {}",
                self.backoff_base
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            clear_cache_on_fail: default_clear_cache_on_fail(),
            backoff_base: default_backoff_base(),
        }
    }
}

/// Outcome of a retried call that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// A non-stale failure, returned as the operation produced it.
    #[error("{0}")]
    Operation(E),

    /// Stale-credential failures exhausted the retry budget.
    ///
    /// `error` is redacted and safe to show. `last` is the final failure as
    /// the operation returned it and may still carry secrets.
    #[error("{error}")]
    Stale {
        #[source]
        error: StaleCredentialError,
        last: E,
    },
}

impl<E> RetryError<E> {
    /// The stale-credential signal, if this is one.
    pub fn as_stale(&self) -> Option<&StaleCredentialError> {
        match self {
            Self::Stale { error, .. } => Some(error),
            Self::Operation(_) => None,
        }
    }

    /// The underlying operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Stale { .. } => None,
        }
    }

    /// The last error the operation produced, stale or not.
    pub fn into_inner(self) -> E {
        match self {
            Self::Operation(err) | Self::Stale { last: err, .. } => err,
        }
    }
}

/// Retries stale-credential failures for one identity at a time.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    store: Option<Arc<dyn CredentialStore>>,
}

impl RetryPolicy {
    /// Create a policy without a credential store; nothing is purged between attempts.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Purge stale tokens from `store` between attempts.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn with_clear_cache_on_fail(mut self, clear: bool) -> Self {
        self.config.clear_cache_on_fail = clear;
        self
    }

    /// Non-finite or non-positive values are ignored with a warning.
    pub fn with_backoff_base(mut self, backoff_base: f64) -> Self {
        if valid_backoff_base(backoff_base) {
            self.config.backoff_base = backoff_base;
        } else {
            warn!(
                "Ignoring invalid backoff base {}; keeping {}",
                backoff_base, self.config.backoff_base
            );
        }
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Wait after the failed attempt with zero-based index `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = if valid_backoff_base(self.config.backoff_base) {
            self.config.backoff_base
        } else {
            default_backoff_base()
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        Duration::try_from_secs_f64(base.powi(exponent))
            .map_or(MAX_BACKOFF_DELAY, |delay| delay.min(MAX_BACKOFF_DELAY))
    }

    /// Run `op`, retrying stale-credential failures.
    ///
    /// `identity` selects whose stored tokens are purged between attempts.
    /// With `None` the call is still retried but nothing is purged.
    pub async fn run<T, E, F, Fut>(
        &self,
        identity: Option<&str>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if !self.config.enabled {
            return op().await.map_err(RetryError::Operation);
        }

        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;
        // Stored token values, read before the first purge.
        let mut secrets: Option<Vec<String>> = None;

        loop {
            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Call succeeded after {} retr(ies)", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let message = format!("{:#}", err);
            if !is_stale_credential_error(&message) {
                debug!("Non-credential failure, not retrying");
                return Err(RetryError::Operation(err));
            }

            if secrets.is_none() {
                secrets = Some(self.stored_secrets(identity).await);
            }
            let scrubbed = scrub(&message, secrets.as_deref().unwrap_or_default());

            if self.config.clear_cache_on_fail {
                self.purge(identity).await;
            }

            if attempt >= max_retries {
                warn!(
                    "Stale credentials persisted after {} attempt(s) for {}",
                    attempt + 1,
                    identity.unwrap_or("unknown identity")
                );
                return Err(RetryError::Stale {
                    error: StaleCredentialError::exhausted(
                        identity.map(Identity::new),
                        attempt + 1,
                        &scrubbed,
                    ),
                    last: err,
                });
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                "Stale credentials on attempt {}/{} ({}); retrying in {:?}",
                attempt + 1,
                max_retries + 1,
                scrubbed,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Wrap `op` so each call runs under this policy.
    pub fn wrap<F>(&self, op: F) -> Retrying<F> {
        Retrying {
            policy: self.clone(),
            op,
        }
    }

    /// Access and refresh token currently stored for `identity`.
    async fn stored_secrets(&self, identity: Option<&str>) -> Vec<String> {
        let (Some(identity), Some(store)) = (identity, &self.store) else {
            return Vec::new();
        };

        match store.get_tokens(identity).await {
            Ok(Some(token)) => std::iter::once(token.access_token)
                .chain(token.refresh_token)
                .filter(|secret| !secret.is_empty())
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!("Could not read stored tokens for {}: {}", identity, e);
                Vec::new()
            }
        }
    }

    async fn purge(&self, identity: Option<&str>) {
        let (Some(identity), Some(store)) = (identity, &self.store) else {
            if identity.is_none() {
                debug!("No identity for stale-credential failure; nothing to purge");
            }
            return;
        };

        match store.clear_tokens(identity).await {
            Ok(true) => info!("Cleared stale credentials for {}", identity),
            Ok(false) => debug!("No stored credentials to clear for {}", identity),
            Err(e) => error!("Failed to clear stale credentials for {}: {}", identity, e),
        }
    }
}

/// Mask known secret values, then anything else token-shaped.
fn scrub(message: &str, secrets: &[String]) -> String {
    let masked = secrets
        .iter()
        .fold(message.to_string(), |text, secret| redact_token(&text, secret));
    redact_secrets(&masked)
}

/// An operation bound to a [`RetryPolicy`], produced by [`RetryPolicy::wrap`].
pub struct Retrying<F> {
    policy: RetryPolicy,
    op: F,
}

impl<F> Retrying<F> {
    /// Invoke the wrapped operation for `identity`.
    pub async fn call<T, E, Fut>(&self, identity: &str) -> Result<T, RetryError<E>>
    where
        F: Fn(Identity) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.policy
            .run(Some(identity), || (self.op)(Identity::new(identity)))
            .await
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
