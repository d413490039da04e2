//! Error types shared across the auth core.
//!
//! Only [`StaleCredentialError`] means "the user must re-authenticate".
//! Store I/O failures are reported as [`CredentialStoreError`] and are not
//! part of the auth taxonomy.

use thiserror::Error;

use crate::guidance::{AuthErrorGuidance, redact_secrets};
use crate::types::{Identity, SessionId};

/// Failures raised by a [`CredentialStore`](crate::credentials::CredentialStore).
#[derive(Debug, Error)]
pub enum CredentialStoreError {
    /// Disk or permission failure in the durable backend.
    #[error("Credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("Credential record is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The identity cannot be used as a storage key.
    #[error("Invalid identity for credential storage: {0}")]
    InvalidIdentity(String),
}

/// Raised once a stale-credential failure has used up its retry budget.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StaleCredentialError {
    /// Human readable summary, safe to show to the user.
    pub message: String,
    /// Identity whose credentials went stale, when it was known.
    pub identity: Option<Identity>,
    /// The last underlying provider error, with secrets redacted.
    pub last_error: String,
}

impl StaleCredentialError {
    /// Build the error after `attempts` stale failures.
    pub fn exhausted(identity: Option<Identity>, attempts: u32, last_error: &str) -> Self {
        let message = match &identity {
            Some(identity) => format!(
                "Credentials for {} are no longer valid after {} attempt(s); re-authentication is required",
                identity, attempts
            ),
            None => format!(
                "Credentials are no longer valid after {} attempt(s); re-authentication is required",
                attempts
            ),
        };

        Self {
            message,
            identity,
            last_error: redact_secrets(last_error),
        }
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The operation needs an identity and the request has none.
    #[error("Authentication required")]
    NotAuthenticated,

    /// A session id is already bound to a different identity.
    #[error("Session {session_id} is already bound to a different identity")]
    SessionAlreadyBound { session_id: SessionId },

    /// No OAuth client configuration has been stored.
    #[error("OAuth client is not configured")]
    ClientNotConfigured,

    #[error(transparent)]
    StaleCredential(#[from] StaleCredentialError),

    #[error(transparent)]
    CredentialStore(#[from] CredentialStoreError),

    /// The shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    /// A configured token verifier could not be set up.
    #[error("Token verifier setup failed: {0}")]
    Verifier(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayError {
    /// Map this error onto the user-facing guidance catalog.
    pub fn guidance(&self) -> AuthErrorGuidance {
        match self {
            Self::NotAuthenticated => AuthErrorGuidance::generic(
                "This operation requires an authenticated user, but the request carried no usable credentials.",
            )
            .with_action("Sign in again or provide a valid bearer token, then retry."),
            Self::SessionAlreadyBound { .. } => AuthErrorGuidance::session_already_bound(),
            Self::ClientNotConfigured => AuthErrorGuidance::client_not_configured(),
            Self::StaleCredential(err) => AuthErrorGuidance::from(err),
            Self::CredentialStore(err) => {
                AuthErrorGuidance::generic("Stored credentials could not be accessed.")
                    .with_technical_detail(err.to_string())
            }
            Self::HttpClient(msg) => AuthErrorGuidance::network_error(msg),
            Self::Verifier(msg) => AuthErrorGuidance::generic("Token verification is misconfigured.")
                .with_technical_detail(msg.clone()),
            Self::InvalidConfig(msg) => {
                AuthErrorGuidance::generic("The gateway configuration is invalid.")
                    .with_action("Fix the reported setting and restart the gateway.")
                    .with_technical_detail(msg.clone())
            }
        }
    }
}
