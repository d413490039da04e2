//! Per-identity OAuth credential storage.
//!
//! Two backends implement [`CredentialStore`]:
//!
//! - [`FileCredentialStore`]: one JSON record per identity under a base
//!   directory, survives restarts.
//! - [`MemoryCredentialStore`]: process memory only, wiped on restart.
//!
//! Which one a deployment uses is decided once, by the `stateless` flag in
//! [`CredentialsConfig`] (see [`build_credential_store`]).
//!
//! Writes are visible to later reads through the same store instance. There
//! is no cross-process notification.

mod file_store;
mod memory_store;
mod token;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CredentialStoreError;
use crate::types::Identity;

pub use file_store::FileCredentialStore;
pub use memory_store::MemoryCredentialStore;
pub use token::{OAuthClientInfo, OAuthToken};

/// Result type for credential store operations.
pub type StoreResult<T> = Result<T, CredentialStoreError>;

/// Longest identity accepted as a storage key (RFC 5321 address limit).
pub const MAX_IDENTITY_LEN: usize = 320;

/// CRUD over per-identity tokens and the shared OAuth client registration.
///
/// Implementations are internally synchronized and may be shared across tasks.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Short backend name for logs ("file", "memory").
    fn kind(&self) -> &'static str;

    async fn get_tokens(&self, identity: &str) -> StoreResult<Option<OAuthToken>>;

    async fn set_tokens(&self, identity: &str, token: OAuthToken) -> StoreResult<()>;

    /// Remove the identity's tokens. Returns true iff something was removed.
    async fn clear_tokens(&self, identity: &str) -> StoreResult<bool>;

    async fn has_valid_tokens(&self, identity: &str) -> StoreResult<bool> {
        Ok(self
            .get_tokens(identity)
            .await?
            .is_some_and(|token| token.is_valid()))
    }

    async fn get_client_info(&self) -> StoreResult<Option<OAuthClientInfo>>;

    async fn set_client_info(&self, info: OAuthClientInfo) -> StoreResult<()>;

    async fn list_identities(&self) -> StoreResult<Vec<Identity>>;

    /// Remove expired tokens that cannot be renewed (no refresh token).
    ///
    /// Returns the number of identities whose tokens were removed.
    async fn cleanup_expired(&self) -> StoreResult<usize> {
        let mut removed = 0;
        for identity in self.list_identities().await? {
            let Some(token) = self.get_tokens(identity.as_str()).await? else {
                continue;
            };
            if is_unrenewable(&token) && self.clear_tokens(identity.as_str()).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} expired credential record(s) from {} store", removed, self.kind());
        }
        Ok(removed)
    }
}

/// Expired and without a refresh token.
pub(crate) fn is_unrenewable(token: &OAuthToken) -> bool {
    token.is_expired() && token.refresh_token.is_none()
}

/// Reject identities that cannot safely be used as a storage key.
pub(crate) fn validate_identity(identity: &str) -> StoreResult<()> {
    let invalid = identity.is_empty()
        || identity.len() > MAX_IDENTITY_LEN
        || identity.starts_with('.')
        || identity.contains("..")
        || identity
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control() || c.is_whitespace());

    if invalid {
        return Err(CredentialStoreError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

/// Credential store selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Keep credentials in memory only.
    #[serde(default)]
    pub stateless: bool,
    /// Directory for the file backend.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl CredentialsConfig {
    /// Configured directory, else `$HOME/.unicity/credentials`, else `./.credentials`.
    pub fn resolved_base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.base_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".unicity").join("credentials"),
            None => PathBuf::from(".credentials"),
        }
    }
}

/// Build the store selected by `config`.
pub async fn build_credential_store(
    config: &CredentialsConfig,
) -> StoreResult<Arc<dyn CredentialStore>> {
    if config.stateless {
        info!("Stateless mode: credentials are kept in memory only");
        return Ok(Arc::new(MemoryCredentialStore::new()));
    }

    let base_dir = config.resolved_base_dir();
    let store = FileCredentialStore::open(&base_dir).await?;
    info!("Using file credential store at {}", base_dir.display());
    Ok(Arc::new(store))
}
