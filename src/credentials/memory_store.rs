//! Ephemeral credential store for stateless deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::credentials::{
    CredentialStore, OAuthClientInfo, OAuthToken, StoreResult, is_unrenewable, validate_identity,
};
use crate::types::Identity;

/// In-memory [`CredentialStore`]. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: RwLock<HashMap<Identity, OAuthToken>>,
    client_info: RwLock<Option<OAuthClientInfo>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with stored tokens.
    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get_tokens(&self, identity: &str) -> StoreResult<Option<OAuthToken>> {
        validate_identity(identity)?;
        Ok(self.tokens.read().await.get(identity).cloned())
    }

    async fn set_tokens(&self, identity: &str, token: OAuthToken) -> StoreResult<()> {
        validate_identity(identity)?;
        self.tokens
            .write()
            .await
            .insert(Identity::new(identity), token);
        debug!("Stored in-memory credentials for {}", identity);
        Ok(())
    }

    async fn clear_tokens(&self, identity: &str) -> StoreResult<bool> {
        validate_identity(identity)?;
        Ok(self.tokens.write().await.remove(identity).is_some())
    }

    async fn get_client_info(&self) -> StoreResult<Option<OAuthClientInfo>> {
        Ok(self.client_info.read().await.clone())
    }

    async fn set_client_info(&self, info: OAuthClientInfo) -> StoreResult<()> {
        *self.client_info.write().await = Some(info);
        Ok(())
    }

    async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
        let mut identities: Vec<Identity> = self.tokens.read().await.keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }

    async fn cleanup_expired(&self) -> StoreResult<usize> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, token| !is_unrenewable(token));
        Ok(before - tokens.len())
    }
}
