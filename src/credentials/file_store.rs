//! Durable credential store: one JSON record per identity.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/client.json            OAuth client registration
//! <base>/tokens/<identity>.json one record per identity
//! ```
//!
//! Records are written to a uniquely named temp file and renamed into place,
//! so a reader never observes a partial write.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credentials::{
    CredentialStore, OAuthClientInfo, OAuthToken, StoreResult, validate_identity,
};
use crate::types::Identity;

const TOKENS_DIR: &str = "tokens";
const CLIENT_FILE: &str = "client.json";
const RECORD_EXTENSION: &str = "json";

/// On-disk token record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredTokenRecord {
    identity: Identity,
    token: OAuthToken,
    updated_at: DateTime<Utc>,
}

/// File-backed [`CredentialStore`].
pub struct FileCredentialStore {
    base_dir: PathBuf,
    /// Serializes writers so concurrent set/clear on one identity cannot interleave.
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Open a store rooted at `base_dir`, creating the directory layout if needed.
    pub async fn open(base_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(base_dir.join(TOKENS_DIR)).await?;
        restrict_permissions(&base_dir, 0o700).await?;

        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn token_path(&self, identity: &str) -> PathBuf {
        self.base_dir
            .join(TOKENS_DIR)
            .join(format!("{}.{}", identity, RECORD_EXTENSION))
    }

    fn client_path(&self) -> PathBuf {
        self.base_dir.join(CLIENT_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get_tokens(&self, identity: &str) -> StoreResult<Option<OAuthToken>> {
        validate_identity(identity)?;
        let record: Option<StoredTokenRecord> = read_json(&self.token_path(identity)).await?;
        Ok(record.map(|r| r.token))
    }

    async fn set_tokens(&self, identity: &str, token: OAuthToken) -> StoreResult<()> {
        validate_identity(identity)?;
        let record = StoredTokenRecord {
            identity: Identity::new(identity),
            token,
            updated_at: Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.token_path(identity), &record).await?;
        debug!("Stored credentials for {}", identity);
        Ok(())
    }

    async fn clear_tokens(&self, identity: &str) -> StoreResult<bool> {
        validate_identity(identity)?;

        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.token_path(identity)).await {
            Ok(()) => {
                debug!("Cleared credentials for {}", identity);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_client_info(&self) -> StoreResult<Option<OAuthClientInfo>> {
        read_json(&self.client_path()).await
    }

    async fn set_client_info(&self, info: OAuthClientInfo) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.client_path(), &info).await
    }

    async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
        let mut entries = tokio::fs::read_dir(self.base_dir.join(TOKENS_DIR)).await?;
        let mut identities = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_identity(stem).is_err() {
                warn!("Ignoring unexpected file in credential store: {}", path.display());
                continue;
            }
            identities.push(Identity::new(stem));
        }

        identities.sort();
        Ok(identities)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` as pretty JSON to a temp file beside `path`, then rename.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    tokio::fs::write(&tmp_path, json).await?;
    restrict_permissions(&tmp_path, 0o600).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path, mode: u32) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path, _mode: u32) -> StoreResult<()> {
    Ok(())
}
