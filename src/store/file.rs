// File-backed credential store
// One encrypted blob per aggregate in a caller-chosen directory

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

use super::cipher::{self, EncryptionKey};
use super::{Aggregate, CredentialStore, StoreError};
use crate::auth::{AuthParams, Credentials, M365Resources};

pub const CREDENTIALS_FILE: &str = "credentials.enc";
pub const PARAMS_FILE: &str = "params.enc";
pub const M365_FILE: &str = "m365.enc";

/// Credential store backed by encrypted files
#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    key: EncryptionKey,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`
    ///
    /// Fails immediately if `key` is not exactly 32 bytes.
    pub async fn new(base_path: impl Into<PathBuf>, key: &[u8]) -> Result<Self, StoreError> {
        let key = EncryptionKey::from_slice(key)?;
        Self::with_key(base_path, key).await
    }

    pub async fn with_key(
        base_path: impl Into<PathBuf>,
        key: EncryptionKey,
    ) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        create_private_dir(&base_path).await?;

        tracing::debug!(
            credential_store = %base_path.display(),
            "opened file credential store"
        );

        Ok(Self { base_path, key })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Location of an aggregate's blob
    pub fn path(&self, aggregate: Aggregate) -> PathBuf {
        let name = match aggregate {
            Aggregate::Credentials => CREDENTIALS_FILE,
            Aggregate::Params => PARAMS_FILE,
            Aggregate::M365Resources => M365_FILE,
        };
        self.base_path.join(name)
    }

    async fn write_aggregate<T: Serialize>(
        &self,
        aggregate: Aggregate,
        value: &T,
    ) -> Result<(), StoreError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(value)
                .map_err(|source| StoreError::Serialization { aggregate, source })?,
        );
        let blob = cipher::seal(&self.key, &plaintext)?;

        let path = self.path(aggregate);
        write_private_atomic(&path, &blob).await?;

        tracing::debug!(
            credential_store = %path.display(),
            bytes = blob.len(),
            "saved {}",
            aggregate
        );
        Ok(())
    }

    async fn read_aggregate<T: DeserializeOwned>(
        &self,
        aggregate: Aggregate,
    ) -> Result<T, StoreError> {
        let path = self.path(aggregate);

        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound { aggregate, path });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let plaintext = cipher::open(&self.key, &blob)?;
        let value = serde_json::from_slice(&plaintext)
            .map_err(|source| StoreError::Serialization { aggregate, source })?;

        tracing::debug!(credential_store = %path.display(), "loaded {}", aggregate);
        Ok(value)
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn store_credentials(&self, creds: &Credentials) -> Result<(), StoreError> {
        self.write_aggregate(Aggregate::Credentials, creds).await
    }

    async fn load_credentials(&self) -> Result<Credentials, StoreError> {
        self.read_aggregate(Aggregate::Credentials).await
    }

    async fn store_params(&self, params: &AuthParams) -> Result<(), StoreError> {
        self.write_aggregate(Aggregate::Params, params).await
    }

    async fn load_params(&self) -> Result<AuthParams, StoreError> {
        self.read_aggregate(Aggregate::Params).await
    }

    async fn store_m365_resources(&self, resources: &M365Resources) -> Result<(), StoreError> {
        self.write_aggregate(Aggregate::M365Resources, resources)
            .await
    }

    async fn load_m365_resources(&self) -> Result<M365Resources, StoreError> {
        self.read_aggregate(Aggregate::M365Resources).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut first_err = None;

        for aggregate in Aggregate::ALL {
            let path = self.path(aggregate);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(credential_store = %path.display(), "removed {}", aggregate)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    tracing::warn!("Failed to remove {}: {}", path.display(), source);
                    if first_err.is_none() {
                        first_err = Some(StoreError::Io { path, source });
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Create `path` (and parents) readable only by the owner
async fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);

    builder.create(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a sibling temp file with owner-only permissions, then rename over `path`
async fn write_private_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("enc.tmp");
    let io_err = |source: std::io::Error| StoreError::Io {
        path: tmp_path.clone(),
        source,
    };

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp_path).await.map_err(io_err)?;
    file.write_all(contents).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}
