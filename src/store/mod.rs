// Credential store
// Encrypted at-rest persistence for the three auth aggregates
//
// Backends implement `CredentialStore`; only the file backend ships. Kubernetes
// secret and Vault backends slot in behind the same trait.

mod cipher;
mod file;

pub use cipher::{EncryptionKey, KEY_LEN, NONCE_LEN};
pub use file::FileStore;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::auth::{AuthParams, Credentials, M365Resources};

/// The independently persisted pieces of auth state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Params,
    Credentials,
    M365Resources,
}

impl Aggregate {
    pub const ALL: [Aggregate; 3] = [
        Aggregate::Credentials,
        Aggregate::Params,
        Aggregate::M365Resources,
    ];
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Params => f.write_str("parameters"),
            Self::Credentials => f.write_str("credentials"),
            Self::M365Resources => f.write_str("M365 resources"),
        }
    }
}

/// Errors from a credential store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing persisted yet, expected on first run
    #[error("{aggregate} not found at {}", path.display())]
    NotFound { aggregate: Aggregate, path: PathBuf },

    #[error("encryption key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("failed to encrypt data")]
    Encryption,

    /// Wrong key, corrupted or truncated blob
    #[error("failed to decrypt data: {0}")]
    Decryption(String),

    #[error("failed to (de)serialize {aggregate}: {source}")]
    Serialization {
        aggregate: Aggregate,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Durable, encrypted storage for auth state
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn store_credentials(&self, creds: &Credentials) -> Result<(), StoreError>;

    async fn load_credentials(&self) -> Result<Credentials, StoreError>;

    async fn store_params(&self, params: &AuthParams) -> Result<(), StoreError>;

    async fn load_params(&self) -> Result<AuthParams, StoreError>;

    async fn store_m365_resources(&self, resources: &M365Resources) -> Result<(), StoreError>;

    async fn load_m365_resources(&self) -> Result<M365Resources, StoreError>;

    /// Remove all three aggregates; absent ones are not an error
    async fn clear(&self) -> Result<(), StoreError>;
}
