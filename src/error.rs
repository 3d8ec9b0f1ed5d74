// Error handling module
// Defines the error kinds surfaced by the credential lifecycle engine

use thiserror::Error;

use crate::auth::{Service, StoreType};
use crate::store::StoreError;

/// Errors returned by the auth manager and leases
#[derive(Error, Debug)]
pub enum AuthError {
    /// Manager has no backing store
    #[error("credential store not initialized")]
    StoreNotInitialized,

    /// No cached credentials, or renewal attempted with none
    #[error("not authenticated")]
    NotAuthenticated,

    /// Cached token is past its expiry
    #[error("credentials expired")]
    CredentialsExpired,

    /// Renewal was attempted and did not produce credentials
    #[error("failed to renew credentials: {0}")]
    RenewalFailed(String),

    #[error("unsupported service: {0}")]
    UnsupportedService(String),

    #[error("unsupported store type: {0}")]
    UnsupportedStoreType(String),

    /// Recognized backend that has no implementation
    #[error("{0} store not implemented")]
    StoreBackendNotImplemented(StoreType),

    /// Authenticated, but no token was ever acquired for this service
    #[error("token not found for service: {0}")]
    TokenNotFound(Service),

    /// Every strategy in the fallback chain was skipped or failed
    #[error("all authentication methods failed ({attempted} attempted, {skipped} skipped)")]
    AllMethodsFailed { attempted: usize, skipped: usize },

    /// Caller gave up before the chain finished
    #[error("authentication cancelled")]
    Cancelled,

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Recovery is `authenticate` rather than `renew_tokens`
    pub fn needs_authentication(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::AllMethodsFailed { .. })
    }
}

/// Result type alias for auth operations
pub type Result<T> = std::result::Result<T, AuthError>;
