// Token acquisition capability
// The embedding application supplies the provider-specific token exchange;
// leases only sequence calls through these traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::AuthType;

/// Acquisition strategy tag, the same tag recorded on the resulting credentials
pub type Strategy = AuthType;

/// What the user must do to finish a device code login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeMessage {
    pub user_code: String,
    pub verification_url: String,
    pub message: String,
}

/// Callback that shows a device code to the user
pub type UserPrompt = Arc<dyn Fn(&DeviceCodeMessage) + Send + Sync>;

/// Default device code prompt: log it
pub fn log_device_code(message: &DeviceCodeMessage) {
    tracing::info!(
        "Device code authentication - Your MFA code is: {}",
        message.user_code
    );
    tracing::info!("Please authenticate at: {}", message.verification_url);
}

/// Options for every strategy; each strategy reads the fields it needs
#[derive(Clone, Default)]
pub struct StrategyOptions {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    /// Login authority, e.g. https://login.microsoftonline.com
    pub authority_host: String,

    /// Device code display, device code strategy only
    pub user_prompt: Option<UserPrompt>,
}

impl fmt::Debug for StrategyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyOptions")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("authority_host", &self.authority_host)
            .field("user_prompt", &self.user_prompt.is_some())
            .finish()
    }
}

/// Token as returned by the acquisition capability
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
    pub token_type: Option<String>,
    pub refresh_token: Option<String>,
}

impl AccessToken {
    pub fn bearer(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
            token_type: Some("Bearer".to_string()),
            refresh_token: None,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_on", &self.expires_on)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

/// Failure of a single strategy
#[derive(Error, Debug)]
pub enum AcquireError {
    /// Strategy cannot be used in this environment
    #[error("credential unavailable: {0}")]
    Unavailable(String),

    /// Strategy was attempted and failed (consent, network, user cancelled the prompt, ...)
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Caller's cancellation signal fired
    #[error("token request cancelled")]
    Cancelled,
}

impl AcquireError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{}", message))
    }
}

/// Produces bearer tokens for one configured strategy
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Request a token for the given scopes
    ///
    /// Implementations should watch `cancel` at every network boundary.
    async fn get_token(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AcquireError>;
}

/// Builds a credential object for a strategy
pub trait TokenAcquirer: Send + Sync {
    fn credential(
        &self,
        strategy: Strategy,
        options: &StrategyOptions,
    ) -> Result<Box<dyn TokenCredential>, AcquireError>;
}
