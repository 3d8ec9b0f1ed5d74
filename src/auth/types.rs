// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

use crate::error::AuthError;

/// Token name Graph-acquired tokens are recorded under
pub const GRAPH_TOKEN: &str = "graph";
/// Token name for an Azure-specific token
pub const AZURE_TOKEN: &str = "azure";
/// Token name for the Exchange Online token
pub const EXCHANGE_TOKEN: &str = "exchange";
/// Token name for the Exchange message trace token
pub const MSGTRACE_TOKEN: &str = "msgtrace";

/// Mechanism that produced a set of credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Device code flow, the user enters a code on a second device
    DeviceCode,

    /// Client credentials (application id + secret)
    #[serde(rename = "client_credentials")]
    ClientSecret,

    /// Interactive browser login
    #[serde(rename = "interactive")]
    InteractiveBrowser,

    /// Managed identity of the hosting compute
    ManagedIdentity,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceCode => "device_code",
            Self::ClientSecret => "client_credentials",
            Self::InteractiveBrowser => "interactive",
            Self::ManagedIdentity => "managed_identity",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters needed to acquire credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[serde(default)]
pub struct AuthParams {
    pub username: String,
    pub password: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,

    /// Use US Government cloud endpoints
    pub us_government: bool,

    /// Use US Government Exchange Online endpoints
    pub exo_us_government: bool,

    pub m365_enabled: bool,
    pub message_trace_enabled: bool,
}

impl fmt::Debug for AuthParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthParams")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("subscription_id", &self.subscription_id)
            .field("us_government", &self.us_government)
            .field("exo_us_government", &self.exo_us_government)
            .field("m365_enabled", &self.m365_enabled)
            .field("message_trace_enabled", &self.message_trace_enabled)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "[REDACTED]"
    }
}

/// A single bearer token
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub value: String,

    /// "Bearer", "Cookie", ...
    pub token_type: String,

    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default)]
    pub scopes: Vec<String>,

    /// Resource this token grants access to
    #[serde(default)]
    pub resource: String,
}

impl Token {
    /// Stale once the clock has passed the expiry instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &redacted(&self.value))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scopes", &self.scopes)
            .field("resource", &self.resource)
            .finish()
    }
}

/// Named tokens for one authenticated session
///
/// The overall expiry is never stored: it is always the earliest expiry among
/// the contained tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    tokens: BTreeMap<String, Token>,
    auth_type: AuthType,
    last_refreshed: DateTime<Utc>,
}

impl Credentials {
    pub fn new(auth_type: AuthType, last_refreshed: DateTime<Utc>) -> Self {
        Self {
            tokens: BTreeMap::new(),
            auth_type,
            last_refreshed,
        }
    }

    pub fn tokens(&self) -> &BTreeMap<String, Token> {
        &self.tokens
    }

    pub fn token(&self, name: &str) -> Option<&Token> {
        self.tokens.get(name)
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn last_refreshed(&self) -> DateTime<Utc> {
        self.last_refreshed
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Earliest expiry among all tokens, `None` when there are no tokens
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.tokens.values().map(|token| token.expires_at).min()
    }

    /// Record a token, replacing any token with the same name
    pub fn insert_token(&mut self, name: impl Into<String>, token: Token) {
        self.tokens.insert(name.into(), token);
    }

    /// Fold another session's tokens in without overwriting existing names
    ///
    /// Returns the names that were added.
    pub fn merge(&mut self, other: &Credentials) -> Vec<String> {
        let mut added = Vec::new();
        for (name, token) in &other.tokens {
            if self.tokens.contains_key(name) {
                tracing::debug!("Token '{}' already present, keeping existing value", name);
                continue;
            }
            self.tokens.insert(name.clone(), token.clone());
            added.push(name.clone());
        }
        added
    }
}

/// Auxiliary Microsoft 365 session state
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct M365Resources {
    /// Exchange Online session cookies
    pub exchange_cookies: BTreeMap<String, String>,

    pub validation_key: String,

    pub additional_tokens: BTreeMap<String, String>,
}

impl fmt::Debug for M365Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("M365Resources")
            .field("exchange_cookies", &self.exchange_cookies.keys().collect::<Vec<_>>())
            .field("validation_key", &redacted(&self.validation_key))
            .field(
                "additional_tokens",
                &self.additional_tokens.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Logical service a caller wants a token for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Azure,
    Graph,
    M365,
    MessageTrace,
}

impl Service {
    /// Token names to look up, in order
    ///
    /// Azure falls back to the Graph token when no Azure-specific token was
    /// ever requested.
    pub fn token_names(&self) -> &'static [&'static str] {
        match self {
            Self::Azure => &[AZURE_TOKEN, GRAPH_TOKEN],
            Self::Graph => &[GRAPH_TOKEN],
            Self::M365 => &[EXCHANGE_TOKEN],
            Self::MessageTrace => &[MSGTRACE_TOKEN],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::Graph => "graph",
            Self::M365 => "m365",
            Self::MessageTrace => "msgtrace",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "azure" => Ok(Self::Azure),
            "graph" => Ok(Self::Graph),
            "m365" | "exchange" => Ok(Self::M365),
            "msgtrace" | "message_trace" => Ok(Self::MessageTrace),
            _ => Err(AuthError::UnsupportedService(s.to_string())),
        }
    }
}

/// Backing medium for the credential store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    File,
    Kubernetes,
    Vault,
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Kubernetes => "kubernetes",
            Self::Vault => "vault",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "vault" => Ok(Self::Vault),
            _ => Err(AuthError::UnsupportedStoreType(s.to_string())),
        }
    }
}
