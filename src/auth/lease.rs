// Lease: ordered-fallback token acquisition and renewal
// Walks a priority list of strategies until one yields every required token

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::acquire::{
    log_device_code, AccessToken, AcquireError, Strategy, StrategyOptions, TokenAcquirer,
    TokenCredential, UserPrompt,
};
use super::types::{
    AuthParams, Credentials, Token, EXCHANGE_TOKEN, GRAPH_TOKEN, MSGTRACE_TOKEN,
};
use crate::clock::{system_clock, SharedClock};
use crate::error::{AuthError, Result};

const COMMERCIAL_AUTHORITY: &str = "https://login.microsoftonline.com";
const GOVERNMENT_AUTHORITY: &str = "https://login.microsoftonline.us";
const COMMERCIAL_GRAPH: &str = "https://graph.microsoft.com";
const GOVERNMENT_GRAPH: &str = "https://graph.microsoft.us";
const COMMERCIAL_EXCHANGE: &str = "https://outlook.office.com";
const GOVERNMENT_EXCHANGE: &str = "https://outlook.office365.us";
const MESSAGE_TRACE: &str = "https://admin.exchange.microsoft.com";

/// How long past expiry a renewal is still a renewal, in seconds
pub const DEFAULT_STALENESS_CEILING_SECS: i64 = 3600;

/// Default priority order of the fallback chain
pub const DEFAULT_STRATEGIES: [Strategy; 3] = [
    Strategy::DeviceCode,
    Strategy::ClientSecret,
    Strategy::InteractiveBrowser,
];

/// Which service a lease obtains credentials for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseProvider {
    Azure,
    M365,
}

impl fmt::Display for LeaseProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Azure => f.write_str("azure"),
            Self::M365 => f.write_str("m365"),
        }
    }
}

/// True when there is nothing usable or `now + grace` has reached the expiry
pub fn is_expired_at(creds: Option<&Credentials>, grace: Duration, now: DateTime<Utc>) -> bool {
    match creds.and_then(Credentials::expires_at) {
        None => true,
        Some(expires_at) => now + grace >= expires_at,
    }
}

/// Acquisition and renewal of one service's credentials
#[async_trait]
pub trait Lease: Send + Sync {
    fn provider(&self) -> LeaseProvider;

    /// Whether this lease takes part for the given parameters
    fn is_enabled(&self, _params: &AuthParams) -> bool {
        true
    }

    /// Acquire a fresh set of credentials
    async fn acquire(&self, params: &AuthParams, cancel: &CancellationToken)
        -> Result<Credentials>;

    /// Renew existing credentials
    async fn renew(
        &self,
        creds: &Credentials,
        params: &AuthParams,
        cancel: &CancellationToken,
    ) -> Result<Credentials>;

    /// Check whether credentials have expired or will within `grace`
    fn is_expired(&self, creds: Option<&Credentials>, grace: Duration) -> bool;
}

/// One token a lease must obtain
#[derive(Debug, Clone, PartialEq, Eq)]
struct TokenSpec {
    name: &'static str,
    resource: String,
    scopes: Vec<String>,
    required: bool,
}

impl TokenSpec {
    fn new(name: &'static str, resource: &str, required: bool) -> Self {
        Self {
            name,
            resource: resource.to_string(),
            scopes: vec![format!("{}/.default", resource)],
            required,
        }
    }
}

/// Fallback-chain lease for a service
pub struct ServiceLease {
    provider: LeaseProvider,
    acquirer: Arc<dyn TokenAcquirer>,
    strategies: Vec<Strategy>,
    clock: SharedClock,
    staleness_ceiling: Duration,
    user_prompt: Option<UserPrompt>,
    verbose: bool,
}

impl ServiceLease {
    fn new(provider: LeaseProvider, acquirer: Arc<dyn TokenAcquirer>) -> Self {
        Self {
            provider,
            acquirer,
            strategies: DEFAULT_STRATEGIES.to_vec(),
            clock: system_clock(),
            staleness_ceiling: Duration::seconds(DEFAULT_STALENESS_CEILING_SECS),
            user_prompt: None,
            verbose: false,
        }
    }

    /// Azure lease, produces the Graph token
    pub fn azure(acquirer: Arc<dyn TokenAcquirer>) -> Self {
        Self::new(LeaseProvider::Azure, acquirer)
    }

    /// Microsoft 365 lease, produces Exchange (and optionally message trace) tokens
    pub fn m365(acquirer: Arc<dyn TokenAcquirer>) -> Self {
        Self::new(LeaseProvider::M365, acquirer)
    }

    /// Replace the fallback chain with an explicit ordering
    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Append managed identity as the last resort
    pub fn with_managed_identity(mut self) -> Self {
        if !self.strategies.contains(&Strategy::ManagedIdentity) {
            self.strategies.push(Strategy::ManagedIdentity);
        }
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_staleness_ceiling(mut self, ceiling: Duration) -> Self {
        self.staleness_ceiling = ceiling;
        self
    }

    pub fn with_user_prompt(mut self, prompt: UserPrompt) -> Self {
        self.user_prompt = Some(prompt);
        self
    }

    /// Report per-strategy failures at info instead of debug
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    fn authority_host(params: &AuthParams) -> &'static str {
        if params.us_government {
            GOVERNMENT_AUTHORITY
        } else {
            COMMERCIAL_AUTHORITY
        }
    }

    fn token_specs(&self, params: &AuthParams) -> Vec<TokenSpec> {
        match self.provider {
            LeaseProvider::Azure => {
                let graph = if params.us_government {
                    GOVERNMENT_GRAPH
                } else {
                    COMMERCIAL_GRAPH
                };
                vec![TokenSpec::new(GRAPH_TOKEN, graph, true)]
            }
            LeaseProvider::M365 => {
                let exchange = if params.exo_us_government {
                    GOVERNMENT_EXCHANGE
                } else {
                    COMMERCIAL_EXCHANGE
                };
                let mut specs = vec![TokenSpec::new(EXCHANGE_TOKEN, exchange, true)];
                if params.message_trace_enabled {
                    specs.push(TokenSpec::new(MSGTRACE_TOKEN, MESSAGE_TRACE, false));
                }
                specs
            }
        }
    }

    /// Build the options a strategy needs, or name the parameters it is missing
    fn strategy_options(
        &self,
        strategy: Strategy,
        params: &AuthParams,
    ) -> std::result::Result<StrategyOptions, Vec<&'static str>> {
        let mut missing = Vec::new();
        let mut require = |value: &str, name: &'static str| {
            if value.trim().is_empty() {
                missing.push(name);
            }
        };

        match strategy {
            Strategy::DeviceCode | Strategy::InteractiveBrowser => {
                require(&params.tenant_id, "tenant ID");
                require(&params.client_id, "client ID");
            }
            Strategy::ClientSecret => {
                require(&params.client_id, "client ID");
                require(&params.client_secret, "client secret");
                require(&params.tenant_id, "tenant ID");
            }
            // System-assigned identities need nothing; a client ID selects a user-assigned one
            Strategy::ManagedIdentity => {}
        }

        if !missing.is_empty() {
            return Err(missing);
        }

        let non_empty = |value: &str| (!value.trim().is_empty()).then(|| value.to_string());

        Ok(StrategyOptions {
            tenant_id: non_empty(&params.tenant_id),
            client_id: non_empty(&params.client_id),
            client_secret: match strategy {
                Strategy::ClientSecret => non_empty(&params.client_secret),
                _ => None,
            },
            authority_host: Self::authority_host(params).to_string(),
            user_prompt: match strategy {
                Strategy::DeviceCode => Some(self.user_prompt.clone().unwrap_or_else(|| {
                    let prompt: UserPrompt = Arc::new(log_device_code);
                    prompt
                })),
                _ => None,
            },
        })
    }

    fn diagnostic(&self, message: &str) {
        if self.verbose {
            tracing::info!("[{}] {}", self.provider, message);
        } else {
            tracing::debug!("[{}] {}", self.provider, message);
        }
    }

    /// Obtain every token in `specs` through one strategy
    async fn try_strategy(
        &self,
        strategy: Strategy,
        options: &StrategyOptions,
        specs: &[TokenSpec],
        cancel: &CancellationToken,
    ) -> std::result::Result<Credentials, AcquireError> {
        let credential = self.acquirer.credential(strategy, options)?;
        let mut creds = Credentials::new(strategy, self.clock.now());

        for spec in specs {
            match request_token(credential.as_ref(), &spec.scopes, cancel).await {
                Ok(access) => {
                    let token = Token {
                        value: access.token,
                        token_type: access.token_type.unwrap_or_else(|| "Bearer".to_string()),
                        expires_at: access.expires_on,
                        refresh_token: access.refresh_token,
                        scopes: spec.scopes.clone(),
                        resource: spec.resource.clone(),
                    };
                    creds.insert_token(spec.name, token);
                }
                Err(AcquireError::Cancelled) => return Err(AcquireError::Cancelled),
                Err(e) if spec.required => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        "[{}] Failed to acquire optional '{}' token: {}",
                        self.provider,
                        spec.name,
                        e
                    );
                }
            }
        }

        Ok(creds)
    }

    /// Walk `strategies` in order, short-circuiting on the first success
    async fn run_chain(
        &self,
        strategies: &[Strategy],
        params: &AuthParams,
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        let specs = self.token_specs(params);
        let mut attempted = 0;
        let mut skipped = 0;

        for &strategy in strategies {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled);
            }

            let options = match self.strategy_options(strategy, params) {
                Ok(options) => options,
                Err(missing) => {
                    skipped += 1;
                    self.diagnostic(&format!(
                        "Skipping {} authentication: {} required",
                        strategy,
                        missing.join(", ")
                    ));
                    continue;
                }
            };

            tracing::info!(
                "[{}] Attempting to authenticate via {}",
                self.provider,
                strategy
            );
            attempted += 1;

            match self.try_strategy(strategy, &options, &specs, cancel).await {
                Ok(creds) => {
                    tracing::debug!(
                        "[{}] Successfully authenticated with {}",
                        self.provider,
                        strategy
                    );
                    return Ok(creds);
                }
                Err(AcquireError::Cancelled) => return Err(AuthError::Cancelled),
                Err(e) => {
                    self.diagnostic(&format!("{} authentication failed: {}", strategy, e));
                }
            }
        }

        Err(AuthError::AllMethodsFailed { attempted, skipped })
    }
}

/// Ask for a token, giving up as soon as the caller cancels
async fn request_token(
    credential: &dyn TokenCredential,
    scopes: &[String],
    cancel: &CancellationToken,
) -> std::result::Result<AccessToken, AcquireError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcquireError::Cancelled),
        result = credential.get_token(scopes, cancel) => result,
    }
}

#[async_trait]
impl Lease for ServiceLease {
    fn provider(&self) -> LeaseProvider {
        self.provider
    }

    fn is_enabled(&self, params: &AuthParams) -> bool {
        match self.provider {
            LeaseProvider::Azure => true,
            LeaseProvider::M365 => params.m365_enabled,
        }
    }

    async fn acquire(
        &self,
        params: &AuthParams,
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        self.run_chain(&self.strategies, params, cancel).await
    }

    async fn renew(
        &self,
        creds: &Credentials,
        params: &AuthParams,
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        tracing::debug!("[{}] Attempting to renew credentials", self.provider);

        if creds.is_empty() {
            return Err(AuthError::NotAuthenticated);
        }

        if let Some(expires_at) = creds.expires_at() {
            if self.clock.now() - expires_at > self.staleness_ceiling {
                tracing::info!(
                    "[{}] Credentials expired too long ago, acquiring new ones",
                    self.provider
                );
                return self.acquire(params, cancel).await;
            }
        }

        let strategy = creds.auth_type();
        match strategy {
            Strategy::DeviceCode | Strategy::InteractiveBrowser => {
                tracing::debug!(
                    "[{}] {} holds no usable refresh token, re-authenticating",
                    self.provider,
                    strategy
                );
            }
            Strategy::ClientSecret | Strategy::ManagedIdentity => {
                tracing::debug!(
                    "[{}] Requesting a fresh token via {}",
                    self.provider,
                    strategy
                );
            }
        }

        let options = self.strategy_options(strategy, params).map_err(|missing| {
            AuthError::RenewalFailed(format!("{} requires {}", strategy, missing.join(", ")))
        })?;

        let specs = self.token_specs(params);
        match self.try_strategy(strategy, &options, &specs, cancel).await {
            Ok(renewed) => Ok(renewed),
            Err(AcquireError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => Err(AuthError::RenewalFailed(e.to_string())),
        }
    }

    fn is_expired(&self, creds: Option<&Credentials>, grace: Duration) -> bool {
        is_expired_at(creds, grace, self.clock.now())
    }
}
