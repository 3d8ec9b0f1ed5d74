use chrono::Duration;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, Zeroizing};

use super::acquire::{TokenAcquirer, UserPrompt};
use super::lease::{Lease, LeaseProvider, ServiceLease, DEFAULT_STALENESS_CEILING_SECS};
use super::types::{AuthParams, Credentials, M365Resources, Service, StoreType, Token};
use crate::clock::{system_clock, SharedClock};
use crate::error::{AuthError, Result};
use crate::store::{CredentialStore, FileStore, StoreError};

/// Default window before expiry in which `renew_tokens` does any work, in seconds
pub const DEFAULT_RENEWAL_GRACE_SECS: i64 = 300;

/// Construction options for [`AuthManager`]
#[derive(Clone)]
pub struct AuthManagerOptions {
    pub store_type: StoreType,

    /// Directory holding the encrypted blobs
    pub store_path: PathBuf,

    /// 32-byte store key, wiped when the options are dropped
    pub encryption_key: Zeroizing<Vec<u8>>,

    /// Verbose diagnostics for individual strategy attempts
    pub debug: bool,

    /// How close to expiry `renew_tokens` starts renewing
    pub renewal_grace: Duration,

    /// How far past expiry a renewal turns into a fresh acquisition
    pub staleness_ceiling: Duration,

    /// Configure the Microsoft 365 lease
    pub m365: bool,

    /// Append managed identity to the fallback chain
    pub managed_identity: bool,

    pub clock: SharedClock,

    /// Device code display; logged when unset
    pub user_prompt: Option<UserPrompt>,
}

impl AuthManagerOptions {
    pub fn new(store_path: impl Into<PathBuf>, encryption_key: impl Into<Vec<u8>>) -> Self {
        Self {
            store_type: StoreType::File,
            store_path: store_path.into(),
            encryption_key: Zeroizing::new(encryption_key.into()),
            debug: false,
            renewal_grace: Duration::seconds(DEFAULT_RENEWAL_GRACE_SECS),
            staleness_ceiling: Duration::seconds(DEFAULT_STALENESS_CEILING_SECS),
            m365: true,
            managed_identity: false,
            clock: system_clock(),
            user_prompt: None,
        }
    }
}

impl fmt::Debug for AuthManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManagerOptions")
            .field("store_type", &self.store_type)
            .field("store_path", &self.store_path)
            .field("encryption_key", &"[REDACTED]")
            .field("debug", &self.debug)
            .field("renewal_grace", &self.renewal_grace)
            .field("staleness_ceiling", &self.staleness_ceiling)
            .field("m365", &self.m365)
            .field("managed_identity", &self.managed_identity)
            .finish_non_exhaustive()
    }
}

/// Everything guarded by the manager's lock
#[derive(Default)]
struct AuthState {
    params: Option<AuthParams>,
    credentials: Option<Credentials>,
    m365_resources: Option<M365Resources>,
}

/// Authentication manager
/// Owns the leases and the store, and serializes access to cached auth state
pub struct AuthManager {
    /// Persistence backend, absent only for managers assembled without one
    store: Option<Arc<dyn CredentialStore>>,

    /// Leases in evaluation order, primary first
    leases: Vec<(LeaseProvider, Arc<dyn Lease>)>,

    state: RwLock<AuthState>,

    clock: SharedClock,

    renewal_grace: Duration,
}

impl AuthManager {
    /// Create a manager from options, loading any previously persisted state
    pub async fn new(
        options: AuthManagerOptions,
        acquirer: Arc<dyn TokenAcquirer>,
    ) -> Result<Self> {
        let store: Arc<dyn CredentialStore> = match options.store_type {
            StoreType::File => {
                Arc::new(FileStore::new(&options.store_path, &options.encryption_key).await?)
            }
            other => return Err(AuthError::StoreBackendNotImplemented(other)),
        };

        let configure = |lease: ServiceLease| {
            let mut lease = lease
                .with_clock(options.clock.clone())
                .with_staleness_ceiling(options.staleness_ceiling)
                .with_verbose(options.debug);
            if options.managed_identity {
                lease = lease.with_managed_identity();
            }
            if let Some(prompt) = &options.user_prompt {
                lease = lease.with_user_prompt(prompt.clone());
            }
            lease
        };

        let primary: Arc<dyn Lease> = Arc::new(configure(ServiceLease::azure(acquirer.clone())));
        let mut secondary: Vec<Arc<dyn Lease>> = Vec::new();
        if options.m365 {
            secondary.push(Arc::new(configure(ServiceLease::m365(acquirer))));
        }

        tracing::info!(
            "Auth manager using {} store at {}",
            options.store_type,
            options.store_path.display()
        );

        Ok(Self::with_leases(
            Some(store),
            primary,
            secondary,
            options.clock,
            options.renewal_grace,
        )
        .await)
    }

    /// Assemble a manager from explicit parts
    ///
    /// `secondary` leases run after `primary`, in order, and only contribute
    /// token names the primary did not produce.
    pub async fn with_leases(
        store: Option<Arc<dyn CredentialStore>>,
        primary: Arc<dyn Lease>,
        secondary: Vec<Arc<dyn Lease>>,
        clock: SharedClock,
        renewal_grace: Duration,
    ) -> Self {
        let leases = std::iter::once(primary)
            .chain(secondary)
            .map(|lease| (lease.provider(), lease))
            .collect();

        let state = match &store {
            Some(store) => load_state(store.as_ref()).await,
            None => AuthState::default(),
        };

        Self {
            store,
            leases,
            state: RwLock::new(state),
            clock,
            renewal_grace,
        }
    }

    fn primary(&self) -> &(LeaseProvider, Arc<dyn Lease>) {
        &self.leases[0]
    }

    /// Acquire credentials for every enabled lease
    ///
    /// Only the primary lease has to succeed. Secondary tokens are merged in
    /// under their own names and persistence failures are logged.
    pub async fn authenticate(&self, params: AuthParams, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.write().await;

        // Params are only recorded alongside the credentials they produced
        let (primary_provider, primary) = self.primary();
        tracing::info!("[{}] Authenticating", primary_provider);
        let mut creds = primary.acquire(&params, cancel).await?;

        for (provider, lease) in self.leases.iter().skip(1) {
            if !lease.is_enabled(&params) {
                tracing::debug!("[{}] Lease disabled for these parameters", provider);
                continue;
            }
            match lease.acquire(&params, cancel).await {
                Ok(extra) => {
                    let added = creds.merge(&extra);
                    tracing::debug!("[{}] Merged tokens: {:?}", provider, added);
                }
                Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        "[{}] Authentication failed, continuing without it: {}",
                        provider,
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Authenticated via {} ({} token(s), expires {})",
            creds.auth_type(),
            creds.len(),
            fmt_expiry(&creds)
        );

        state.params = Some(params);
        state.credentials = Some(creds);
        self.persist(&state).await;
        Ok(())
    }

    /// Cached bearer token for a service
    ///
    /// `NotAuthenticated` means authenticate first; `CredentialsExpired` means renew.
    pub async fn get_token(&self, service: Service) -> Result<Token> {
        let state = self.state.read().await;

        let creds = match &state.credentials {
            Some(creds) if !creds.is_empty() => creds,
            _ => return Err(AuthError::NotAuthenticated),
        };

        let token = service
            .token_names()
            .iter()
            .find_map(|name| creds.token(name))
            .ok_or(AuthError::TokenNotFound(service))?;

        if token.is_expired_at(self.clock.now()) {
            return Err(AuthError::CredentialsExpired);
        }

        Ok(token.clone())
    }

    /// Renew cached credentials when they are within the renewal grace window
    pub async fn renew_tokens(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.write().await;

        let (creds, params) = match (&state.credentials, &state.params) {
            (Some(creds), Some(params)) if !creds.is_empty() => (creds.clone(), params.clone()),
            _ => return Err(AuthError::NotAuthenticated),
        };

        let (primary_provider, primary) = self.primary();
        if !primary.is_expired(Some(&creds), self.renewal_grace) {
            tracing::debug!(
                "Credentials valid until {}, skipping renewal",
                fmt_expiry(&creds)
            );
            return Ok(());
        }

        tracing::info!("[{}] Renewing credentials", primary_provider);
        let mut renewed = primary.renew(&creds, &params, cancel).await?;

        for (provider, lease) in self.leases.iter().skip(1) {
            if !lease.is_enabled(&params) {
                continue;
            }
            match lease.renew(&creds, &params, cancel).await {
                Ok(extra) => {
                    renewed.merge(&extra);
                }
                Err(AuthError::Cancelled) => return Err(AuthError::Cancelled),
                Err(e) => {
                    tracing::warn!("[{}] Renewal failed, dropping its tokens: {}", provider, e);
                }
            }
        }

        tracing::info!(
            "Renewed credentials via {} (expires {})",
            renewed.auth_type(),
            fmt_expiry(&renewed)
        );

        state.credentials = Some(renewed);
        self.persist(&state).await;
        Ok(())
    }

    /// Wipe persisted and in-memory auth state
    pub async fn clear(&self) -> Result<()> {
        let store = self.store.as_ref().ok_or(AuthError::StoreNotInitialized)?;

        let mut state = self.state.write().await;
        let result = store.clear().await;

        if let Some(params) = state.params.as_mut() {
            params.zeroize();
        }
        *state = AuthState::default();

        result?;
        tracing::info!("Cleared stored credentials");
        Ok(())
    }

    pub async fn get_auth_params(&self) -> Option<AuthParams> {
        self.state.read().await.params.clone()
    }

    pub async fn get_m365_resources(&self) -> Option<M365Resources> {
        self.state.read().await.m365_resources.clone()
    }

    /// Snapshot of the cached credentials
    pub async fn credentials(&self) -> Option<Credentials> {
        self.state.read().await.credentials.clone()
    }

    /// Record auxiliary M365 state and persist it
    pub async fn set_m365_resources(&self, resources: M365Resources) {
        let mut state = self.state.write().await;
        if let Some(store) = &self.store {
            if let Err(e) = store.store_m365_resources(&resources).await {
                tracing::warn!("Failed to save M365 resources: {}", e);
            }
        }
        state.m365_resources = Some(resources);
    }

    /// Whether the cached credentials are expired or will be within `grace`
    pub async fn is_expired(&self, grace: Duration) -> bool {
        let state = self.state.read().await;
        self.primary().1.is_expired(state.credentials.as_ref(), grace)
    }

    /// Best-effort save of everything cached
    async fn persist(&self, state: &AuthState) {
        let Some(store) = &self.store else {
            return;
        };

        if let Some(params) = &state.params {
            if let Err(e) = store.store_params(params).await {
                tracing::warn!("Failed to save parameters: {}", e);
            }
        }
        if let Some(creds) = &state.credentials {
            if let Err(e) = store.store_credentials(creds).await {
                tracing::warn!("Failed to save credentials: {}", e);
            }
        }
        if let Some(resources) = &state.m365_resources {
            if let Err(e) = store.store_m365_resources(resources).await {
                tracing::warn!("Failed to save M365 resources: {}", e);
            }
        }
    }
}

/// Load each aggregate on its own; a failure only loses that aggregate
async fn load_state(store: &dyn CredentialStore) -> AuthState {
    AuthState {
        params: loaded(store.load_params().await),
        credentials: loaded(store.load_credentials().await),
        m365_resources: loaded(store.load_m365_resources().await),
    }
}

fn loaded<T>(result: std::result::Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_not_found() => {
            tracing::debug!("{}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Ignoring stored state: {}", e);
            None
        }
    }
}

fn fmt_expiry(creds: &Credentials) -> String {
    creds
        .expires_at()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}
