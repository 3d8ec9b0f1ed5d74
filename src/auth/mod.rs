// Authentication module
// Credential model, fallback leases and the manager that ties them to the store

mod acquire;
mod command;
mod lease;
mod manager;
mod types;

pub use acquire::{
    log_device_code, AccessToken, AcquireError, DeviceCodeMessage, Strategy, StrategyOptions,
    TokenAcquirer, TokenCredential, UserPrompt,
};
pub use command::{CommandAcquirer, DEFAULT_COMMAND_TIMEOUT_SECS};
pub use lease::{
    is_expired_at, Lease, LeaseProvider, ServiceLease, DEFAULT_STALENESS_CEILING_SECS,
    DEFAULT_STRATEGIES,
};
pub use manager::{AuthManager, AuthManagerOptions, DEFAULT_RENEWAL_GRACE_SECS};
pub use types::{
    AuthParams, AuthType, Credentials, M365Resources, Service, StoreType, Token, AZURE_TOKEN,
    EXCHANGE_TOKEN, GRAPH_TOKEN, MSGTRACE_TOKEN,
};
