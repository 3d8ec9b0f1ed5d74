// Goslings - Library root
// Credential lifecycle engine for Azure and Microsoft 365 clients

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;

pub use auth::{AuthManager, AuthManagerOptions, Service};
pub use error::{AuthError, Result};
