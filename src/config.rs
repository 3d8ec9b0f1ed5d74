use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Password};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::auth::{AuthManagerOptions, AuthParams, StoreType};
use crate::store::{EncryptionKey, KEY_LEN};

/// Default directory for the encrypted credential blobs
pub const DEFAULT_STORE_PATH: &str = "~/.config/goslings/credentials";

/// Goslings - Azure and Microsoft 365 credential manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Username for interactive flows
    #[arg(long, env = "GOSLING_USER", global = true)]
    pub username: Option<String>,

    /// Password for interactive flows
    #[arg(long, env = "GOSLING_PASS", global = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Azure AD tenant ID
    #[arg(short = 't', long, env = "GOSLING_TENANT", global = true)]
    pub tenant_id: Option<String>,

    /// Application (client) ID
    #[arg(short = 'c', long, env = "GOSLING_APP_ID", global = true)]
    pub client_id: Option<String>,

    /// Application client secret
    #[arg(long, env = "GOSLING_APP_SECRET", global = true, hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Azure subscription ID
    #[arg(long, env = "GOSLING_SUBSCRIPTION", global = true)]
    pub subscription_id: Option<String>,

    /// Use US Government cloud endpoints
    #[arg(long, env = "GOSLING_USGOV_CLOUD", global = true)]
    pub us_government: bool,

    /// Use US Government Exchange Online endpoints
    #[arg(long, env = "GOSLING_USGOV_EXO", global = true)]
    pub exo_us_government: bool,

    /// Acquire Microsoft 365 (Exchange Online) tokens
    #[arg(long, env = "GOSLING_M365_AUTH", global = true)]
    pub m365: bool,

    /// Also acquire an Exchange message trace token
    #[arg(long, env = "GOSLING_EXO_MSG_TRACE", global = true)]
    pub message_trace: bool,

    /// Append managed identity to the authentication chain
    #[arg(long, env = "GOSLING_MANAGED_IDENTITY", global = true)]
    pub managed_identity: bool,

    /// Credential store backend (file, kubernetes, vault)
    #[arg(long, env = "GOSLING_STORE_TYPE", default_value = "file", global = true)]
    pub store_type: String,

    /// Directory for the encrypted credential store
    #[arg(long, env = "GOSLING_STORE_PATH", default_value = DEFAULT_STORE_PATH, global = true)]
    pub store_path: String,

    /// Base64-encoded 32-byte store encryption key
    #[arg(long, env = "GOSLING_ENCRYPTION_KEY", global = true, hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Executable that performs the actual token requests
    #[arg(long, env = "GOSLING_TOKEN_COMMAND", global = true)]
    pub token_command: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Verbose diagnostics for each authentication method
    #[arg(long, env = "GOSLING_DEBUG", global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Generate an encryption key and write a .env file
    Init,

    /// Authenticate and store the resulting credentials
    Login,

    /// Print a cached token for a service (azure, graph, m365, msgtrace)
    Token { service: String },

    /// Renew the cached credentials if they are close to expiry
    Renew,

    /// Show what is cached and when it expires
    Status,

    /// Delete all stored credentials
    Clear {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Clone)]
pub struct Config {
    pub command: Command,

    // Authentication
    pub params: AuthParams,
    pub managed_identity: bool,
    pub token_command: Option<String>,

    // Store
    pub store_type: StoreType,
    pub store_path: PathBuf,
    pub encryption_key: Option<Zeroizing<Vec<u8>>>,

    // Debug
    pub log_level: String,
    pub debug: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("command", &self.command)
            .field("params", &self.params)
            .field("managed_identity", &self.managed_identity)
            .field("token_command", &self.token_command)
            .field("store_type", &self.store_type)
            .field("store_path", &self.store_path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("log_level", &self.log_level)
            .field("debug", &self.debug)
            .finish()
    }
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let store_type: StoreType = args.store_type.parse()?;

        let encryption_key = args
            .encryption_key
            .as_deref()
            .map(decode_key)
            .transpose()?;

        let params = AuthParams {
            username: args.username.unwrap_or_default(),
            password: args.password.unwrap_or_default(),
            tenant_id: args.tenant_id.unwrap_or_default(),
            client_id: args.client_id.unwrap_or_default(),
            client_secret: args.client_secret.unwrap_or_default(),
            subscription_id: args.subscription_id.unwrap_or_default(),
            us_government: args.us_government,
            exo_us_government: args.exo_us_government,
            m365_enabled: args.m365,
            message_trace_enabled: args.message_trace,
        };

        Ok(Config {
            command: args.command,
            params,
            managed_identity: args.managed_identity,
            token_command: args.token_command.filter(|c| !c.trim().is_empty()),
            store_type,
            store_path: expand_tilde(&args.store_path),
            encryption_key,
            log_level: args.log_level,
            debug: args.debug,
        })
    }

    /// Validate configuration needed to open the store
    pub fn validate(&self) -> Result<()> {
        if self.store_path.as_os_str().is_empty() {
            anyhow::bail!("GOSLING_STORE_PATH cannot be empty");
        }

        match &self.encryption_key {
            None => anyhow::bail!(
                "GOSLING_ENCRYPTION_KEY is required (run `goslings init` to generate one)"
            ),
            Some(key) if key.len() != KEY_LEN => anyhow::bail!(
                "GOSLING_ENCRYPTION_KEY must decode to exactly {} bytes, got {}",
                KEY_LEN,
                key.len()
            ),
            Some(_) => Ok(()),
        }
    }

    /// Options for constructing the auth manager
    pub fn manager_options(&self) -> Result<AuthManagerOptions> {
        let key = self
            .encryption_key
            .as_ref()
            .context("GOSLING_ENCRYPTION_KEY is required")?;

        let mut options = AuthManagerOptions::new(&self.store_path, key.to_vec());
        options.store_type = self.store_type;
        options.debug = self.debug;
        options.managed_identity = self.managed_identity;
        Ok(options)
    }
}

/// Decode a base64 store key
fn decode_key(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map(Zeroizing::new)
        .context("GOSLING_ENCRYPTION_KEY is not valid base64")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// === Interactive Setup ===

/// Configuration collected from interactive setup
#[derive(Clone)]
pub struct InteractiveConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
    pub store_path: String,
    pub m365_enabled: bool,
    pub us_government: bool,
    pub encryption_key: Zeroizing<String>,
}

/// Run interactive setup: generate a store key and collect app registration details
pub fn run_interactive_setup(env_path: &Path) -> Result<InteractiveConfig> {
    println!();
    println!("Goslings - First Time Setup");
    println!();

    if env_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite it?", env_path.display()))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !overwrite {
            anyhow::bail!("Setup aborted, {} left untouched", env_path.display());
        }
    }

    let tenant_id: String = Input::new()
        .with_prompt("Azure AD tenant ID (GOSLING_TENANT)")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read GOSLING_TENANT")?;

    let client_id: String = Input::new()
        .with_prompt("Application (client) ID (GOSLING_APP_ID)")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read GOSLING_APP_ID")?;

    let client_secret = Zeroizing::new(
        Password::new()
            .with_prompt("Client secret, leave empty for device code login (GOSLING_APP_SECRET)")
            .allow_empty_password(true)
            .interact()
            .context("Failed to read GOSLING_APP_SECRET")?,
    );

    let store_path: String = Input::new()
        .with_prompt("Credential store directory")
        .default(DEFAULT_STORE_PATH.to_string())
        .interact_text()
        .context("Failed to read store path")?;

    let m365_enabled = Confirm::new()
        .with_prompt("Also acquire Microsoft 365 (Exchange Online) tokens?")
        .default(false)
        .interact()
        .context("Failed to read M365 selection")?;

    let us_government = Confirm::new()
        .with_prompt("Use US Government cloud endpoints?")
        .default(false)
        .interact()
        .context("Failed to read cloud selection")?;

    let key = EncryptionKey::generate();
    let encryption_key =
        Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(key.as_bytes()));

    let config = InteractiveConfig {
        tenant_id,
        client_id,
        client_secret,
        store_path,
        m365_enabled,
        us_government,
        encryption_key,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt(format!("Save configuration to {}?", env_path.display()))
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config, env_path)?;
        println!();
        println!("Configuration saved to {}", env_path.display());
    } else {
        println!();
        println!("Keep this key, it is the only way to read the credential store:");
        println!("GOSLING_ENCRYPTION_KEY={}", config.encryption_key.as_str());
    }

    println!();
    println!("Setup complete! Run `goslings login` to authenticate.");
    println!();

    Ok(config)
}

/// Quote a value so dotenv parsing returns it verbatim
fn env_value(value: &str) -> String {
    if !value.contains('\'') {
        return format!("'{}'", value);
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$");
    format!("\"{}\"", escaped)
}

fn render_env_file(config: &InteractiveConfig) -> Zeroizing<String> {
    Zeroizing::new(format!(
        r#"# Goslings Configuration
# Generated by interactive setup

# Store encryption key (required, base64 of 32 bytes)
GOSLING_ENCRYPTION_KEY={}

# Credential store
GOSLING_STORE_TYPE=file
GOSLING_STORE_PATH={}

# App registration
GOSLING_TENANT={}
GOSLING_APP_ID={}
GOSLING_APP_SECRET={}

# Cloud and services
GOSLING_USGOV_CLOUD={}
GOSLING_M365_AUTH={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        env_value(&config.encryption_key),
        env_value(&config.store_path),
        env_value(&config.tenant_id),
        env_value(&config.client_id),
        env_value(&config.client_secret),
        config.us_government,
        config.m365_enabled,
    ))
}

/// Save configuration to a .env file readable only by the owner
fn save_env_file(config: &InteractiveConfig, path: &Path) -> Result<()> {
    let env_content = render_env_file(config);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(env_content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}
