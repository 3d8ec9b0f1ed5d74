use anyhow::{Context, Result};
use chrono::Utc;
use dialoguer::Confirm;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use goslings::auth::{
    AuthManager, AuthParams, CommandAcquirer, DeviceCodeMessage, Service, UserPrompt,
};
use goslings::config::{self, Command, Config};
use goslings::error::AuthError;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;

    // Initialize logging with a configured level; stdout is kept for command output
    let log_level = if config.debug {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    if config.command == Command::Init {
        config::run_interactive_setup(Path::new(".env"))?;
        return Ok(());
    }

    config.validate()?;
    tracing::debug!("Configuration: {:?}", config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling...");
            on_interrupt.cancel();
        }
    });

    let acquirer = CommandAcquirer::new(config.token_command.clone().unwrap_or_default());
    let mut options = config.manager_options()?;
    options.user_prompt = Some(device_code_prompt());

    let manager = AuthManager::new(options, Arc::new(acquirer))
        .await
        .context("Failed to initialize authentication manager")?;

    match &config.command {
        Command::Init => {}
        Command::Login => {
            require_token_command(&config)?;
            let params = login_params(&config, &manager).await;
            manager.authenticate(params, &cancel).await?;
            print_status(&manager).await;
        }
        Command::Token { service } => {
            let service: Service = service.parse()?;
            match manager.get_token(service).await {
                Ok(token) => println!("{}", token.value),
                Err(AuthError::CredentialsExpired) => {
                    anyhow::bail!("Cached {} token has expired, run `goslings renew`", service)
                }
                Err(e) if e.needs_authentication() => {
                    anyhow::bail!("{}, run `goslings login`", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Renew => {
            require_token_command(&config)?;
            manager.renew_tokens(&cancel).await?;
            print_status(&manager).await;
        }
        Command::Status => print_status(&manager).await,
        Command::Clear { yes } => {
            let confirmed = *yes
                || Confirm::new()
                    .with_prompt("Delete all stored credentials?")
                    .default(false)
                    .interact()
                    .context("Failed to read confirmation")?;
            if confirmed {
                manager.clear().await?;
                println!("Stored credentials cleared");
            }
        }
    }

    Ok(())
}

/// Device codes go to stderr so `goslings token` output stays clean
fn device_code_prompt() -> UserPrompt {
    Arc::new(|message: &DeviceCodeMessage| {
        eprintln!();
        if message.message.is_empty() {
            eprintln!(
                "To sign in, open {} and enter the code {}",
                message.verification_url, message.user_code
            );
        } else {
            eprintln!("{}", message.message);
        }
        eprintln!();
    })
}

fn require_token_command(config: &Config) -> Result<()> {
    if config.token_command.is_none() {
        anyhow::bail!("GOSLING_TOKEN_COMMAND is required to acquire tokens");
    }
    Ok(())
}

/// Parameters from the command line, or the stored ones when none were given
async fn login_params(config: &Config, manager: &AuthManager) -> AuthParams {
    if config.params != AuthParams::default() {
        return config.params.clone();
    }
    match manager.get_auth_params().await {
        Some(stored) => {
            tracing::info!("Using stored authentication parameters");
            stored
        }
        None => config.params.clone(),
    }
}

async fn print_status(manager: &AuthManager) {
    let Some(creds) = manager.credentials().await else {
        println!("Not authenticated");
        return;
    };

    let now = Utc::now();
    println!("Authenticated via {}", creds.auth_type());
    println!("Last refreshed: {}", creds.last_refreshed().to_rfc3339());
    if let Some(expires_at) = creds.expires_at() {
        println!("Expires: {}", expires_at.to_rfc3339());
    }
    for (name, token) in creds.tokens() {
        let state = if token.is_expired_at(now) {
            "expired"
        } else {
            "valid"
        };
        println!(
            "  {:<10} {:<8} until {}",
            name,
            state,
            token.expires_at.to_rfc3339()
        );
    }
    if let Some(params) = manager.get_auth_params().await {
        if !params.tenant_id.is_empty() {
            println!("Tenant: {}", params.tenant_id);
        }
        if !params.client_id.is_empty() {
            println!("Client ID: {}", params.client_id);
        }
    }
}
