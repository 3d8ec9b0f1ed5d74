// Command-backed token acquisition
// Delegates each token request to an external executable (a CLI login helper,
// a wrapper around the Azure CLI, ...) and parses the JSON it prints

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::acquire::{
    log_device_code, AccessToken, AcquireError, DeviceCodeMessage, Strategy, StrategyOptions,
    TokenAcquirer, TokenCredential,
};
use crate::clock::{system_clock, SharedClock};

/// Default per-request timeout; interactive strategies wait on a human
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

const MAX_ERROR_SUMMARY: usize = 512;

/// Acquisition capability that runs an executable once per token request
///
/// The request is described through environment variables: `GOSLING_AUTH_STRATEGY`,
/// `GOSLING_TENANT_ID`, `GOSLING_CLIENT_ID`, `GOSLING_CLIENT_SECRET`,
/// `GOSLING_SCOPES` (space separated) and `GOSLING_AUTHORITY_HOST`. The
/// executable prints one JSON object with the token on stdout.
///
/// For the device code strategy the executable may first print single-line
/// JSON objects carrying `user_code` and `verification_url` (or the MSAL
/// spellings `userCode`/`verificationUri`); each one is handed to the
/// configured device code prompt while the executable keeps waiting.
#[derive(Clone)]
pub struct CommandAcquirer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    clock: SharedClock,
}

impl CommandAcquirer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            clock: system_clock(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clock used to resolve relative `expires_in` values
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for CommandAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAcquirer")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TokenAcquirer for CommandAcquirer {
    fn credential(
        &self,
        strategy: Strategy,
        options: &StrategyOptions,
    ) -> Result<Box<dyn TokenCredential>, AcquireError> {
        if self.program.trim().is_empty() {
            return Err(AcquireError::Unavailable(
                "no token command configured".to_string(),
            ));
        }

        Ok(Box::new(CommandCredential {
            acquirer: self.clone(),
            strategy,
            options: options.clone(),
        }))
    }
}

struct CommandCredential {
    acquirer: CommandAcquirer,
    strategy: Strategy,
    options: StrategyOptions,
}

impl CommandCredential {
    fn command(&self, scopes: &[String]) -> Command {
        let mut command = Command::new(&self.acquirer.program);
        command.kill_on_drop(true);
        command.args(&self.acquirer.args);

        command.env("GOSLING_AUTH_STRATEGY", self.strategy.as_str());
        command.env("GOSLING_SCOPES", scopes.join(" "));
        command.env("GOSLING_AUTHORITY_HOST", &self.options.authority_host);
        if let Some(tenant_id) = &self.options.tenant_id {
            command.env("GOSLING_TENANT_ID", tenant_id);
        }
        if let Some(client_id) = &self.options.client_id {
            command.env("GOSLING_CLIENT_ID", client_id);
        }
        // Secrets only travel through the environment, never argv
        if let Some(secret) = &self.options.client_secret {
            command.env("GOSLING_CLIENT_SECRET", secret);
        }

        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        // Interactive helpers talk to the user on stderr
        match self.strategy {
            Strategy::DeviceCode | Strategy::InteractiveBrowser => {
                command.stderr(Stdio::inherit());
            }
            Strategy::ClientSecret | Strategy::ManagedIdentity => {
                command.stderr(Stdio::piped());
            }
        }
        command
    }

    fn show_device_code(&self, message: &DeviceCodeMessage) {
        match &self.options.user_prompt {
            Some(prompt) => prompt(message),
            None => log_device_code(message),
        }
    }

    /// Stream stdout, routing device code lines to the prompt, until the child exits
    async fn run(&self, mut child: Child) -> Result<(ExitStatus, String, String), AcquireError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AcquireError::failed("token command stdout was not captured"))?;
        let stderr = child.stderr.take();

        let read_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = String::new();
            while let Some(line) = lines.next_line().await? {
                if self.strategy == Strategy::DeviceCode {
                    if let Some(message) = parse_device_code_line(&line) {
                        self.show_device_code(&message);
                        continue;
                    }
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok::<_, std::io::Error>(collected)
        };

        let (stdout, stderr) = tokio::join!(read_stdout, read_all(stderr));
        let stdout = stdout.context("failed to read token command output")?;
        let status = child.wait().await.context("token command process failed")?;
        Ok((status, stdout, stderr))
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut reader) = reader {
        let mut bytes = Vec::new();
        if reader.read_to_end(&mut bytes).await.is_ok() {
            text = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    text
}

#[async_trait]
impl TokenCredential for CommandCredential {
    async fn get_token(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AcquireError> {
        let program = &self.acquirer.program;
        let child = self.command(scopes).spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                AcquireError::Unavailable(format!("token command '{}' not found", program))
            } else {
                AcquireError::failed(format!("failed to spawn token command '{}': {}", program, e))
            }
        })?;

        tracing::debug!(
            "Running token command '{}' for {} ({})",
            program,
            self.strategy,
            scopes.join(" ")
        );

        // Dropping the run future drops the child, which kills it
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            result = tokio::time::timeout(self.acquirer.timeout, self.run(child)) => result,
        };

        let (status, stdout, stderr) = output.map_err(|_| {
            AcquireError::failed(format!(
                "token command timed out after {}ms",
                self.acquirer.timeout.as_millis()
            ))
        })??;

        if !status.success() {
            let status = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(AcquireError::failed(format!(
                "token command failed with status {}: {}",
                status,
                summarize_failure(&stderr, &stdout)
            )));
        }

        parse_token_output(&stdout, self.acquirer.clock.now())
    }
}

#[derive(Deserialize)]
struct DeviceCodeLine {
    #[serde(rename = "userCode", alias = "user_code")]
    user_code: String,

    #[serde(
        rename = "verificationUri",
        alias = "verification_uri",
        alias = "verificationUrl",
        alias = "verification_url"
    )]
    verification_url: String,

    #[serde(default)]
    message: Option<String>,
}

/// A device code announcement, if the line is one
pub(crate) fn parse_device_code_line(line: &str) -> Option<DeviceCodeMessage> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let parsed: DeviceCodeLine = serde_json::from_str(line).ok()?;
    if parsed.user_code.trim().is_empty() {
        return None;
    }
    Some(DeviceCodeMessage {
        user_code: parsed.user_code,
        verification_url: parsed.verification_url,
        message: parsed.message.unwrap_or_default(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresOn {
    Unix(i64),
    Text(String),
}

#[derive(Deserialize)]
struct TokenOutput {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: String,

    #[serde(default, rename = "expiresOn", alias = "expires_on")]
    expires_on: Option<ExpiresOn>,

    #[serde(default, rename = "expiresIn", alias = "expires_in")]
    expires_in: Option<i64>,

    #[serde(default, rename = "tokenType", alias = "token_type")]
    token_type: Option<String>,

    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
}

/// Parse the JSON object a token command prints
pub(crate) fn parse_token_output(
    stdout: &str,
    now: DateTime<Utc>,
) -> Result<AccessToken, AcquireError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(AcquireError::failed("token command produced no output"));
    }

    let parsed: TokenOutput =
        serde_json::from_str(trimmed).context("token command output is not a token object")?;

    if parsed.access_token.trim().is_empty() {
        return Err(AcquireError::failed("token command returned an empty token"));
    }

    let expires_on = match (parsed.expires_on, parsed.expires_in) {
        (Some(expires_on), _) => parse_expires_on(&expires_on)?,
        (None, Some(seconds)) => chrono::Duration::try_seconds(seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| AcquireError::failed(format!("expiry out of range: {}s", seconds)))?,
        (None, None) => {
            return Err(AcquireError::failed("token command output has no expiry"));
        }
    };

    Ok(AccessToken {
        token: parsed.access_token,
        expires_on,
        token_type: parsed.token_type,
        refresh_token: parsed.refresh_token,
    })
}

fn parse_expires_on(value: &ExpiresOn) -> Result<DateTime<Utc>, AcquireError> {
    let from_unix = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| AcquireError::failed(format!("expiry out of range: {}", secs)))
    };

    match value {
        ExpiresOn::Unix(secs) => from_unix(*secs),
        ExpiresOn::Text(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(parsed.with_timezone(&Utc));
            }
            // Azure CLI style, in the machine's local time
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
                if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                    return Ok(local.with_timezone(&Utc));
                }
            }
            if let Ok(secs) = text.parse::<i64>() {
                return from_unix(secs);
            }
            Err(AcquireError::failed(format!("unrecognized expiry: {}", text)))
        }
    }
}

fn summarize_failure(stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    let text = if stderr.is_empty() { stdout.trim() } else { stderr };
    if text.is_empty() {
        return "no output".to_string();
    }
    if text.len() <= MAX_ERROR_SUMMARY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_SUMMARY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
