// Shared test fixtures
// A scripted token acquirer driven by a manual clock

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use goslings::auth::{
    AccessToken, AcquireError, AuthParams, DeviceCodeMessage, Strategy, StrategyOptions,
    TokenAcquirer, TokenCredential, UserPrompt,
};
use goslings::clock::{Clock, ManualClock};

/// What a strategy does when asked for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    Unavailable,
    /// Block until the caller cancels
    Hang,
}

#[derive(Default)]
struct Script {
    outcomes: HashMap<Strategy, Outcome>,
    failing_resources: Vec<String>,
    lifetimes: HashMap<String, Duration>,
    delay: Option<std::time::Duration>,
}

struct Inner {
    clock: ManualClock,
    script: Mutex<Script>,
    attempts: Mutex<Vec<Strategy>>,
    requests: Mutex<Vec<(Strategy, Vec<String>)>>,
    issued: AtomicUsize,
}

/// Acquirer whose per-strategy behavior is scripted by the test
///
/// Successful requests return `tok1`, `tok2`, ... in issue order, expiring one
/// hour after the clock's current time unless a lifetime is set for the resource.
/// Device code requests show the code `FAKE-CODE` through the strategy's prompt.
#[derive(Clone)]
pub struct FakeAcquirer {
    inner: Arc<Inner>,
}

impl FakeAcquirer {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                script: Mutex::new(Script::default()),
                attempts: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                issued: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with(self, strategy: Strategy, outcome: Outcome) -> Self {
        self.set(strategy, outcome);
        self
    }

    pub fn set(&self, strategy: Strategy, outcome: Outcome) {
        self.inner
            .script
            .lock()
            .unwrap()
            .outcomes
            .insert(strategy, outcome);
    }

    /// Every request whose scope starts with `resource` fails
    pub fn fail_resource(self, resource: &str) -> Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .failing_resources
            .push(resource.to_string());
        self
    }

    pub fn lifetime(self, resource: &str, lifetime: Duration) -> Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .lifetimes
            .insert(resource.to_string(), lifetime);
        self
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        self.inner.script.lock().unwrap().delay = Some(delay);
    }

    /// Strategies a credential was built for, in order
    pub fn attempts(&self) -> Vec<Strategy> {
        self.inner.attempts.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(Strategy, Vec<String>)> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn issued(&self) -> usize {
        self.inner.issued.load(Ordering::SeqCst)
    }
}

impl TokenAcquirer for FakeAcquirer {
    fn credential(
        &self,
        strategy: Strategy,
        options: &StrategyOptions,
    ) -> Result<Box<dyn TokenCredential>, AcquireError> {
        self.inner.attempts.lock().unwrap().push(strategy);

        let outcome = self
            .inner
            .script
            .lock()
            .unwrap()
            .outcomes
            .get(&strategy)
            .copied()
            .unwrap_or(Outcome::Fail);

        if outcome == Outcome::Unavailable {
            return Err(AcquireError::Unavailable(format!("{} not available", strategy)));
        }

        Ok(Box::new(FakeCredential {
            inner: self.inner.clone(),
            strategy,
            outcome,
            authority_host: options.authority_host.clone(),
            user_prompt: options.user_prompt.clone(),
        }))
    }
}

struct FakeCredential {
    inner: Arc<Inner>,
    strategy: Strategy,
    outcome: Outcome,
    authority_host: String,
    user_prompt: Option<UserPrompt>,
}

#[async_trait]
impl TokenCredential for FakeCredential {
    async fn get_token(
        &self,
        scopes: &[String],
        cancel: &CancellationToken,
    ) -> Result<AccessToken, AcquireError> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .push((self.strategy, scopes.to_vec()));

        let (failing, lifetime, delay) = {
            let script = self.inner.script.lock().unwrap();
            let scope = scopes.first().cloned().unwrap_or_default();
            let failing = script
                .failing_resources
                .iter()
                .any(|resource| scope.starts_with(resource.as_str()));
            let lifetime = script
                .lifetimes
                .iter()
                .find(|(resource, _)| scope.starts_with(resource.as_str()))
                .map(|(_, lifetime)| *lifetime)
                .unwrap_or_else(|| Duration::hours(1));
            (failing, lifetime, script.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.outcome {
            Outcome::Hang => {
                cancel.cancelled().await;
                Err(AcquireError::Cancelled)
            }
            Outcome::Fail | Outcome::Unavailable => {
                Err(AcquireError::failed(format!("{} refused", self.strategy)))
            }
            Outcome::Succeed if failing => Err(AcquireError::failed("consent required")),
            Outcome::Succeed => {
                if self.strategy == Strategy::DeviceCode {
                    if let Some(prompt) = &self.user_prompt {
                        prompt(&DeviceCodeMessage {
                            user_code: "FAKE-CODE".to_string(),
                            verification_url: format!("{}/device", self.authority_host),
                            message: String::new(),
                        });
                    }
                }
                let n = self.inner.issued.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(AccessToken::bearer(
                    format!("tok{}", n),
                    self.inner.clock.now() + lifetime,
                ))
            }
        }
    }
}

/// Fixed starting instant for deterministic expiry arithmetic
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
}

pub fn secret_params() -> AuthParams {
    AuthParams {
        client_id: "c".to_string(),
        client_secret: "s".to_string(),
        tenant_id: "t".to_string(),
        ..Default::default()
    }
}

pub fn zero_key() -> Vec<u8> {
    vec![0u8; 32]
}
