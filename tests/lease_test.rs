// Integration tests for the fallback lease
//
// Drive ServiceLease through a scripted acquirer to check chain ordering,
// skip-versus-fail accounting, cancellation and the renewal policy.

mod common;

use chrono::Duration;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use common::{secret_params, t0, FakeAcquirer, Outcome};
use goslings::auth::{
    is_expired_at, AuthParams, AuthType, Credentials, DeviceCodeMessage, Lease, ServiceLease,
    Strategy, Token, EXCHANGE_TOKEN, GRAPH_TOKEN, MSGTRACE_TOKEN,
};
use goslings::clock::ManualClock;
use goslings::error::AuthError;

// ==================================================================================================
// Test Helpers
// ==================================================================================================

fn azure_lease(fake: &FakeAcquirer, clock: &ManualClock) -> ServiceLease {
    ServiceLease::azure(Arc::new(fake.clone())).with_clock(Arc::new(clock.clone()))
}

fn m365_lease(fake: &FakeAcquirer, clock: &ManualClock) -> ServiceLease {
    ServiceLease::m365(Arc::new(fake.clone())).with_clock(Arc::new(clock.clone()))
}

fn m365_params() -> AuthParams {
    AuthParams {
        m365_enabled: true,
        message_trace_enabled: true,
        ..secret_params()
    }
}

// ==================================================================================================
// Acquire
// ==================================================================================================

#[tokio::test]
async fn test_fallback_stops_at_first_success() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Fail)
        .with(Strategy::ClientSecret, Outcome::Succeed)
        .with(Strategy::InteractiveBrowser, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let creds = lease
        .acquire(&secret_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.auth_type(), AuthType::ClientSecret);
    assert_eq!(creds.len(), 1);
    let graph = creds.token(GRAPH_TOKEN).unwrap();
    assert_eq!(graph.value, "tok1");
    assert_eq!(graph.resource, "https://graph.microsoft.com");
    assert_eq!(graph.scopes, vec!["https://graph.microsoft.com/.default"]);
    assert_eq!(creds.expires_at(), Some(t0() + Duration::hours(1)));
    assert_eq!(creds.last_refreshed(), t0());

    // Interactive browser is never reached
    assert_eq!(
        fake.attempts(),
        vec![Strategy::DeviceCode, Strategy::ClientSecret]
    );
}

#[tokio::test]
async fn test_missing_secret_is_skipped_not_failed() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone());
    let lease = azure_lease(&fake, &clock);

    let params = AuthParams {
        client_secret: String::new(),
        ..secret_params()
    };
    let err = lease
        .acquire(&params, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::AllMethodsFailed {
            attempted: 2,
            skipped: 1
        }
    ));
    assert_eq!(
        fake.attempts(),
        vec![Strategy::DeviceCode, Strategy::InteractiveBrowser]
    );
}

#[tokio::test]
async fn test_everything_skipped_without_parameters() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let err = lease
        .acquire(&AuthParams::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::AllMethodsFailed {
            attempted: 0,
            skipped: 3
        }
    ));
    assert!(fake.attempts().is_empty());
}

#[tokio::test]
async fn test_unavailable_strategy_falls_through() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Unavailable)
        .with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let creds = lease
        .acquire(&secret_params(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(creds.auth_type(), AuthType::ClientSecret);
}

#[tokio::test]
async fn test_custom_strategy_order() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::InteractiveBrowser, Outcome::Succeed)
        .with(Strategy::DeviceCode, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock)
        .with_strategies(vec![Strategy::InteractiveBrowser, Strategy::DeviceCode]);

    let creds = lease
        .acquire(&secret_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.auth_type(), AuthType::InteractiveBrowser);
    assert_eq!(fake.attempts(), vec![Strategy::InteractiveBrowser]);
}

#[tokio::test]
async fn test_managed_identity_is_last_resort() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ManagedIdentity, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock).with_managed_identity();

    let creds = lease
        .acquire(&AuthParams::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.auth_type(), AuthType::ManagedIdentity);
    assert_eq!(fake.attempts(), vec![Strategy::ManagedIdentity]);
}

#[tokio::test]
async fn test_government_cloud_scopes() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::DeviceCode, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let params = AuthParams {
        us_government: true,
        ..secret_params()
    };
    lease
        .acquire(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        fake.requests(),
        vec![(
            Strategy::DeviceCode,
            vec!["https://graph.microsoft.us/.default".to_string()]
        )]
    );
}

#[tokio::test]
async fn test_device_code_prompt_is_shown() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::DeviceCode, Outcome::Succeed);
    let shown: Arc<Mutex<Vec<DeviceCodeMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = shown.clone();
    let lease = azure_lease(&fake, &clock).with_user_prompt(Arc::new(
        move |message: &DeviceCodeMessage| sink.lock().unwrap().push(message.clone()),
    ));

    let creds = lease
        .acquire(&secret_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.auth_type(), AuthType::DeviceCode);
    let shown = shown.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].user_code, "FAKE-CODE");
    assert_eq!(
        shown[0].verification_url,
        "https://login.microsoftonline.com/device"
    );
}

#[tokio::test]
async fn test_device_code_prompt_unused_by_other_strategies() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let shown = Arc::new(AtomicUsize::new(0));
    let counter = shown.clone();
    let lease = azure_lease(&fake, &clock).with_user_prompt(Arc::new(
        move |_: &DeviceCodeMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    ));

    let creds = lease
        .acquire(&secret_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.auth_type(), AuthType::ClientSecret);
    assert_eq!(shown.load(Ordering::SeqCst), 0);
}

// ==================================================================================================
// Cancellation
// ==================================================================================================

#[tokio::test]
async fn test_cancellation_mid_chain_aborts_remaining_strategies() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Hang)
        .with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = lease.acquire(&secret_params(), &cancel).await.unwrap_err();

    assert!(matches!(err, AuthError::Cancelled));
    assert_eq!(fake.attempts(), vec![Strategy::DeviceCode]);
}

#[tokio::test]
async fn test_already_cancelled_attempts_nothing() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = lease.acquire(&secret_params(), &cancel).await.unwrap_err();
    assert!(matches!(err, AuthError::Cancelled));
    assert!(fake.attempts().is_empty());
}

// ==================================================================================================
// Renew
// ==================================================================================================

#[tokio::test]
async fn test_client_secret_renewal_requests_fresh_token() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();
    clock.advance(Duration::minutes(58));

    let renewed = lease.renew(&creds, &secret_params(), &cancel).await.unwrap();

    assert_eq!(renewed.auth_type(), AuthType::ClientSecret);
    assert_eq!(renewed.token(GRAPH_TOKEN).unwrap().value, "tok2");
    assert_eq!(
        renewed.expires_at(),
        Some(t0() + Duration::minutes(58) + Duration::hours(1))
    );
    // Renewal goes straight to the recorded strategy
    assert_eq!(
        fake.attempts(),
        vec![
            Strategy::DeviceCode,
            Strategy::ClientSecret,
            Strategy::ClientSecret
        ]
    );
}

#[tokio::test]
async fn test_device_code_renewal_reacquires_with_same_strategy() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Succeed)
        .with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();
    assert_eq!(creds.auth_type(), AuthType::DeviceCode);

    clock.advance(Duration::minutes(59));
    let renewed = lease.renew(&creds, &secret_params(), &cancel).await.unwrap();

    assert_eq!(renewed.auth_type(), AuthType::DeviceCode);
    assert_eq!(
        fake.attempts(),
        vec![Strategy::DeviceCode, Strategy::DeviceCode]
    );
}

#[tokio::test]
async fn test_renewal_exactly_at_ceiling_still_renews() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();

    // Expired one hour ago, not more
    clock.advance(Duration::hours(2));
    lease.renew(&creds, &secret_params(), &cancel).await.unwrap();

    assert_eq!(
        fake.attempts(),
        vec![
            Strategy::DeviceCode,
            Strategy::ClientSecret,
            Strategy::ClientSecret
        ]
    );
}

#[tokio::test]
async fn test_stale_credentials_fall_back_to_full_acquire() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();

    clock.advance(Duration::hours(2) + Duration::seconds(1));
    let renewed = lease.renew(&creds, &secret_params(), &cancel).await.unwrap();

    assert_eq!(renewed.auth_type(), AuthType::ClientSecret);
    // The whole chain runs again, device code first
    assert_eq!(
        fake.attempts(),
        vec![
            Strategy::DeviceCode,
            Strategy::ClientSecret,
            Strategy::DeviceCode,
            Strategy::ClientSecret
        ]
    );
}

#[tokio::test]
async fn test_failed_renewal_is_renewal_failed() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();
    fake.set(Strategy::ClientSecret, Outcome::Fail);

    let err = lease
        .renew(&creds, &secret_params(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RenewalFailed(_)));
}

#[tokio::test]
async fn test_renewal_without_parameters_fails() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone()).with(Strategy::ClientSecret, Outcome::Succeed);
    let lease = azure_lease(&fake, &clock);
    let cancel = CancellationToken::new();

    let creds = lease.acquire(&secret_params(), &cancel).await.unwrap();
    let err = lease
        .renew(&creds, &AuthParams::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RenewalFailed(_)));
}

// ==================================================================================================
// Microsoft 365 profile
// ==================================================================================================

#[tokio::test]
async fn test_m365_acquires_exchange_and_message_trace() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Succeed)
        .lifetime("https://admin.exchange.microsoft.com", Duration::minutes(30));
    let lease = m365_lease(&fake, &clock);

    let creds = lease
        .acquire(&m365_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.len(), 2);
    assert_eq!(
        creds.token(EXCHANGE_TOKEN).unwrap().resource,
        "https://outlook.office.com"
    );
    assert!(creds.token(MSGTRACE_TOKEN).is_some());
    assert_eq!(creds.expires_at(), Some(t0() + Duration::minutes(30)));
    // Both tokens come from one credential object
    assert_eq!(fake.attempts(), vec![Strategy::DeviceCode]);
}

#[tokio::test]
async fn test_m365_message_trace_failure_is_tolerated() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Succeed)
        .fail_resource("https://admin.exchange.microsoft.com");
    let lease = m365_lease(&fake, &clock);

    let creds = lease
        .acquire(&m365_params(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(creds.len(), 1);
    assert!(creds.token(EXCHANGE_TOKEN).is_some());
    assert!(creds.token(MSGTRACE_TOKEN).is_none());
}

#[tokio::test]
async fn test_m365_exchange_failure_moves_to_next_strategy() {
    let clock = ManualClock::new(t0());
    let fake = FakeAcquirer::new(clock.clone())
        .with(Strategy::DeviceCode, Outcome::Succeed)
        .with(Strategy::ClientSecret, Outcome::Succeed)
        .fail_resource("https://outlook.office.com");
    let lease = m365_lease(&fake, &clock);

    let err = lease
        .acquire(&m365_params(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AuthError::AllMethodsFailed {
            attempted: 3,
            skipped: 0
        }
    ));
}

// ==================================================================================================
// Properties
// ==================================================================================================

fn token_expiring_in(minutes: i64) -> Token {
    Token {
        value: format!("v{}", minutes),
        token_type: "Bearer".to_string(),
        expires_at: t0() + Duration::minutes(minutes),
        refresh_token: None,
        scopes: vec![],
        resource: String::new(),
    }
}

proptest! {
    #[test]
    fn prop_expires_at_is_minimum_after_merge(
        primary in proptest::collection::vec(-120i64..600, 1..5),
        secondary in proptest::collection::vec(-120i64..600, 0..5),
    ) {
        let mut creds = Credentials::new(AuthType::DeviceCode, t0());
        for (i, minutes) in primary.iter().enumerate() {
            creds.insert_token(format!("p{}", i), token_expiring_in(*minutes));
        }
        let mut extra = Credentials::new(AuthType::DeviceCode, t0());
        for (i, minutes) in secondary.iter().enumerate() {
            // Overlapping names exercise the never-overwrite rule
            extra.insert_token(format!("p{}", i + 2), token_expiring_in(*minutes));
        }

        creds.merge(&extra);

        let expected = creds.tokens().values().map(|t| t.expires_at).min();
        prop_assert_eq!(creds.expires_at(), expected);
        for (i, minutes) in primary.iter().enumerate() {
            prop_assert_eq!(
                creds.token(&format!("p{}", i)).unwrap().expires_at,
                t0() + Duration::minutes(*minutes)
            );
        }
    }

    #[test]
    fn prop_is_expired_iff_within_grace(offset in -7200i64..7200, grace in 0i64..3600) {
        let mut creds = Credentials::new(AuthType::ClientSecret, t0());
        creds.insert_token(GRAPH_TOKEN, Token {
            expires_at: t0() + Duration::seconds(offset),
            ..token_expiring_in(0)
        });

        let expired = is_expired_at(Some(&creds), Duration::seconds(grace), t0());
        prop_assert_eq!(expired, grace >= offset);
    }

    #[test]
    fn prop_acquired_expiry_is_earliest_token(
        exchange_minutes in 1i64..600,
        trace_minutes in 1i64..600,
    ) {
        let clock = ManualClock::new(t0());
        let fake = FakeAcquirer::new(clock.clone())
            .with(Strategy::DeviceCode, Outcome::Succeed)
            .lifetime("https://outlook.office.com", Duration::minutes(exchange_minutes))
            .lifetime("https://admin.exchange.microsoft.com", Duration::minutes(trace_minutes));
        let lease = m365_lease(&fake, &clock);

        let creds = tokio_test::block_on(lease.acquire(&m365_params(), &CancellationToken::new()))
            .unwrap();

        prop_assert_eq!(
            creds.expires_at(),
            Some(t0() + Duration::minutes(exchange_minutes.min(trace_minutes)))
        );
    }
}
