//! Security tests for the linking flow.
//!
//! Covers brute-force protection, account blocks, ownership checks, and error
//! redaction.

use channel_link_auth::{
    AuthError, JwtTokenIssuer, LinkBroker, LinkConfig, LinkEnvironment, SharedClock,
    constants::block_reasons,
    mocks::{ManualClock, MockCredentialResolver, MockDurableStore, MockFastStore},
    state::{AuditAction, AuditStatus},
};
use chrono::Duration;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

type Broker = LinkBroker<MockFastStore, MockDurableStore, MockCredentialResolver, JwtTokenIssuer>;

const EMAIL: &str = "mallory-target@example.com";
const OWNER: &str = "tg:1";
const INTRUDER: &str = "tg:666";

#[allow(clippy::unwrap_used)]
fn broker() -> (ManualClock, MockDurableStore, Broker) {
    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let durable = MockDurableStore::new(Arc::clone(&shared));
    let broker = LinkBroker::new(
        LinkEnvironment::new(
            MockFastStore::new(Arc::clone(&shared)),
            durable.clone(),
            MockCredentialResolver::new().with_account(EMAIL, "user-1", "tenant-1"),
            JwtTokenIssuer::new(b"security-test-signing-key-0123456", Arc::clone(&shared))
                .unwrap(),
            shared,
        ),
        LinkConfig::new("https://app.example.com".to_string()),
    );
    (clock, durable, broker)
}

/// A code that is guaranteed not to match `code`.
fn wrong_code(code: &str) -> &'static str {
    if code == "000000" { "111111" } else { "000000" }
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_code_guessing_is_rate_limited_then_blocked() {
    let (_clock, durable, broker) = broker();
    let grant = broker.start_link(EMAIL, OWNER, "", "").await.unwrap();
    let code = broker.reveal_code(&grant.link_secret).await.unwrap();
    let guess = wrong_code(&code);

    for _ in 0..3 {
        let err = broker
            .complete_link(&grant.link_secret, guess, OWNER)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidVerificationCode);
    }

    let err = broker
        .complete_link(&grant.link_secret, &code, OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::RateLimitExceeded { retry_after } if !retry_after.is_zero()));

    // The identity is now blocked outright.
    let block = broker.blocker().check(OWNER).await.unwrap().unwrap();
    assert_eq!(block.reason, block_reasons::RATE_LIMIT_EXCEEDED);
    assert_eq!(
        broker.start_link(EMAIL, OWNER, "", "").await.unwrap_err(),
        AuthError::AccountBlocked
    );

    broker.flush_audit().await;
    let failed_completions = durable
        .audit_entries()
        .iter()
        .filter(|e| e.action == AuditAction::CompleteLink && e.status == AuditStatus::Failed)
        .count();
    assert_eq!(failed_completions, 4);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_block_expires_and_unblock_lifts_it() {
    let (clock, _durable, broker) = broker();
    broker
        .blocker()
        .block(OWNER, "manual", Some(Duration::minutes(30)))
        .await
        .unwrap();
    assert_eq!(
        broker.start_link(EMAIL, OWNER, "", "").await.unwrap_err(),
        AuthError::AccountBlocked
    );

    clock.advance(Duration::minutes(31));
    assert_ok!(broker.start_link(EMAIL, OWNER, "", "").await);

    broker.blocker().block(OWNER, "manual", None).await.unwrap();
    clock.advance(Duration::days(30));
    assert_err!(broker.start_link(EMAIL, OWNER, "", "").await);

    broker.blocker().unblock(OWNER).await.unwrap();
    assert_ok!(broker.start_link(EMAIL, OWNER, "", "").await);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_blocked_owner_cannot_complete_pending_handshake() {
    let (_clock, durable, broker) = broker();
    let grant = broker.start_link(EMAIL, OWNER, "", "").await.unwrap();
    let code = broker.reveal_code(&grant.link_secret).await.unwrap();

    broker.blocker().block(OWNER, "manual", None).await.unwrap();
    assert_eq!(
        broker
            .complete_link(&grant.link_secret, &code, OWNER)
            .await
            .unwrap_err(),
        AuthError::AccountBlocked
    );
    assert_eq!(durable.session_count(), 0);

    broker.blocker().unblock(OWNER).await.unwrap();
    assert_ok!(broker.complete_link(&grant.link_secret, &code, OWNER).await);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_start_link_cap_per_window() {
    let (clock, _durable, broker) = broker();
    for _ in 0..3 {
        broker.start_link(EMAIL, OWNER, "", "").await.unwrap();
    }
    assert!(matches!(
        broker.start_link(EMAIL, OWNER, "", "").await,
        Err(AuthError::RateLimitExceeded { .. })
    ));

    // Other second-channel users are unaffected.
    broker.start_link(EMAIL, "tg:2", "", "").await.unwrap();

    // A new window does not lift the block the breach created.
    clock.advance(Duration::minutes(10));
    assert_eq!(
        broker.start_link(EMAIL, OWNER, "", "").await.unwrap_err(),
        AuthError::AccountBlocked
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_intruder_cannot_touch_anothers_handshake() {
    let (_clock, durable, broker) = broker();
    let grant = broker.start_link(EMAIL, OWNER, "", "").await.unwrap();
    let code = broker.reveal_code(&grant.link_secret).await.unwrap();

    assert_eq!(
        broker
            .complete_link(&grant.link_secret, &code, INTRUDER)
            .await
            .unwrap_err(),
        AuthError::InvalidLinkToken
    );
    assert_eq!(
        broker.cancel_link(&grant.link_secret, INTRUDER).await.unwrap_err(),
        AuthError::InvalidLinkToken
    );
    assert_eq!(
        broker
            .reveal_code_as(&grant.link_secret, "someone-else@example.com")
            .await
            .unwrap_err(),
        AuthError::InvalidLinkToken
    );

    // The owner is unaffected.
    let done = broker
        .complete_link(&grant.link_secret, &code, OWNER)
        .await
        .unwrap();

    assert_eq!(
        broker.get_session(done.session_id, INTRUDER).await.unwrap_err(),
        AuthError::SessionNotFound
    );
    assert_eq!(
        broker.revoke_session(done.session_id, INTRUDER).await.unwrap_err(),
        AuthError::SessionNotFound
    );
    assert!(broker.list_sessions(INTRUDER).await.unwrap().is_empty());
    assert_eq!(durable.session(done.session_id).unwrap().revoked_at, None);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_unknown_secret_is_indistinguishable() {
    let (_clock, _durable, broker) = broker();
    let forged = channel_link_auth::LinkSecret::new("not-a-real-secret");

    assert_eq!(
        broker.get_link_status(&forged).await.unwrap_err(),
        AuthError::InvalidLinkToken
    );
    assert_eq!(
        broker.complete_link(&forged, "123456", OWNER).await.unwrap_err(),
        AuthError::InvalidLinkToken
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_infrastructure_detail_never_reaches_callers() {
    let (_clock, durable, broker) = broker();
    durable.failures().fail_all(true);

    let err = broker.start_link(EMAIL, OWNER, "", "").await.unwrap_err();

    assert!(!err.is_user_error());
    assert_eq!(err.to_string(), "Internal error");
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_audit_entries_never_carry_secrets() {
    let (_clock, durable, broker) = broker();
    let grant = broker.start_link(EMAIL, OWNER, "", "").await.unwrap();
    let code = broker.reveal_code(&grant.link_secret).await.unwrap();
    broker
        .complete_link(&grant.link_secret, wrong_code(&code), OWNER)
        .await
        .unwrap_err();
    broker.flush_audit().await;

    let dump = format!("{:?}", durable.audit_entries());
    assert!(!dump.contains(grant.link_secret.expose()));
    assert!(!dump.contains(&code));
}
