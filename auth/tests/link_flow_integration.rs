//! Integration tests for the cross-channel linking flow.

use channel_link_auth::{
    AuthError, JwtTokenIssuer, LinkBroker, LinkConfig, LinkEnvironment, LinkStatus, SharedClock,
    mocks::{ManualClock, MockCredentialResolver, MockDurableStore, MockFastStore},
    state::{AuditAction, AuditStatus},
};
use chrono::Duration;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

type Broker = LinkBroker<MockFastStore, MockDurableStore, MockCredentialResolver, JwtTokenIssuer>;

const EMAIL: &str = "alice@example.com";
const REF: &str = "tg:1001";

struct Harness {
    clock: ManualClock,
    fast: MockFastStore,
    durable: MockDurableStore,
    broker: Broker,
}

/// Create a broker over fresh in-memory stores.
#[allow(clippy::unwrap_used)]
fn harness() -> Harness {
    // Several tests share the process; only the first install wins.
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let clock = ManualClock::default();
    let shared: SharedClock = Arc::new(clock.clone());
    let fast = MockFastStore::new(Arc::clone(&shared));
    let durable = MockDurableStore::new(Arc::clone(&shared));
    let resolver = MockCredentialResolver::new().with_account(EMAIL, "user-alice", "tenant-a");
    let issuer = JwtTokenIssuer::new(b"integration-test-signing-key-0123", Arc::clone(&shared)).unwrap();

    let broker = LinkBroker::new(
        LinkEnvironment::new(fast.clone(), durable.clone(), resolver, issuer, shared),
        LinkConfig::new("https://app.example.com".to_string()),
    );

    Harness {
        clock,
        fast,
        durable,
        broker,
    }
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_link_flow_complete_happy_path() {
    let h = harness();

    // Step 1: second channel starts the handshake
    let grant = h
        .broker
        .start_link("Alice@Example.com", REF, "TelegramBot/1.0", "10.0.0.1")
        .await
        .unwrap();
    assert!(grant.link_url.starts_with("https://app.example.com/link?token="));

    // Step 2: web channel reveals the code
    let code = h.broker.reveal_code_as(&grant.link_secret, EMAIL).await.unwrap();
    assert_eq!(code.len(), 6);

    // Step 3: second channel submits the code
    let done = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap();
    assert_eq!(done.tokens.token_type, "Bearer");

    let claims = h
        .broker
        .tokens()
        .issuer()
        .verify(&done.tokens.access_token)
        .unwrap();
    assert_eq!(claims.sub, "user-alice");
    assert_eq!(claims.tenant_id, "tenant-a");

    // Step 4: the session is usable and the handshake is spent
    let session = h.broker.get_session(done.session_id, REF).await.unwrap();
    assert_eq!(session.subject_user_id, "user-alice");
    assert!(session.last_used_at.is_some());

    let status = h.broker.get_link_status(&grant.link_secret).await.unwrap();
    assert_eq!(status.status, LinkStatus::Completed);
    assert!(!h.fast.contains_code(&grant.link_secret.digest()));

    h.broker.flush_audit().await;
    let page = h.broker.get_audit_log(REF, 10, 0).await.unwrap();
    let actions: Vec<_> = page.entries.iter().map(|e| (e.action, e.status)).collect();
    assert_eq!(
        actions,
        vec![
            (AuditAction::CompleteLink, AuditStatus::Success),
            (AuditAction::StartLink, AuditStatus::Success),
        ]
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_handshake_completes_at_most_once() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();

    h.broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap();
    let replay = h.broker.complete_link(&grant.link_secret, &code, REF).await;

    assert_eq!(replay.unwrap_err(), AuthError::InvalidLinkToken);
    assert_eq!(h.durable.session_count(), 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_concurrent_completions_grant_one_session() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();

    // Latency lets both calls pass the pending check before either claims.
    h.fast
        .failures()
        .set_latency(std::time::Duration::from_millis(5));

    let (first, second) = tokio::join!(
        h.broker.complete_link(&grant.link_secret, &code, REF),
        h.broker.complete_link(&grant.link_secret, &code, REF),
    );

    let winners = [first.is_ok(), second.is_ok()]
        .iter()
        .filter(|ok| **ok)
        .count();
    assert_eq!(winners, 1);

    h.fast.failures().set_latency(std::time::Duration::ZERO);
    let live = h.broker.list_sessions(REF).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(h.durable.redeemable_refresh_count(), 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_expired_handshake_stays_expired() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();

    h.clock.advance(Duration::minutes(6));

    let err = h
        .broker
        .complete_link(&grant.link_secret, "000000", REF)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::LinkExpired);
    assert_eq!(
        h.durable.link_status(&grant.link_secret.digest()),
        Some(LinkStatus::Expired)
    );

    // Winding the clock back never revives it.
    h.clock.advance(Duration::minutes(-6));
    let status = h.broker.get_link_status(&grant.link_secret).await.unwrap();
    assert_eq!(status.status, LinkStatus::Expired);
    assert!(h.broker.cancel_link(&grant.link_secret, REF).await.is_err());
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_cancelled_handshake_cannot_complete() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();

    h.broker.cancel_link(&grant.link_secret, REF).await.unwrap();

    let err = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidLinkToken);
    assert_eq!(
        h.broker.get_link_status(&grant.link_secret).await.unwrap().status,
        LinkStatus::Cancelled
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_failed_session_write_is_compensated() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();

    h.durable.fail_session_inserts(true);
    let err = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::DatabaseError(_)));
    assert_eq!(err.to_string(), "Internal error");

    // Neither store holds the session, and its refresh token is dead.
    assert_eq!(h.durable.session_count(), 0);
    assert_eq!(h.durable.redeemable_refresh_count(), 0);
    assert_eq!(
        h.durable.link_status(&grant.link_secret.digest()),
        Some(LinkStatus::Pending)
    );

    // The handshake is still usable once the store recovers.
    h.durable.fail_session_inserts(false);
    let done = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap();
    assert!(h.fast.contains_session(done.session_id));
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_refresh_rotation_allows_one_concurrent_winner() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();
    let done = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap();
    let refresh = done.tokens.refresh_token.clone();

    let (first, second) = tokio::join!(
        h.broker.refresh_session(done.session_id, &refresh, REF),
        h.broker.refresh_session(done.session_id, &refresh, REF),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AuthError::InvalidCredentials))));

    // The old token is spent for good.
    let replay = h.broker.refresh_session(done.session_id, &refresh, REF).await;
    assert_eq!(replay.unwrap_err(), AuthError::InvalidCredentials);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_revoked_session_is_gone_everywhere() {
    let h = harness();
    let grant = h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();
    let done = h
        .broker
        .complete_link(&grant.link_secret, &code, REF)
        .await
        .unwrap();

    h.broker.revoke_session(done.session_id, REF).await.unwrap();

    assert!(!h.fast.contains_session(done.session_id));
    assert_eq!(
        h.broker.get_session(done.session_id, REF).await.unwrap_err(),
        AuthError::SessionExpired
    );
    assert!(h.broker.list_sessions(REF).await.unwrap().is_empty());
    assert_eq!(
        h.broker.revoke_session(done.session_id, REF).await.unwrap_err(),
        AuthError::SessionExpired
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_cleanup_after_a_day_of_traffic() {
    let h = harness();
    for _ in 0..2 {
        h.broker.start_link(EMAIL, REF, "", "").await.unwrap();
    }
    let grant = h.broker.start_link(EMAIL, "tg:2002", "", "").await.unwrap();
    let code = h.broker.reveal_code(&grant.link_secret).await.unwrap();
    h.broker
        .complete_link(&grant.link_secret, &code, "tg:2002")
        .await
        .unwrap();

    h.clock.advance(Duration::hours(25));
    let report = h.broker.cleanup_expired().await;

    assert_eq!(report.links_purged, 2);
    assert_eq!(report.sessions_revoked, 1);
    assert!(report.failed_steps.is_empty());
    assert!(h.durable.contains_link(&grant.link_secret.digest()));
}
