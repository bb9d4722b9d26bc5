//! Periodic cleanup of expired linking state.
//!
//! The fast store expires entries on its own; this reaps the durable copies.

use super::LinkBroker;
use crate::deadline::with_deadline;
use crate::environment::{DurableBackend, FastBackend};
use crate::providers::{CredentialResolver, TokenIssuer};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired handshakes deleted.
    pub links_purged: u64,
    /// Expired sessions revoked.
    pub sessions_revoked: u64,
    /// Rate-limit windows older than an hour deleted.
    pub counters_purged: u64,
    /// Expired blocks deactivated.
    pub blocks_deactivated: u64,
    /// Steps that failed (logged); the rest still ran.
    pub failed_steps: Vec<&'static str>,
}

impl CleanupReport {
    /// Total rows touched.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.links_purged + self.sessions_revoked + self.counters_purged + self.blocks_deactivated
    }
}

impl<F, D, C, I> LinkBroker<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone + 'static,
    I: TokenIssuer + Clone + 'static,
{
    /// Run one cleanup pass over the durable store.
    ///
    /// Each step runs even if an earlier one fails.
    pub async fn cleanup_expired(&self) -> CleanupReport {
        let now = self.now();
        let mut report = CleanupReport::default();

        match with_deadline(
            "cleanup.links",
            self.timeout(),
            self.stores.durable().purge_expired_links(now),
        )
        .await
        {
            Ok(n) => report.links_purged = n,
            Err(err) => {
                tracing::error!(error = %err.detail(), "Failed to purge expired handshakes");
                report.failed_steps.push("links");
            }
        }

        match with_deadline(
            "cleanup.sessions",
            self.timeout(),
            self.stores.durable().revoke_expired_sessions(now),
        )
        .await
        {
            Ok(n) => report.sessions_revoked = n,
            Err(err) => {
                tracing::error!(error = %err.detail(), "Failed to revoke expired sessions");
                report.failed_steps.push("sessions");
            }
        }

        match self.limiter.purge_stale().await {
            Ok(n) => report.counters_purged = n,
            Err(err) => {
                tracing::error!(error = %err.detail(), "Failed to purge rate-limit windows");
                report.failed_steps.push("rate_limits");
            }
        }

        match self.blocker.deactivate_expired().await {
            Ok(n) => report.blocks_deactivated = n,
            Err(err) => {
                tracing::error!(error = %err.detail(), "Failed to deactivate expired blocks");
                report.failed_steps.push("blocks");
            }
        }

        tracing::info!(
            links_purged = report.links_purged,
            sessions_revoked = report.sessions_revoked,
            counters_purged = report.counters_purged,
            blocks_deactivated = report.blocks_deactivated,
            failed_steps = report.failed_steps.len(),
            "Cleanup pass finished"
        );
        report
    }

    /// Run [`Self::cleanup_expired`] every `period` on a background task.
    ///
    /// The first pass runs immediately. Abort the handle to stop.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime, or if `period` is zero.
    #[must_use]
    pub fn spawn_cleanup(&self, period: std::time::Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                broker.cleanup_expired().await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SharedClock;
    use crate::config::LinkConfig;
    use crate::environment::LinkEnvironment;
    use crate::issuer::JwtTokenIssuer;
    use crate::mocks::{ManualClock, MockCredentialResolver, MockDurableStore, MockFastStore};
    use chrono::Duration;
    use std::sync::Arc;

    type Broker = LinkBroker<MockFastStore, MockDurableStore, MockCredentialResolver, JwtTokenIssuer>;

    fn broker() -> (ManualClock, MockDurableStore, Broker) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let durable = MockDurableStore::new(Arc::clone(&shared));
        let broker = LinkBroker::new(
            LinkEnvironment::new(
                MockFastStore::new(Arc::clone(&shared)),
                durable.clone(),
                MockCredentialResolver::new().with_account("u@example.com", "user-1", "tenant-1"),
                JwtTokenIssuer::new(b"0123456789abcdef0123456789abcdef", Arc::clone(&shared))
                    .unwrap(),
                shared,
            ),
            LinkConfig::default(),
        );
        (clock, durable, broker)
    }

    #[tokio::test]
    async fn test_cleanup_reaps_expired_state() {
        let (clock, durable, broker) = broker();
        let grant = broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        broker
            .blocker()
            .block("tg:7", "manual", Some(Duration::minutes(30)))
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        let report = broker.cleanup_expired().await;

        assert_eq!(report.links_purged, 1);
        assert_eq!(report.counters_purged, 1);
        assert_eq!(report.blocks_deactivated, 1);
        assert!(report.failed_steps.is_empty());
        assert!(!durable.contains_link(&grant.link_secret.digest()));
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let (_clock, durable, broker) = broker();
        durable.failures().fail_writes(true);

        let report = broker.cleanup_expired().await;

        assert_eq!(report.failed_steps, vec!["links", "sessions", "rate_limits", "blocks"]);
        assert_eq!(report.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_cleanup_runs_periodically() {
        let (clock, durable, broker) = broker();
        let grant = broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        let hash = grant.link_secret.digest();
        clock.advance(Duration::minutes(10));

        let handle = broker.spawn_cleanup(std::time::Duration::from_secs(60));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        handle.abort();

        assert!(!durable.contains_link(&hash));
    }
}
