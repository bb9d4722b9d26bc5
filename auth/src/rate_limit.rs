//! Fixed-window rate limiting.
//!
//! # Algorithm
//!
//! Counters are keyed by `(identity, action, window_start)` where
//! `window_start = floor(now / 10min) * 10min`:
//! 1. Read the current window's counter from the fast store
//! 2. Read the six windows covering the last hour (the hourly cap)
//! 3. Reject once either count has reached its cap
//! 4. Successful and failed attempts increment the counter afterwards
//!
//! Windows do not slide: a burst straddling a window edge can reach up to twice
//! the per-window cap. This is accepted behaviour.
//!
//! # Security
//!
//! The fast store is authoritative; a fast-store outage fails the check closed.
//! The durable copy is a best-effort mirror for analytics.

use crate::clock::SharedClock;
use crate::config::LinkConfig;
use crate::constants::{COUNTER_RETENTION, RATE_WINDOW, WINDOWS_PER_HOUR};
use crate::deadline::with_deadline;
use crate::error::Result;
use crate::providers::AttemptCounter;
use crate::state::{RateAction, RateLimitKey};
use chrono::{DateTime, Duration, Utc};

/// Caps applied per identity and action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Window length.
    pub window: Duration,
    /// Attempts allowed in one window.
    pub max_per_window: u32,
    /// Attempts allowed across the last hour of windows.
    pub max_per_hour: u32,
}

impl RateLimitPolicy {
    /// Policy from the linking configuration.
    #[must_use]
    pub const fn from_config(config: &LinkConfig) -> Self {
        Self {
            window: RATE_WINDOW,
            max_per_window: config.max_attempts_per_10min,
            max_per_hour: config.max_attempts_per_hour,
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Below both caps.
    Allowed {
        /// Attempts so far in the current window.
        in_window: u64,
    },
    /// A cap has been reached.
    Exceeded {
        /// Time until the current window closes.
        retry_after: std::time::Duration,
    },
}

/// Rate limiter over a fast and a durable attempt counter.
#[derive(Clone)]
pub struct RateLimiter<F, D> {
    fast: F,
    durable: D,
    policy: RateLimitPolicy,
    clock: SharedClock,
    timeout: std::time::Duration,
}

impl<F, D> RateLimiter<F, D>
where
    F: AttemptCounter,
    D: AttemptCounter,
{
    /// Create a rate limiter.
    #[must_use]
    pub fn new(
        fast: F,
        durable: D,
        policy: RateLimitPolicy,
        clock: SharedClock,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            fast,
            durable,
            policy,
            clock,
            timeout,
        }
    }

    /// Attempts recorded in the current window, without incrementing.
    ///
    /// # Errors
    ///
    /// Returns error if the fast store is unreachable.
    pub async fn peek(&self, identity: &str, action: RateAction) -> Result<u64> {
        let key = self.current_key(identity, action);
        with_deadline(
            "rate_limit.peek",
            self.timeout,
            self.fast.sum_counts(std::slice::from_ref(&key)),
        )
        .await
    }

    /// Check both caps for `identity` and `action`.
    ///
    /// # Errors
    ///
    /// Returns error if the fast store is unreachable (fail closed).
    pub async fn check(&self, identity: &str, action: RateAction) -> Result<RateDecision> {
        let now = self.clock.now();
        let current = RateLimitKey::containing(identity, action, now, self.policy.window);
        let retry_after = self.retry_after(current.window_start, now);

        let in_window = with_deadline(
            "rate_limit.check",
            self.timeout,
            self.fast.sum_counts(std::slice::from_ref(&current)),
        )
        .await?;
        if in_window >= u64::from(self.policy.max_per_window) {
            tracing::warn!(
                identity = %identity,
                action = action.as_str(),
                count = in_window,
                "Rate limit exceeded for window"
            );
            return Ok(RateDecision::Exceeded { retry_after });
        }

        let hour: Vec<RateLimitKey> = (0..WINDOWS_PER_HOUR)
            .map(|n| current.previous(n, self.policy.window))
            .collect();
        let in_hour =
            with_deadline("rate_limit.check", self.timeout, self.fast.sum_counts(&hour)).await?;
        if in_hour >= u64::from(self.policy.max_per_hour) {
            tracing::warn!(
                identity = %identity,
                action = action.as_str(),
                count = in_hour,
                "Hourly rate limit exceeded"
            );
            return Ok(RateDecision::Exceeded { retry_after });
        }

        Ok(RateDecision::Allowed { in_window })
    }

    /// Record one attempt in both stores.
    ///
    /// Best-effort: failures are logged and never surface. Returns the new fast
    /// count when available.
    pub async fn record(&self, identity: &str, action: RateAction) -> Option<u64> {
        let key = self.current_key(identity, action);

        let fast = with_deadline(
            "rate_limit.increment",
            self.timeout,
            self.fast.increment(&key, COUNTER_RETENTION),
        )
        .await;
        let durable = with_deadline(
            "rate_limit.increment",
            self.timeout,
            self.durable.increment(&key, COUNTER_RETENTION),
        )
        .await;

        if let Err(err) = &durable {
            tracing::warn!(
                action = action.as_str(),
                error = %err.detail(),
                "Durable rate-limit mirror not updated"
            );
        }
        match fast {
            Ok(count) => Some(count),
            Err(err) => {
                tracing::warn!(
                    action = action.as_str(),
                    error = %err.detail(),
                    "Rate-limit attempt not recorded"
                );
                None
            }
        }
    }

    /// Drop durable windows older than the hourly horizon.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store is unreachable.
    pub async fn purge_stale(&self) -> Result<u64> {
        let cutoff = self.clock.now() - COUNTER_RETENTION;
        with_deadline(
            "rate_limit.purge",
            self.timeout,
            self.durable.purge_windows_before(cutoff),
        )
        .await
    }

    fn current_key(&self, identity: &str, action: RateAction) -> RateLimitKey {
        RateLimitKey::containing(identity, action, self.clock.now(), self.policy.window)
    }

    fn retry_after(&self, window_start: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
        (window_start + self.policy.window - now)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mocks::{ManualClock, MockDurableStore, MockFastStore};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn limiter(per_window: u32, per_hour: u32) -> (ManualClock, RateLimiter<MockFastStore, MockDurableStore>) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let limiter = RateLimiter::new(
            MockFastStore::new(Arc::clone(&shared)),
            MockDurableStore::new(Arc::clone(&shared)),
            RateLimitPolicy {
                window: RATE_WINDOW,
                max_per_window: per_window,
                max_per_hour: per_hour,
            },
            shared,
            std::time::Duration::from_secs(1),
        );
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_window_cap() {
        let (_clock, limiter) = limiter(3, 10);

        for expected in 1..=3 {
            assert!(matches!(
                limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
                RateDecision::Allowed { .. }
            ));
            assert_eq!(limiter.record("tg:1", RateAction::StartLink).await, Some(expected));
        }

        assert!(matches!(
            limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
            RateDecision::Exceeded { .. }
        ));
        assert_eq!(limiter.peek("tg:1", RateAction::StartLink).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_identities_and_actions_are_independent() {
        let (_clock, limiter) = limiter(1, 10);
        limiter.record("tg:1", RateAction::StartLink).await;

        assert!(matches!(
            limiter.check("tg:2", RateAction::StartLink).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("tg:1", RateAction::CompleteLink).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_window_resets_at_boundary() {
        let (clock, limiter) = limiter(2, 10);
        limiter.record("tg:1", RateAction::StartLink).await;
        limiter.record("tg:1", RateAction::StartLink).await;
        assert!(matches!(
            limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
            RateDecision::Exceeded { .. }
        ));

        clock.advance(Duration::minutes(10));
        assert_eq!(limiter.peek("tg:1", RateAction::StartLink).await.unwrap(), 0);
        assert!(matches!(
            limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
            RateDecision::Allowed { in_window: 0 }
        ));
    }

    #[tokio::test]
    async fn test_hourly_cap_spans_windows() {
        let (clock, limiter) = limiter(3, 4);
        limiter.record("tg:1", RateAction::StartLink).await;
        limiter.record("tg:1", RateAction::StartLink).await;
        clock.advance(Duration::minutes(10));
        limiter.record("tg:1", RateAction::StartLink).await;
        limiter.record("tg:1", RateAction::StartLink).await;
        clock.advance(Duration::minutes(10));

        assert!(matches!(
            limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
            RateDecision::Exceeded { .. }
        ));

        // The first windows fall out of the hour.
        clock.advance(Duration::minutes(50));
        assert!(matches!(
            limiter.check("tg:1", RateAction::StartLink).await.unwrap(),
            RateDecision::Allowed { .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_after_runs_to_window_end() {
        let (clock, limiter) = limiter(1, 10);
        clock.advance(Duration::minutes(4));
        limiter.record("tg:1", RateAction::StartLink).await;

        let decision = limiter.check("tg:1", RateAction::StartLink).await.unwrap();
        assert_eq!(
            decision,
            RateDecision::Exceeded {
                retry_after: std::time::Duration::from_secs(6 * 60)
            }
        );
    }

    #[tokio::test]
    async fn test_fast_outage_fails_closed() {
        let (_clock, limiter) = limiter(3, 10);
        limiter.fast.failures().fail_all(true);

        assert!(limiter.check("tg:1", RateAction::StartLink).await.is_err());
        assert_eq!(limiter.record("tg:1", RateAction::StartLink).await, None);
    }

    #[tokio::test]
    async fn test_durable_mirror_failure_is_tolerated() {
        let (_clock, limiter) = limiter(3, 10);
        limiter.durable.failures().fail_all(true);

        assert_eq!(limiter.record("tg:1", RateAction::StartLink).await, Some(1));
    }

    proptest! {
        #[test]
        fn prop_window_start_is_aligned_and_contains_now(offset in 0i64..10_000_000) {
            let base = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
            let now = base + Duration::seconds(offset);
            let key = RateLimitKey::containing("tg:1", RateAction::StartLink, now, RATE_WINDOW);

            prop_assert_eq!(key.window_start.timestamp() % RATE_WINDOW.num_seconds(), 0);
            prop_assert!(key.window_start <= now);
            prop_assert!(now < key.window_start + RATE_WINDOW);
        }
    }
}
