//! Per-identity account blocks.
//!
//! A general-purpose primitive: the broker blocks identities that exceed a
//! rate limit, and operators can block or unblock directly.
//!
//! Reads consult the fast store, then the durable store on a miss. Blocks past
//! their expiry are treated as lifted (lazy expiry) and reaped by cleanup.

use crate::clock::SharedClock;
use crate::deadline::with_deadline;
use crate::error::Result;
use crate::providers::BlockStore;
use crate::state::AccountBlock;
use chrono::Duration;

/// Account blocker over a fast and a durable block store.
#[derive(Clone)]
pub struct AccountBlocker<F, D> {
    fast: F,
    durable: D,
    clock: SharedClock,
    timeout: std::time::Duration,
}

impl<F, D> AccountBlocker<F, D>
where
    F: BlockStore,
    D: BlockStore,
{
    /// Create an account blocker.
    #[must_use]
    pub fn new(fast: F, durable: D, clock: SharedClock, timeout: std::time::Duration) -> Self {
        Self {
            fast,
            durable,
            clock,
            timeout,
        }
    }

    /// The block in force for `identity`, if any.
    ///
    /// # Errors
    ///
    /// Returns error if neither store can answer.
    pub async fn check(&self, identity: &str) -> Result<Option<AccountBlock>> {
        let now = self.clock.now();

        match with_deadline("block.get", self.timeout, self.fast.get_block(identity)).await {
            Ok(Some(block)) => return Ok(block.is_in_force_at(now).then_some(block)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    error = %err.detail(),
                    "Fast block lookup failed, falling back to durable store"
                );
            }
        }

        let block = with_deadline("block.get", self.timeout, self.durable.get_block(identity))
            .await?
            .filter(|block| block.is_in_force_at(now));

        if let Some(block) = &block {
            if let Err(err) =
                with_deadline("block.put", self.timeout, self.fast.put_block(block)).await
            {
                tracing::debug!(error = %err.detail(), "Block not cached");
            }
        }

        Ok(block)
    }

    /// Block `identity`. A `duration` of `None`, zero, or past the representable
    /// range blocks indefinitely.
    ///
    /// The fast copy is written first so the block takes effect even if the
    /// durable write fails.
    ///
    /// # Errors
    ///
    /// Returns the durable-store error.
    pub async fn block(
        &self,
        identity: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<AccountBlock> {
        let now = self.clock.now();
        let block = AccountBlock {
            id: uuid::Uuid::new_v4(),
            identity: identity.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            expires_at: duration
                .filter(|d| *d > Duration::zero())
                .and_then(|d| now.checked_add_signed(d)),
            is_active: true,
        };

        if let Err(err) = with_deadline("block.put", self.timeout, self.fast.put_block(&block)).await
        {
            tracing::warn!(error = %err.detail(), "Block not written to fast store");
        }
        with_deadline("block.put", self.timeout, self.durable.put_block(&block)).await?;

        metrics::counter!("link.blocked").increment(1);
        tracing::warn!(
            identity = %identity,
            reason = %reason,
            expires_at = ?block.expires_at,
            "Account blocked"
        );
        Ok(block)
    }

    /// Lift the block on `identity`.
    ///
    /// # Errors
    ///
    /// Returns the durable-store error; a fast-store failure is only logged.
    pub async fn unblock(&self, identity: &str) -> Result<()> {
        with_deadline("block.lift", self.timeout, self.durable.lift_block(identity)).await?;
        if let Err(err) = with_deadline("block.lift", self.timeout, self.fast.lift_block(identity)).await
        {
            tracing::warn!(error = %err.detail(), "Fast block copy not removed");
        }
        tracing::info!(identity = %identity, "Account unblocked");
        Ok(())
    }

    /// Deactivate durable blocks whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store is unreachable.
    pub async fn deactivate_expired(&self) -> Result<u64> {
        with_deadline(
            "block.cleanup",
            self.timeout,
            self.durable.deactivate_expired_blocks(self.clock.now()),
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mocks::{ManualClock, MockDurableStore, MockFastStore};
    use std::sync::Arc;

    fn blocker() -> (ManualClock, AccountBlocker<MockFastStore, MockDurableStore>) {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let blocker = AccountBlocker::new(
            MockFastStore::new(Arc::clone(&shared)),
            MockDurableStore::new(Arc::clone(&shared)),
            shared,
            std::time::Duration::from_secs(1),
        );
        (clock, blocker)
    }

    #[tokio::test]
    async fn test_timed_block_expires_lazily() {
        let (clock, blocker) = blocker();
        blocker
            .block("tg:1", "manual", Some(Duration::hours(1)))
            .await
            .unwrap();

        assert!(blocker.check("tg:1").await.unwrap().is_some());
        assert!(blocker.check("tg:2").await.unwrap().is_none());

        clock.advance(Duration::hours(1));
        assert!(blocker.check("tg:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_duration_means_indefinite() {
        let (clock, blocker) = blocker();
        let block = blocker
            .block("tg:1", "manual", Some(Duration::zero()))
            .await
            .unwrap();
        assert_eq!(block.expires_at, None);

        // Past the fast store's 24h retention the durable copy still answers.
        clock.advance(Duration::days(3));
        assert!(blocker.check("tg:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_durable_fallback_when_fast_is_down() {
        let (_clock, blocker) = blocker();
        blocker.block("tg:1", "manual", None).await.unwrap();
        blocker.fast.failures().fail_all(true);

        assert!(blocker.check("tg:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unblock_lifts_both_copies() {
        let (_clock, blocker) = blocker();
        blocker.block("tg:1", "manual", None).await.unwrap();

        blocker.unblock("tg:1").await.unwrap();

        assert!(blocker.check("tg:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_deactivates_expired_blocks() {
        let (clock, blocker) = blocker();
        blocker
            .block("tg:1", "manual", Some(Duration::minutes(5)))
            .await
            .unwrap();
        blocker.block("tg:2", "manual", None).await.unwrap();

        clock.advance(Duration::minutes(6));
        assert_eq!(blocker.deactivate_expired().await.unwrap(), 1);
    }
}
