//! Account block storage trait.

use crate::error::Result;
use crate::state::AccountBlock;
use chrono::{DateTime, Utc};

/// Per-identity block records.
///
/// # Implementation Notes
///
/// - One block per identity; `put_block` replaces any existing one
/// - Fast stores expire entries at `expires_at` (24 hours for indefinite blocks,
///   after which the durable copy answers again)
pub trait BlockStore: Send + Sync {
    /// Create or replace the block for `block.identity`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn put_block(&self, block: &AccountBlock) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Current block record, active or not.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn get_block(
        &self,
        identity: &str,
    ) -> impl std::future::Future<Output = Result<Option<AccountBlock>>> + Send;

    /// Lift the block for an identity.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn lift_block(&self, identity: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Deactivate blocks whose expiry is before `now`. Stores with TTLs do nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn deactivate_expired_blocks(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send {
        let _ = now;
        async { Ok(0) }
    }
}
