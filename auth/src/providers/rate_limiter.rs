//! Fixed-window attempt counter trait.
//!
//! # Security
//!
//! Counters back the brute-force protection on `start_link` and
//! `complete_link`; see [`crate::rate_limit::RateLimiter`] for the policy.

use crate::error::Result;
use crate::state::RateLimitKey;
use chrono::{DateTime, Duration, Utc};

/// Per-window attempt counter.
///
/// Implemented by both stores: the fast copy answers checks, the durable copy
/// mirrors it for analytics.
pub trait AttemptCounter: Send + Sync {
    /// Increment the counter and return the new value.
    ///
    /// `retention` is how long the fast copy keeps the window around.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn increment(
        &self,
        key: &RateLimitKey,
        retention: Duration,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Sum of the counters for `keys` (missing windows count as zero).
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn sum_counts(
        &self,
        keys: &[RateLimitKey],
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    /// Drop windows starting before `cutoff`. Stores with TTLs do nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unreachable.
    fn purge_windows_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send {
        let _ = cutoff;
        async { Ok(0) }
    }
}
