//! Handshake storage traits.
//!
//! # Security
//!
//! Handshakes are keyed by the SHA-256 digest of the link secret; neither store
//! ever sees the secret itself.

use crate::error::Result;
use crate::providers::record::{DurableStore, FastStore};
use crate::state::{AuthLinkToken, LinkStatus};
use chrono::{DateTime, Duration, Utc};

/// Outcome of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status matched the expected value and was replaced.
    Applied,
    /// Status did not match; carries the status found.
    Conflict(LinkStatus),
    /// No record for the key.
    Missing,
}

/// Fast-store operations on handshakes beyond [`FastStore`].
pub trait LinkTokenCache: FastStore<AuthLinkToken> {
    /// Atomically move `expected` to `next`, keeping the remaining TTL.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Transition>> + Send;

    /// Store the verification code for a handshake.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn put_code(
        &self,
        secret_hash: &str,
        code: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch the verification code, `None` once it has expired or been deleted.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn get_code(
        &self,
        secret_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>>> + Send;

    /// Delete the verification code.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn delete_code(&self, secret_hash: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Durable-store operations on handshakes beyond [`DurableStore`].
pub trait LinkTokenRepository: DurableStore<AuthLinkToken> {
    /// Conditionally move `expected` to `next` (`WHERE status = expected`).
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Transition>> + Send;

    /// Delete handshakes that expired before `now` without completing.
    ///
    /// Completed and cancelled handshakes are kept for auditing.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the delete fails.
    fn purge_expired_links(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}
