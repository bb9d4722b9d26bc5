//! Linked session storage trait.

use crate::error::Result;
use crate::providers::record::DurableStore;
use crate::state::{LinkedSession, SessionId};
use chrono::{DateTime, Utc};

/// Durable-store operations on linked sessions beyond [`DurableStore`].
///
/// The fast copy only needs [`crate::providers::FastStore`]; revocation there is
/// a plain delete.
pub trait SessionRepository: DurableStore<LinkedSession> {
    /// Record a lookup.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn touch_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Revoke a session. Returns `false` if it was already revoked or is unknown.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn revoke_session(
        &self,
        session_id: SessionId,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Replace the token hashes of an active session after a refresh.
    ///
    /// Returns `false` if the session is no longer active.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn replace_token_hashes(
        &self,
        session_id: SessionId,
        access_token_hash: &str,
        refresh_token_hash: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Sessions of a second-channel user still marked active, newest first.
    ///
    /// May include sessions whose expiry has passed but were not yet revoked.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the read fails.
    fn list_active_sessions(
        &self,
        external_user_ref: &str,
    ) -> impl std::future::Future<Output = Result<Vec<LinkedSession>>> + Send;

    /// Revoke every active session whose expiry is before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn revoke_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}
