//! Refresh token storage trait.
//!
//! # Security
//!
//! Only SHA-256 digests of refresh tokens are stored. A rotated or revoked
//! record must never validate again.

use crate::error::Result;
use chrono::{DateTime, Utc};

/// Stored refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    /// SHA-256 of the refresh token.
    pub token_hash: String,
    /// Account the token was issued to.
    pub subject_user_id: String,
    /// Tenant the token was issued for.
    pub tenant_id: String,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Set on rotation or revocation.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshRecord {
    /// Returns `true` if the token may still be redeemed at `now`.
    #[must_use]
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

/// Durable record of issued refresh tokens.
pub trait RefreshStore: Send + Sync {
    /// Persist a newly issued token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn store_refresh(
        &self,
        record: &RefreshRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Look a token up by digest, including revoked ones.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the read fails.
    fn get_by_token_hash(
        &self,
        token_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<RefreshRecord>>> + Send;

    /// Revoke `old_hash` and insert `replacement` as one operation.
    ///
    /// Exactly one of any number of concurrent rotations of the same token wins.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidCredentials` if `old_hash` is unknown, revoked, or
    ///   expired at `at` (including when a concurrent rotation won)
    /// - `AuthError::DatabaseError` if the write fails
    fn rotate_refresh(
        &self,
        old_hash: &str,
        replacement: &RefreshRecord,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Revoke a token. Returns `false` if it was unknown or already revoked.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn revoke_refresh(
        &self,
        token_hash: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}
