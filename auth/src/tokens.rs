//! Token issuance and single-use refresh rotation.
//!
//! The slice of the credential-login path the linking flow shares: mint a pair
//! and remember its refresh token, redeem a refresh token exactly once, revoke.

use crate::clock::SharedClock;
use crate::deadline::with_deadline;
use crate::error::{AuthError, Result};
use crate::providers::{RefreshRecord, RefreshStore, TokenIssuer};
use crate::state::TokenPair;
use crate::utils::hash_token;
use chrono::Duration;

/// Issues token pairs and rotates refresh tokens.
#[derive(Clone)]
pub struct TokenService<I, R> {
    issuer: I,
    refresh_store: R,
    clock: SharedClock,
    timeout: std::time::Duration,
}

impl<I, R> TokenService<I, R>
where
    I: TokenIssuer,
    R: RefreshStore,
{
    /// Create a token service.
    #[must_use]
    pub fn new(issuer: I, refresh_store: R, clock: SharedClock, timeout: std::time::Duration) -> Self {
        Self {
            issuer,
            refresh_store,
            clock,
            timeout,
        }
    }

    /// Token issuer.
    #[must_use]
    pub const fn issuer(&self) -> &I {
        &self.issuer
    }

    /// Mint a pair and persist its refresh token.
    ///
    /// # Errors
    ///
    /// Returns error if signing or the refresh-store write fails.
    pub async fn issue(
        &self,
        subject_user_id: &str,
        tenant_id: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<TokenPair> {
        let pair = self
            .issuer
            .issue(subject_user_id, tenant_id, access_ttl, refresh_ttl)?;
        let record = self.record_for(&pair, subject_user_id, tenant_id);

        with_deadline(
            "refresh_store.store",
            self.timeout,
            self.refresh_store.store_refresh(&record),
        )
        .await?;

        Ok(pair)
    }

    /// Redeem `refresh_token` for a new pair.
    ///
    /// The old token is revoked in the same operation that stores the new one;
    /// of two concurrent redemptions exactly one succeeds.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidCredentials` if the token is unknown, revoked,
    ///   expired, or lost a concurrent rotation
    /// - Storage errors otherwise
    pub async fn refresh(
        &self,
        refresh_token: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<TokenPair> {
        let old_hash = hash_token(refresh_token);
        let now = self.clock.now();

        let current = with_deadline(
            "refresh_store.get",
            self.timeout,
            self.refresh_store.get_by_token_hash(&old_hash),
        )
        .await?
        .filter(|record| record.is_redeemable_at(now))
        .ok_or(AuthError::InvalidCredentials)?;

        let pair = self.issuer.issue(
            &current.subject_user_id,
            &current.tenant_id,
            access_ttl,
            refresh_ttl,
        )?;
        let replacement = self.record_for(&pair, &current.subject_user_id, &current.tenant_id);

        with_deadline(
            "refresh_store.rotate",
            self.timeout,
            self.refresh_store.rotate_refresh(&old_hash, &replacement, now),
        )
        .await
        .inspect_err(|err| {
            if *err == AuthError::InvalidCredentials {
                tracing::warn!(
                    subject_user_id = %current.subject_user_id,
                    "Refresh token redeemed concurrently, rejecting duplicate"
                );
            }
        })?;

        tracing::info!(subject_user_id = %current.subject_user_id, "Refresh token rotated");
        Ok(pair)
    }

    /// Revoke a refresh token. Returns `false` if it was unknown or already revoked.
    ///
    /// # Errors
    ///
    /// Returns error if the refresh-store write fails.
    pub async fn revoke(&self, refresh_token: &str) -> Result<bool> {
        with_deadline(
            "refresh_store.revoke",
            self.timeout,
            self.refresh_store
                .revoke_refresh(&hash_token(refresh_token), self.clock.now()),
        )
        .await
    }

    /// Revoke a refresh token by its stored digest.
    ///
    /// # Errors
    ///
    /// Returns error if the refresh-store write fails.
    pub async fn revoke_digest(&self, token_hash: &str) -> Result<bool> {
        with_deadline(
            "refresh_store.revoke",
            self.timeout,
            self.refresh_store.revoke_refresh(token_hash, self.clock.now()),
        )
        .await
    }

    fn record_for(&self, pair: &TokenPair, subject_user_id: &str, tenant_id: &str) -> RefreshRecord {
        RefreshRecord {
            token_hash: hash_token(&pair.refresh_token),
            subject_user_id: subject_user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            created_at: self.clock.now(),
            expires_at: pair.refresh_expires_at,
            revoked_at: None,
        }
    }
}
