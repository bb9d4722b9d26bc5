//! Delegated session operations and the audit trail.
//!
//! Every accessor is owner-checked: a session belonging to another
//! second-channel user is reported as not found. Sessions past their expiry
//! are revoked on read, not merely filtered.

use super::LinkBroker;
use crate::constants::MAX_AUDIT_PAGE;
use crate::deadline::with_deadline;
use crate::environment::{DurableBackend, FastBackend};
use crate::error::{AuthError, Result};
use crate::providers::{CredentialResolver, FastStore, TokenIssuer};
use crate::state::{
    AuditAction, AuditContext, AuditLogEntry, AuditPage, AuditStatus, LinkedSession, SessionId,
    TokenPair,
};
use crate::utils::{hash_token, secrets_match};
use chrono::{DateTime, Utc};

impl<F, D, C, I> LinkBroker<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone + 'static,
    I: TokenIssuer + Clone + 'static,
{
    /// Look up a live session and touch its `last_used_at`.
    ///
    /// # Errors
    ///
    /// - `AuthError::SessionNotFound` if unknown or owned by another user
    /// - `AuthError::SessionExpired` if revoked or past expiry
    /// - Storage errors
    pub async fn get_session(
        &self,
        session_id: SessionId,
        external_user_ref: &str,
    ) -> Result<LinkedSession> {
        let mut session = self.live_session(session_id, external_user_ref).await?;
        let now = self.now();

        if let Err(err) = with_deadline(
            "durable_store.touch",
            self.timeout(),
            self.stores.durable().touch_session(session_id, now),
        )
        .await
        {
            tracing::warn!(session_id = %session_id, error = %err.detail(), "Session not touched");
        }
        session.last_used_at = Some(now);

        Ok(session)
    }

    /// Revoke a session and its refresh token.
    ///
    /// # Errors
    ///
    /// - `AuthError::SessionNotFound` if unknown or owned by another user
    /// - `AuthError::SessionExpired` if already revoked
    /// - Durable-store errors
    pub async fn revoke_session(&self, session_id: SessionId, external_user_ref: &str) -> Result<()> {
        let session = self
            .stores
            .get::<LinkedSession>(&session_id)
            .await?
            .filter(|s| s.external_user_ref == external_user_ref)
            .ok_or(AuthError::SessionNotFound)?;
        if session.revoked_at.is_some() {
            return Err(AuthError::SessionExpired);
        }

        let now = self.now();
        self.end_session(&session, now).await?;

        self.audit(
            AuditLogEntry::new(
                AuditContext::for_ref(external_user_ref),
                AuditAction::RevokeSession,
                AuditStatus::Success,
                now,
            )
            .with_session(session_id),
        );
        tracing::info!(
            session_id = %session_id,
            external_user_ref = %external_user_ref,
            "Session revoked"
        );
        Ok(())
    }

    /// Active sessions of `external_user_ref`, newest first.
    ///
    /// Sessions found past their expiry are revoked and left out.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store is unreachable.
    pub async fn list_sessions(&self, external_user_ref: &str) -> Result<Vec<LinkedSession>> {
        let sessions = with_deadline(
            "durable_store.list_sessions",
            self.timeout(),
            self.stores
                .durable()
                .list_active_sessions(external_user_ref),
        )
        .await?;

        let now = self.now();
        let mut live = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.is_live_at(now) {
                live.push(session);
            } else if let Err(err) = self.end_session(&session, now).await {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %err.detail(),
                    "Expired session not revoked"
                );
            }
        }
        Ok(live)
    }

    /// Rotate the token pair of a linked session.
    ///
    /// The presented refresh token must be the one currently bound to the
    /// session; it is redeemed exactly once.
    ///
    /// # Errors
    ///
    /// - `AuthError::SessionNotFound` / `AuthError::SessionExpired` as for
    ///   [`Self::get_session`]
    /// - `AuthError::InvalidCredentials` if the refresh token is not the
    ///   session's current one, or was already redeemed
    /// - Storage errors
    pub async fn refresh_session(
        &self,
        session_id: SessionId,
        refresh_token: &str,
        external_user_ref: &str,
    ) -> Result<TokenPair> {
        let session = self.live_session(session_id, external_user_ref).await?;
        if !secrets_match(&hash_token(refresh_token), &session.refresh_token_hash) {
            tracing::warn!(session_id = %session_id, "Refresh token does not belong to session");
            return Err(AuthError::InvalidCredentials);
        }

        let pair = self
            .tokens
            .refresh(
                refresh_token,
                self.config.access_token_ttl(),
                self.config.refresh_token_ttl(),
            )
            .await?;
        let refresh_hash = hash_token(&pair.refresh_token);

        let rebound = with_deadline(
            "durable_store.replace_hashes",
            self.timeout(),
            self.stores.durable().replace_token_hashes(
                session_id,
                &hash_token(&pair.access_token),
                &refresh_hash,
            ),
        )
        .await;
        match rebound {
            Ok(true) => {}
            Ok(false) => {
                self.revoke_refresh_quietly(&refresh_hash).await;
                return Err(AuthError::SessionExpired);
            }
            Err(err) => {
                self.revoke_refresh_quietly(&refresh_hash).await;
                return Err(err);
            }
        }

        // Reads fall back to the durable copy, which carries the new hashes.
        if let Err(err) = with_deadline(
            "fast_store.delete",
            self.timeout(),
            FastStore::<LinkedSession>::delete(self.stores.fast(), &session_id),
        )
        .await
        {
            tracing::warn!(session_id = %session_id, error = %err.detail(), "Stale session copy left to expire");
        }

        tracing::info!(session_id = %session_id, "Session tokens rotated");
        Ok(pair)
    }

    /// One page of `external_user_ref`'s audit trail, newest first.
    ///
    /// `limit` is clamped to `1..=100`.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store is unreachable.
    pub async fn get_audit_log(
        &self,
        external_user_ref: &str,
        limit: u32,
        offset: u32,
    ) -> Result<AuditPage> {
        with_deadline(
            "durable_store.audit_page",
            self.timeout(),
            self.stores.durable().page(
                external_user_ref,
                limit.clamp(1, MAX_AUDIT_PAGE),
                offset,
            ),
        )
        .await
    }

    /// Owner-checked lookup that revokes sessions found past expiry.
    async fn live_session(
        &self,
        session_id: SessionId,
        external_user_ref: &str,
    ) -> Result<LinkedSession> {
        let session = self
            .stores
            .get::<LinkedSession>(&session_id)
            .await?
            .filter(|s| s.external_user_ref == external_user_ref)
            .ok_or(AuthError::SessionNotFound)?;

        let now = self.now();
        if session.is_live_at(now) {
            return Ok(session);
        }

        if session.revoked_at.is_none() {
            if let Err(err) = self.end_session(&session, now).await {
                tracing::warn!(session_id = %session_id, error = %err.detail(), "Expired session not revoked");
            } else {
                tracing::info!(session_id = %session_id, "Expired session revoked on read");
            }
        }
        Err(AuthError::SessionExpired)
    }

    /// Revoke a session in both stores, then its refresh token.
    async fn end_session(&self, session: &LinkedSession, now: DateTime<Utc>) -> Result<()> {
        self.stores
            .remove::<LinkedSession, _, _>(
                &session.session_id,
                self.stores.durable().revoke_session(session.session_id, now),
            )
            .await?;
        self.revoke_refresh_quietly(&session.refresh_token_hash).await;
        Ok(())
    }
}
