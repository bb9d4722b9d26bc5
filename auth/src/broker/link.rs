//! Handshake operations.
//!
//! # Status transitions
//!
//! Every transition out of `pending` is a conditional write in each store
//! (`Transition::Applied` only if the status was still `pending`). The fast
//! store is tried first; the durable store decides when the fast copy is gone.
//! Two concurrent completions of one handshake therefore cannot both succeed.

use super::LinkBroker;
use crate::constants::{audit_messages, block_reasons};
use crate::deadline::with_deadline;
use crate::environment::{DurableBackend, FastBackend};
use crate::error::{AuthError, Result};
use crate::providers::{CredentialResolver, FastStore, TokenIssuer, Transition};
use crate::rate_limit::RateDecision;
use crate::state::{
    AuditAction, AuditContext, AuditLogEntry, AuditStatus, AuthLinkToken, CompletedLink,
    LinkGrant, LinkSecret, LinkStatus, LinkStatusView, LinkedSession, RateAction, SessionId,
};
use crate::utils::{
    expires_after, generate_link_secret, generate_verification_code, has_email_shape,
    hash_token, normalize_email, secrets_match,
};
use chrono::{DateTime, Utc};

/// Where a handshake is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// Fast store only.
    FastOnly,
    /// Fast store, then durable store.
    Replicated,
}

/// A handshake lookup that did not yield a pending handshake.
struct Refusal {
    error: AuthError,
    reason: &'static str,
    link: Option<AuthLinkToken>,
}

impl Refusal {
    const fn new(error: AuthError, reason: &'static str, link: Option<AuthLinkToken>) -> Self {
        Self {
            error,
            reason,
            link,
        }
    }

    fn audit_status(&self) -> AuditStatus {
        if self.error == AuthError::LinkExpired {
            AuditStatus::Expired
        } else {
            AuditStatus::Failed
        }
    }
}

impl<F, D, C, I> LinkBroker<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone + 'static,
    I: TokenIssuer + Clone + 'static,
{
    // ═══════════════════════════════════════════════════════════════════
    // StartLink
    // ═══════════════════════════════════════════════════════════════════

    /// Start a handshake for `identity_email` on behalf of `external_user_ref`.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidEmail` if the email fails the shape check
    /// - `AuthError::AccountBlocked` if the caller is blocked
    /// - `AuthError::RateLimitExceeded` if the caller started too many
    ///   handshakes (this also blocks the caller)
    /// - Storage errors if the handshake or its code cannot be stored
    pub async fn start_link(
        &self,
        identity_email: &str,
        external_user_ref: &str,
        user_agent: &str,
        ip_address: &str,
    ) -> Result<LinkGrant> {
        let now = self.now();
        let context = AuditContext {
            identity_email: normalize_email(identity_email),
            external_user_ref: external_user_ref.to_string(),
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
        };

        if !has_email_shape(identity_email) {
            self.audit_failure(
                &context,
                AuditAction::StartLink,
                audit_messages::INVALID_EMAIL,
            );
            return Err(AuthError::InvalidEmail);
        }

        self.ensure_not_blocked(&context, AuditAction::StartLink)
            .await?;
        self.enforce_rate_limit(&context, RateAction::StartLink, AuditAction::StartLink)
            .await?;

        let expires_at = expires_after(now, self.config.auth_link_ttl)?;
        let secret = LinkSecret::new(generate_link_secret());
        let link = AuthLinkToken {
            id: uuid::Uuid::new_v4(),
            secret_hash: secret.digest(),
            identity_email: context.identity_email.clone(),
            external_user_ref: external_user_ref.to_string(),
            verification_code: generate_verification_code(),
            status: LinkStatus::Pending,
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
            created_at: now,
            expires_at,
            completed_at: None,
            cancelled_at: None,
        };

        if let Err(err) = self.stores.put(&link, self.config.auth_link_ttl).await {
            tracing::error!(
                external_user_ref = %external_user_ref,
                error = %err.detail(),
                "Failed to store handshake"
            );
            self.audit_failure(&context, AuditAction::StartLink, audit_messages::STORE_FAILED);
            return Err(err);
        }

        let code_stored = with_deadline(
            "fast_store.put_code",
            self.timeout(),
            self.stores.fast().put_code(
                &link.secret_hash,
                &link.verification_code,
                self.config.effective_code_ttl(),
            ),
        )
        .await;
        if let Err(err) = code_stored {
            tracing::error!(
                external_user_ref = %external_user_ref,
                error = %err.detail(),
                "Failed to store verification code"
            );
            self.audit(
                AuditLogEntry::new(context, AuditAction::StartLink, AuditStatus::Failed, now)
                    .with_error(audit_messages::STORE_FAILED)
                    .with_link(link.id),
            );
            return Err(err);
        }

        self.limiter
            .record(external_user_ref, RateAction::StartLink)
            .await;
        self.audit(
            AuditLogEntry::new(context, AuditAction::StartLink, AuditStatus::Success, now)
                .with_link(link.id),
        );

        metrics::counter!("link.started").increment(1);
        tracing::info!(
            link_id = %link.id,
            external_user_ref = %external_user_ref,
            expires_at = %link.expires_at,
            "Handshake started"
        );

        Ok(LinkGrant {
            link_url: self.config.link_url(secret.expose()),
            link_secret: secret,
            expires_at: link.expires_at,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // RevealCode
    // ═══════════════════════════════════════════════════════════════════

    /// Reveal the verification code of a pending handshake.
    ///
    /// Fast store only. Meant for a trusted first-party web surface; prefer
    /// [`Self::reveal_code_as`] where the viewer's identity is known.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidLinkToken` if the handshake is unknown or not pending
    /// - `AuthError::LinkExpired` if it has expired
    /// - `AuthError::InvalidVerificationCode` if the code has expired
    pub async fn reveal_code(&self, secret: &LinkSecret) -> Result<String> {
        self.reveal(secret, None).await
    }

    /// Like [`Self::reveal_code`], but only for the identity the handshake was
    /// started for (compared case-insensitively).
    ///
    /// # Errors
    ///
    /// As [`Self::reveal_code`]; a different viewer gets
    /// `AuthError::InvalidLinkToken`.
    pub async fn reveal_code_as(&self, secret: &LinkSecret, viewer_email: &str) -> Result<String> {
        self.reveal(secret, Some(viewer_email)).await
    }

    async fn reveal(&self, secret: &LinkSecret, viewer_email: Option<&str>) -> Result<String> {
        let link = self
            .pending_link(&secret.digest(), None, Lookup::FastOnly)
            .await
            .map_err(|refusal| refusal.error)?;

        if let Some(viewer) = viewer_email {
            if normalize_email(viewer) != link.identity_email {
                tracing::warn!(link_id = %link.id, "Code requested by a different identity");
                return Err(AuthError::InvalidLinkToken);
            }
        }

        with_deadline(
            "fast_store.get_code",
            self.timeout(),
            self.stores.fast().get_code(&link.secret_hash),
        )
        .await?
        .ok_or(AuthError::InvalidVerificationCode)
    }

    // ═══════════════════════════════════════════════════════════════════
    // CompleteLink
    // ═══════════════════════════════════════════════════════════════════

    /// Complete a handshake with the code shown on the web channel.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidLinkToken` if the handshake is unknown, owned by
    ///   another user, not pending, or completed concurrently
    /// - `AuthError::LinkExpired` if it has expired
    /// - `AuthError::AccountBlocked` if the owner is blocked
    /// - `AuthError::RateLimitExceeded` after too many attempts
    /// - `AuthError::InvalidVerificationCode` if the code is wrong or expired
    /// - Resolver, issuer, and storage failures (opaque to the caller)
    pub async fn complete_link(
        &self,
        secret: &LinkSecret,
        verification_code: &str,
        external_user_ref: &str,
    ) -> Result<CompletedLink> {
        let secret_hash = secret.digest();

        let link = match self
            .pending_link(&secret_hash, Some(external_user_ref), Lookup::Replicated)
            .await
        {
            Ok(link) => link,
            Err(refusal) => {
                self.audit_refusal(AuditAction::CompleteLink, external_user_ref, &refusal);
                return Err(refusal.error);
            }
        };
        let context = AuditContext::for_link(&link);

        self.ensure_not_blocked(&context, AuditAction::CompleteLink)
            .await?;
        self.enforce_rate_limit(&context, RateAction::CompleteLink, AuditAction::CompleteLink)
            .await?;
        self.verify_code(&link, &context, verification_code).await?;

        let account = match with_deadline(
            "resolver.resolve",
            self.timeout(),
            self.resolver.resolve(&link.identity_email),
        )
        .await
        {
            Ok(account) => account,
            Err(err) => {
                tracing::error!(link_id = %link.id, error = %err.detail(), "Account resolution failed");
                self.audit_completion_failure(&context, &link, audit_messages::RESOLVE_FAILED);
                return Err(match err {
                    AuthError::AccountNotFound => {
                        AuthError::InternalError("identity has no account".into())
                    }
                    other => other,
                });
            }
        };
        let Some(tenant) = account.active_tenant() else {
            tracing::error!(
                link_id = %link.id,
                subject_user_id = %account.subject_user_id,
                "Account has no tenant membership"
            );
            self.audit_completion_failure(&context, &link, audit_messages::NO_TENANT);
            return Err(AuthError::InternalError(
                "account has no tenant membership".into(),
            ));
        };

        let tokens = match self
            .tokens
            .issue(
                &account.subject_user_id,
                &tenant.tenant_id,
                self.config.access_token_ttl(),
                self.config.refresh_token_ttl(),
            )
            .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::error!(link_id = %link.id, error = %err.detail(), "Token issuance failed");
                self.audit_completion_failure(&context, &link, audit_messages::SESSION_FAILED);
                return Err(err);
            }
        };

        let now = self.now();
        let expires_at = match expires_after(now, self.config.session_ttl) {
            Ok(at) => at,
            Err(err) => {
                tracing::error!(link_id = %link.id, error = %err.detail(), "Session expiry not representable");
                self.revoke_refresh_quietly(&hash_token(&tokens.refresh_token)).await;
                self.audit_completion_failure(&context, &link, audit_messages::SESSION_FAILED);
                return Err(err);
            }
        };
        let session = LinkedSession {
            id: uuid::Uuid::new_v4(),
            session_id: SessionId::new(),
            subject_user_id: account.subject_user_id.clone(),
            external_user_ref: external_user_ref.to_string(),
            tenant_id: tenant.tenant_id.clone(),
            access_token_hash: hash_token(&tokens.access_token),
            refresh_token_hash: hash_token(&tokens.refresh_token),
            created_at: now,
            expires_at,
            last_used_at: None,
            revoked_at: None,
            is_active: true,
        };

        if let Err(err) = self.stores.put(&session, self.config.session_ttl).await {
            tracing::error!(link_id = %link.id, error = %err.detail(), "Failed to store session");
            self.revoke_refresh_quietly(&session.refresh_token_hash).await;
            self.audit_completion_failure(&context, &link, audit_messages::SESSION_FAILED);
            return Err(err);
        }

        if let Err(err) = self.claim_completion(&link).await {
            tracing::warn!(
                link_id = %link.id,
                session_id = %session.session_id,
                "Handshake no longer pending, discarding new session"
            );
            self.discard_session(&session).await;
            self.audit_completion_failure(&context, &link, audit_messages::LINK_NOT_PENDING);
            return Err(err);
        }

        self.delete_code_quietly(&secret_hash).await;
        self.limiter
            .record(external_user_ref, RateAction::CompleteLink)
            .await;
        self.audit(
            AuditLogEntry::new(context, AuditAction::CompleteLink, AuditStatus::Success, now)
                .with_link(link.id)
                .with_session(session.session_id),
        );

        metrics::counter!("link.completed").increment(1);
        tracing::info!(
            link_id = %link.id,
            session_id = %session.session_id,
            subject_user_id = %session.subject_user_id,
            tenant_id = %session.tenant_id,
            "Handshake completed"
        );

        Ok(CompletedLink {
            tokens,
            session_id: session.session_id,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // CancelLink
    // ═══════════════════════════════════════════════════════════════════

    /// Cancel a pending handshake. Only its owner may cancel it.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidLinkToken` if the handshake is unknown, owned by
    ///   another user, or already terminal
    /// - `AuthError::LinkExpired` if it has expired
    /// - Durable-store errors
    pub async fn cancel_link(&self, secret: &LinkSecret, external_user_ref: &str) -> Result<()> {
        let secret_hash = secret.digest();

        let link = match self
            .pending_link(&secret_hash, Some(external_user_ref), Lookup::Replicated)
            .await
        {
            Ok(link) => link,
            Err(refusal) => {
                self.audit_refusal(AuditAction::CancelLink, external_user_ref, &refusal);
                return Err(refusal.error);
            }
        };
        let context = AuditContext::for_link(&link);
        let now = self.now();

        if let Err(err) = self
            .transition(&secret_hash, LinkStatus::Cancelled, now)
            .await
        {
            if err == AuthError::InvalidLinkToken {
                self.audit_refusal(
                    AuditAction::CancelLink,
                    external_user_ref,
                    &Refusal::new(err.clone(), audit_messages::LINK_NOT_PENDING, Some(link)),
                );
            }
            return Err(err);
        }

        self.delete_code_quietly(&secret_hash).await;
        self.audit(
            AuditLogEntry::new(context, AuditAction::CancelLink, AuditStatus::Success, now)
                .with_link(link.id),
        );
        tracing::info!(link_id = %link.id, external_user_ref = %external_user_ref, "Handshake cancelled");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // GetLinkStatus
    // ═══════════════════════════════════════════════════════════════════

    /// Current status of a handshake. Never reports `pending` past expiry.
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidLinkToken` if the handshake is unknown
    /// - Storage errors
    pub async fn get_link_status(&self, secret: &LinkSecret) -> Result<LinkStatusView> {
        let mut link = self
            .stores
            .get::<AuthLinkToken>(&secret.digest())
            .await?
            .ok_or(AuthError::InvalidLinkToken)?;

        let now = self.now();
        if link.status == LinkStatus::Pending && link.is_expired_at(now) {
            self.expire_link(&link, now).await;
            link.status = LinkStatus::Expired;
        }

        Ok(LinkStatusView {
            status: link.status,
            created_at: link.created_at,
            expires_at: link.expires_at,
            identity_email: link.identity_email,
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════

    /// Load a handshake and check it is still usable by `owner`.
    ///
    /// Checks run in order: existence, ownership, expiry (lazily marking the
    /// handshake expired), status.
    async fn pending_link(
        &self,
        secret_hash: &str,
        owner: Option<&str>,
        lookup: Lookup,
    ) -> std::result::Result<AuthLinkToken, Refusal> {
        let secret_hash = secret_hash.to_string();
        let found = match lookup {
            Lookup::FastOnly => {
                with_deadline(
                    "fast_store.get",
                    self.timeout(),
                    FastStore::<AuthLinkToken>::get(self.stores.fast(), &secret_hash),
                )
                .await
            }
            Lookup::Replicated => self.stores.get::<AuthLinkToken>(&secret_hash).await,
        };

        let link = match found {
            Ok(Some(link)) => link,
            Ok(None) => {
                return Err(Refusal::new(
                    AuthError::InvalidLinkToken,
                    audit_messages::UNKNOWN_LINK,
                    None,
                ));
            }
            Err(err) => return Err(Refusal::new(err, audit_messages::LOOKUP_FAILED, None)),
        };

        if owner.is_some_and(|owner| owner != link.external_user_ref) {
            tracing::warn!(link_id = %link.id, "Handshake used by a different user");
            return Err(Refusal::new(
                AuthError::InvalidLinkToken,
                audit_messages::WRONG_OWNER,
                None,
            ));
        }

        let now = self.now();
        if link.status == LinkStatus::Pending && link.is_expired_at(now) {
            self.expire_link(&link, now).await;
            return Err(Refusal::new(
                AuthError::LinkExpired,
                audit_messages::LINK_EXPIRED,
                Some(link),
            ));
        }

        match link.status {
            LinkStatus::Pending => Ok(link),
            LinkStatus::Expired => Err(Refusal::new(
                AuthError::LinkExpired,
                audit_messages::LINK_EXPIRED,
                Some(link),
            )),
            LinkStatus::Completed | LinkStatus::Cancelled => Err(Refusal::new(
                AuthError::InvalidLinkToken,
                audit_messages::LINK_NOT_PENDING,
                Some(link),
            )),
        }
    }

    /// Mark a pending handshake expired in both stores. Best-effort.
    async fn expire_link(&self, link: &AuthLinkToken, now: DateTime<Utc>) {
        let fast = with_deadline(
            "fast_store.transition",
            self.timeout(),
            self.stores.fast().transition_link(
                &link.secret_hash,
                LinkStatus::Pending,
                LinkStatus::Expired,
                now,
            ),
        )
        .await;
        let durable = with_deadline(
            "durable_store.transition",
            self.timeout(),
            self.stores.durable().transition_link(
                &link.secret_hash,
                LinkStatus::Pending,
                LinkStatus::Expired,
                now,
            ),
        )
        .await;

        for result in [fast, durable] {
            if let Err(err) = result {
                tracing::warn!(link_id = %link.id, error = %err.detail(), "Failed to mark handshake expired");
            }
        }
        tracing::info!(link_id = %link.id, "Handshake expired");
    }

    /// Move a pending handshake to `next` in both stores.
    ///
    /// The fast store's conditional write decides when the fast copy exists;
    /// otherwise the durable store's does. Once decided, the other store is
    /// updated best-effort.
    async fn transition(
        &self,
        secret_hash: &str,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let fast = with_deadline(
            "fast_store.transition",
            self.timeout(),
            self.stores
                .fast()
                .transition_link(secret_hash, LinkStatus::Pending, next, at),
        )
        .await;

        let fast_applied = match fast {
            Ok(Transition::Applied) => true,
            Ok(Transition::Conflict(current)) => {
                tracing::warn!(status = %current, next = %next, "Handshake transition lost to a concurrent one");
                return Err(AuthError::InvalidLinkToken);
            }
            Ok(Transition::Missing) => false,
            Err(err) => {
                tracing::warn!(error = %err.detail(), "Fast transition failed, deferring to durable store");
                false
            }
        };

        let durable = with_deadline(
            "durable_store.transition",
            self.timeout(),
            self.stores
                .durable()
                .transition_link(secret_hash, LinkStatus::Pending, next, at),
        )
        .await;

        match (fast_applied, durable) {
            (_, Ok(Transition::Applied)) | (true, Ok(Transition::Missing)) => Ok(()),
            (true, Ok(Transition::Conflict(current))) => {
                tracing::warn!(status = %current, next = %next, "Durable handshake status disagrees with fast store");
                Ok(())
            }
            (true, Err(err)) => {
                tracing::warn!(error = %err.detail(), next = %next, "Durable handshake status not updated");
                Ok(())
            }
            (false, Ok(Transition::Conflict(_) | Transition::Missing)) => {
                Err(AuthError::InvalidLinkToken)
            }
            (false, Err(err)) => Err(err),
        }
    }

    /// Claim the handshake for a completion.
    async fn claim_completion(&self, link: &AuthLinkToken) -> Result<()> {
        self.transition(&link.secret_hash, LinkStatus::Completed, self.now())
            .await
    }

    /// Undo a session created by a completion that lost its claim.
    async fn discard_session(&self, session: &LinkedSession) {
        let now = self.now();
        let removed = self
            .stores
            .remove::<LinkedSession, _, _>(
                &session.session_id,
                self.stores.durable().revoke_session(session.session_id, now),
            )
            .await;
        if let Err(err) = removed {
            tracing::error!(
                session_id = %session.session_id,
                error = %err.detail(),
                "Failed to discard session"
            );
        }
        self.revoke_refresh_quietly(&session.refresh_token_hash).await;
    }

    /// Compare the submitted code with the stored one.
    ///
    /// A mismatch counts as an attempt towards the rate limit.
    async fn verify_code(
        &self,
        link: &AuthLinkToken,
        context: &AuditContext,
        submitted: &str,
    ) -> Result<()> {
        let stored = match with_deadline(
            "fast_store.get_code",
            self.timeout(),
            self.stores.fast().get_code(&link.secret_hash),
        )
        .await
        {
            Ok(Some(code)) => code,
            Ok(None) => {
                self.audit_completion_failure(context, link, audit_messages::CODE_MISSING);
                return Err(AuthError::InvalidVerificationCode);
            }
            Err(err) => {
                self.audit_completion_failure(context, link, audit_messages::LOOKUP_FAILED);
                return Err(err);
            }
        };

        if !secrets_match(submitted.trim(), &stored) {
            tracing::warn!(link_id = %link.id, "Verification code mismatch");
            self.limiter
                .record(&link.external_user_ref, RateAction::CompleteLink)
                .await;
            self.audit_completion_failure(context, link, audit_messages::CODE_MISMATCH);
            return Err(AuthError::InvalidVerificationCode);
        }
        Ok(())
    }

    /// Reject blocked callers.
    async fn ensure_not_blocked(
        &self,
        context: &AuditContext,
        action: AuditAction,
    ) -> Result<()> {
        if let Some(block) = self.blocker.check(&context.external_user_ref).await? {
            tracing::warn!(
                external_user_ref = %context.external_user_ref,
                reason = %block.reason,
                expires_at = ?block.expires_at,
                "Blocked account attempted handshake"
            );
            self.audit_failure(context, action, audit_messages::ACCOUNT_BLOCKED);
            return Err(AuthError::AccountBlocked);
        }
        Ok(())
    }

    /// Reject callers over a rate limit, blocking them as a side effect.
    async fn enforce_rate_limit(
        &self,
        context: &AuditContext,
        rate_action: RateAction,
        audit_action: AuditAction,
    ) -> Result<()> {
        let identity = &context.external_user_ref;
        let RateDecision::Exceeded { retry_after } =
            self.limiter.check(identity, rate_action).await?
        else {
            return Ok(());
        };

        metrics::counter!("link.rate_limited", "action" => rate_action.as_str()).increment(1);
        if let Err(err) = self
            .blocker
            .block(
                identity,
                block_reasons::RATE_LIMIT_EXCEEDED,
                Some(self.config.block_duration),
            )
            .await
        {
            tracing::error!(
                external_user_ref = %identity,
                error = %err.detail(),
                "Failed to block rate-limited account"
            );
        }
        self.audit_failure(context, audit_action, audit_messages::RATE_LIMITED);
        Err(AuthError::RateLimitExceeded { retry_after })
    }

    async fn delete_code_quietly(&self, secret_hash: &str) {
        if let Err(err) = with_deadline(
            "fast_store.delete_code",
            self.timeout(),
            self.stores.fast().delete_code(secret_hash),
        )
        .await
        {
            tracing::warn!(error = %err.detail(), "Verification code not deleted, leaving it to expire");
        }
    }

    pub(super) async fn revoke_refresh_quietly(&self, token_hash: &str) {
        if let Err(err) = self.tokens.revoke_digest(token_hash).await {
            tracing::error!(error = %err.detail(), "Failed to revoke refresh token");
        }
    }

    fn audit_failure(&self, context: &AuditContext, action: AuditAction, reason: &str) {
        self.audit(
            AuditLogEntry::new(context.clone(), action, AuditStatus::Failed, self.now())
                .with_error(reason),
        );
    }

    fn audit_completion_failure(&self, context: &AuditContext, link: &AuthLinkToken, reason: &str) {
        self.audit(
            AuditLogEntry::new(
                context.clone(),
                AuditAction::CompleteLink,
                AuditStatus::Failed,
                self.now(),
            )
            .with_error(reason)
            .with_link(link.id),
        );
    }

    fn audit_refusal(&self, action: AuditAction, external_user_ref: &str, refusal: &Refusal) {
        let context = refusal
            .link
            .as_ref()
            .map_or_else(|| AuditContext::for_ref(external_user_ref), AuditContext::for_link);
        let mut entry = AuditLogEntry::new(context, action, refusal.audit_status(), self.now())
            .with_error(refusal.reason);
        if let Some(link) = &refusal.link {
            entry = entry.with_link(link.id);
        }
        self.audit(entry);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SharedClock};
    use crate::config::LinkConfig;
    use crate::environment::LinkEnvironment;
    use crate::issuer::JwtTokenIssuer;
    use crate::mocks::{ManualClock, MockCredentialResolver, MockDurableStore, MockFastStore};
    use chrono::Duration;
    use std::sync::Arc;

    type Broker = LinkBroker<MockFastStore, MockDurableStore, MockCredentialResolver, JwtTokenIssuer>;

    struct Fixture {
        clock: ManualClock,
        fast: MockFastStore,
        durable: MockDurableStore,
        broker: Broker,
    }

    fn fixture() -> Fixture {
        fixture_with(LinkConfig::new("https://app.example.com/".into()))
    }

    fn fixture_with(config: LinkConfig) -> Fixture {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let fast = MockFastStore::new(Arc::clone(&shared));
        let durable = MockDurableStore::new(Arc::clone(&shared));
        let resolver =
            MockCredentialResolver::new().with_account("u@example.com", "user-1", "tenant-1");
        let issuer =
            JwtTokenIssuer::new(b"0123456789abcdef0123456789abcdef", Arc::clone(&shared)).unwrap();
        let broker = LinkBroker::new(
            LinkEnvironment::new(fast.clone(), durable.clone(), resolver, issuer, shared),
            config,
        );
        Fixture {
            clock,
            fast,
            durable,
            broker,
        }
    }

    #[tokio::test]
    async fn test_start_link_builds_deep_link() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "bot/1.0", "10.0.0.1")
            .await
            .unwrap();

        assert_eq!(
            grant.link_url,
            format!("https://app.example.com/link?token={}", grant.link_secret.expose())
        );
        assert_eq!(grant.expires_at, f.clock.now() + Duration::minutes(5));
        assert!(f.fast.contains_link(&grant.link_secret.digest()));
        assert!(f.durable.contains_link(&grant.link_secret.digest()));
    }

    #[tokio::test]
    async fn test_unrepresentable_lifetimes_fail_without_panicking() {
        let f = fixture_with(LinkConfig {
            auth_link_ttl: Duration::days(1_000_000_000),
            ..LinkConfig::default()
        });
        let err = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InternalError(_)));
        assert_eq!(f.fast.link_count(), 0);

        let f = fixture_with(LinkConfig {
            session_ttl: Duration::days(1_000_000_000),
            ..LinkConfig::default()
        });
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        let code = f.broker.reveal_code(&grant.link_secret).await.unwrap();
        let err = f
            .broker
            .complete_link(&grant.link_secret, &code, "tg:42")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InternalError(_)));
        assert_eq!(
            f.durable.link_status(&grant.link_secret.digest()),
            Some(LinkStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_start_link_rejects_malformed_email() {
        let f = fixture();
        let result = f.broker.start_link("not-an-email", "tg:42", "", "").await;
        assert_eq!(result.unwrap_err(), AuthError::InvalidEmail);
    }

    #[tokio::test]
    async fn test_durable_failure_leaves_no_fast_copy() {
        let f = fixture();
        f.durable.failures().fail_inserts(true);

        let result = f.broker.start_link("u@example.com", "tg:42", "", "").await;

        assert!(matches!(result, Err(AuthError::DatabaseError(_))));
        assert_eq!(f.fast.link_count(), 0);
    }

    #[tokio::test]
    async fn test_reveal_code_is_fast_store_only() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        f.fast.failures().fail_all(true);

        let result = f.broker.reveal_code(&grant.link_secret).await;
        assert!(matches!(result, Err(AuthError::CacheError(_))));
    }

    #[tokio::test]
    async fn test_reveal_code_as_checks_identity() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("U@Example.com", "tg:42", "", "")
            .await
            .unwrap();

        let code = f
            .broker
            .reveal_code_as(&grant.link_secret, "u@EXAMPLE.com")
            .await
            .unwrap();
        assert_eq!(code.len(), 6);

        let result = f
            .broker
            .reveal_code_as(&grant.link_secret, "other@example.com")
            .await;
        assert_eq!(result.unwrap_err(), AuthError::InvalidLinkToken);
    }

    #[tokio::test]
    async fn test_code_expires_before_link_when_shorter() {
        let clock = ManualClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        let broker = LinkBroker::new(
            LinkEnvironment::new(
                MockFastStore::new(Arc::clone(&shared)),
                MockDurableStore::new(Arc::clone(&shared)),
                MockCredentialResolver::new(),
                JwtTokenIssuer::new(b"0123456789abcdef0123456789abcdef", Arc::clone(&shared))
                    .unwrap(),
                shared,
            ),
            LinkConfig::default().with_verification_code_ttl(Duration::minutes(2)),
        );
        let grant = broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();

        clock.advance(Duration::minutes(3));
        let result = broker.reveal_code(&grant.link_secret).await;
        assert_eq!(result.unwrap_err(), AuthError::InvalidVerificationCode);
    }

    #[tokio::test]
    async fn test_complete_link_requires_owner() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        let code = f.broker.reveal_code(&grant.link_secret).await.unwrap();

        let result = f
            .broker
            .complete_link(&grant.link_secret, &code, "tg:999")
            .await;
        assert_eq!(result.unwrap_err(), AuthError::InvalidLinkToken);

        let status = f.broker.get_link_status(&grant.link_secret).await.unwrap();
        assert_eq!(status.status, LinkStatus::Pending);
    }

    #[tokio::test]
    async fn test_completion_falls_back_to_durable_claim() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();
        let code = f.broker.reveal_code(&grant.link_secret).await.unwrap();
        let hash = grant.link_secret.digest();
        FastStore::<AuthLinkToken>::delete(&f.fast, &hash)
            .await
            .unwrap();

        f.broker
            .complete_link(&grant.link_secret, &code, "tg:42")
            .await
            .unwrap();

        assert_eq!(f.durable.link_status(&hash), Some(LinkStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancel_rejects_terminal_link() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();

        f.broker.cancel_link(&grant.link_secret, "tg:42").await.unwrap();
        assert!(!f.fast.contains_code(&grant.link_secret.digest()));

        let again = f.broker.cancel_link(&grant.link_secret, "tg:42").await;
        assert_eq!(again.unwrap_err(), AuthError::InvalidLinkToken);
    }

    #[tokio::test]
    async fn test_status_read_marks_durable_copy_expired() {
        let f = fixture();
        let grant = f
            .broker
            .start_link("u@example.com", "tg:42", "", "")
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(5));
        let view = f.broker.get_link_status(&grant.link_secret).await.unwrap();

        assert_eq!(view.status, LinkStatus::Expired);
        assert_eq!(
            f.durable.link_status(&grant.link_secret.digest()),
            Some(LinkStatus::Expired)
        );
    }
}
