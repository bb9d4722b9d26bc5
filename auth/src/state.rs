//! Domain types for the linking flow.
//!
//! Types holding bearer material (`LinkSecret`, `AuthLinkToken`, `TokenPair`)
//! redact it in their `Debug` output so they can be logged freely.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Public handle of a linked session.
///
/// The only session identifier ever returned to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Generate a new random `SessionId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse a session handle received from a client.
    ///
    /// Returns `None` for anything that is not a UUID.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        uuid::Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handshake capability handed to the second channel.
///
/// Stores never see the raw value; they key the handshake by [`LinkSecret::digest`].
#[derive(Clone, PartialEq, Eq)]
pub struct LinkSecret(String);

impl LinkSecret {
    /// Wrap a secret received from a client.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Storage key for this secret (SHA-256, hex).
    #[must_use]
    pub fn digest(&self) -> String {
        crate::utils::hash_token(&self.0)
    }
}

impl fmt::Debug for LinkSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LinkSecret(<redacted>)")
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Handshake
// ═══════════════════════════════════════════════════════════════════════

/// Handshake status.
///
/// `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Waiting for the code to be entered on the second channel.
    Pending,
    /// Code verified and session granted.
    Completed,
    /// Lifetime elapsed before completion.
    Expired,
    /// Cancelled by its owner.
    Cancelled,
}

impl LinkStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` for states no transition may leave.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = crate::error::AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::error::AuthError::SerializationError(format!(
                "unknown link status: {other}"
            ))),
        }
    }
}

/// One handshake attempt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLinkToken {
    /// Internal identifier, referenced by audit entries.
    pub id: uuid::Uuid,
    /// SHA-256 digest of the link secret (lookup key).
    pub secret_hash: String,
    /// Identity the handshake was started for.
    pub identity_email: String,
    /// Second-channel user that owns the handshake.
    pub external_user_ref: String,
    /// Six-digit one-time code.
    pub verification_code: String,
    /// Current status.
    pub status: LinkStatus,
    /// Client IP at handshake start.
    pub ip_address: String,
    /// Client user agent at handshake start.
    pub user_agent: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time (always after `created_at`).
    pub expires_at: DateTime<Utc>,
    /// Set when the handshake completes.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the owner cancels.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl AuthLinkToken {
    /// Returns `true` once `now` reaches the expiry.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, or `None` if already expired.
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = self.expires_at - now;
        (remaining > Duration::zero()).then_some(remaining)
    }

    /// Apply a status transition locally, stamping the matching timestamp.
    pub fn apply_status(&mut self, status: LinkStatus, at: DateTime<Utc>) {
        self.status = status;
        match status {
            LinkStatus::Completed => self.completed_at = Some(at),
            LinkStatus::Cancelled => self.cancelled_at = Some(at),
            LinkStatus::Pending | LinkStatus::Expired => {}
        }
    }
}

impl fmt::Debug for AuthLinkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthLinkToken")
            .field("id", &self.id)
            .field("external_user_ref", &self.external_user_ref)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Returned by `start_link`.
#[derive(Debug, Clone)]
pub struct LinkGrant {
    /// Deep link for the web channel.
    pub link_url: String,
    /// The secret itself, for second-channel display or polling.
    pub link_secret: LinkSecret,
    /// Handshake expiry.
    pub expires_at: DateTime<Utc>,
}

/// Returned by `get_link_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatusView {
    /// Current (never stale) status.
    pub status: LinkStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Identity the handshake was started for.
    pub identity_email: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions and Tokens
// ═══════════════════════════════════════════════════════════════════════

/// Delegated session granted to the second channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedSession {
    /// Internal identifier. Never exposed.
    pub id: uuid::Uuid,
    /// Public handle.
    pub session_id: SessionId,
    /// Canonical account, from the credential resolver.
    pub subject_user_id: String,
    /// Second-channel user that owns the session.
    pub external_user_ref: String,
    /// Tenant selected at completion.
    pub tenant_id: String,
    /// SHA-256 of the access token.
    pub access_token_hash: String,
    /// SHA-256 of the refresh token.
    pub refresh_token_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Touched on every lookup.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Set on revocation (explicit or on expired read).
    pub revoked_at: Option<DateTime<Utc>>,
    /// Cleared together with setting `revoked_at`.
    pub is_active: bool,
}

impl LinkedSession {
    /// Returns `true` if the session is neither revoked nor expired at `now`.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.revoked_at.is_none() && now < self.expires_at
    }

    /// Mark the session revoked.
    pub fn revoke(&mut self, at: DateTime<Utc>) {
        self.revoked_at.get_or_insert(at);
        self.is_active = false;
    }
}

/// Access and refresh token pair. Only hashes of it are ever persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    /// Signed, short-lived access token.
    pub access_token: String,
    /// Opaque single-use refresh token.
    pub refresh_token: String,
    /// Access token expiry.
    pub access_expires_at: DateTime<Utc>,
    /// Refresh token expiry.
    pub refresh_expires_at: DateTime<Utc>,
    /// Always `"Bearer"`.
    pub token_type: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

/// Returned by `complete_link`.
#[derive(Debug, Clone)]
pub struct CompletedLink {
    /// Freshly minted tokens.
    pub tokens: TokenPair,
    /// Public handle of the new session.
    pub session_id: SessionId,
}

// ═══════════════════════════════════════════════════════════════════════
// Identity Resolution
// ═══════════════════════════════════════════════════════════════════════

/// One tenant an account belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Role within the tenant.
    pub role: String,
    /// Whether this is the account's default tenant.
    pub is_default: bool,
}

/// Canonical account returned by the credential resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccount {
    /// Canonical account identifier.
    pub subject_user_id: String,
    /// Tenants the account belongs to.
    pub memberships: Vec<TenantMembership>,
}

impl ResolvedAccount {
    /// Tenant used for new tokens: the default membership, else the first one.
    #[must_use]
    pub fn active_tenant(&self) -> Option<&TenantMembership> {
        self.memberships
            .iter()
            .find(|m| m.is_default)
            .or_else(|| self.memberships.first())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Abuse Controls
// ═══════════════════════════════════════════════════════════════════════

/// Rate-limited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateAction {
    /// Starting a handshake.
    StartLink,
    /// Submitting a verification code.
    CompleteLink,
}

impl RateAction {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StartLink => "start_link",
            Self::CompleteLink => "complete_link",
        }
    }
}

/// Key of one fixed-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Identity being limited (the second-channel user).
    pub identity: String,
    /// Action being limited.
    pub action: RateAction,
    /// Start of the window: `floor(now / window) * window`.
    pub window_start: DateTime<Utc>,
}

impl RateLimitKey {
    /// Key of the window containing `now`.
    #[must_use]
    pub fn containing(identity: &str, action: RateAction, now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            identity: identity.to_string(),
            action,
            window_start: window_floor(now, window),
        }
    }

    /// Key of the window `n` windows before this one.
    #[must_use]
    pub fn previous(&self, n: i32, window: Duration) -> Self {
        Self {
            identity: self.identity.clone(),
            action: self.action,
            window_start: self.window_start - window * n,
        }
    }
}

/// Align `now` down to a multiple of `window` since the Unix epoch.
#[must_use]
pub fn window_floor(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_secs = window.num_seconds().max(1);
    let start = now.timestamp().div_euclid(window_secs) * window_secs;
    DateTime::from_timestamp(start, 0).unwrap_or(now)
}

/// Per-identity block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBlock {
    /// Record identifier.
    pub id: uuid::Uuid,
    /// Identity being blocked (the second-channel user).
    pub identity: String,
    /// Why the block was created.
    pub reason: String,
    /// Creation time.
    pub blocked_at: DateTime<Utc>,
    /// Expiry, `None` for indefinite.
    pub expires_at: Option<DateTime<Utc>>,
    /// Cleared on unblock or by cleanup.
    pub is_active: bool,
}

impl AccountBlock {
    /// Returns `true` if the block applies at `now`.
    #[must_use]
    pub fn is_in_force_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires| now < expires)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Audit
// ═══════════════════════════════════════════════════════════════════════

/// Audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// `start_link`
    StartLink,
    /// `complete_link`
    CompleteLink,
    /// `cancel_link`
    CancelLink,
    /// `revoke_session`
    RevokeSession,
}

impl AuditAction {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StartLink => "start_link",
            Self::CompleteLink => "complete_link",
            Self::CancelLink => "cancel_link",
            Self::RevokeSession => "revoke_session",
        }
    }
}

impl FromStr for AuditAction {
    type Err = crate::error::AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start_link" => Ok(Self::StartLink),
            "complete_link" => Ok(Self::CompleteLink),
            "cancel_link" => Ok(Self::CancelLink),
            "revoke_session" => Ok(Self::RevokeSession),
            other => Err(crate::error::AuthError::SerializationError(format!(
                "unknown audit action: {other}"
            ))),
        }
    }
}

/// Audited outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The step succeeded.
    Success,
    /// The step was rejected or failed.
    Failed,
    /// The step hit an expired handshake.
    Expired,
}

impl AuditStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = crate::error::AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(crate::error::AuthError::SerializationError(format!(
                "unknown audit status: {other}"
            ))),
        }
    }
}

/// Who triggered an audited step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditContext {
    /// Identity email, when known.
    pub identity_email: String,
    /// Second-channel user.
    pub external_user_ref: String,
    /// Client IP, when known.
    pub ip_address: String,
    /// Client user agent, when known.
    pub user_agent: String,
}

impl AuditContext {
    /// Context carrying only the second-channel user.
    #[must_use]
    pub fn for_ref(external_user_ref: &str) -> Self {
        Self {
            external_user_ref: external_user_ref.to_string(),
            ..Self::default()
        }
    }

    /// Context describing the handshake's owner.
    #[must_use]
    pub fn for_link(token: &AuthLinkToken) -> Self {
        Self {
            identity_email: token.identity_email.clone(),
            external_user_ref: token.external_user_ref.clone(),
            ip_address: token.ip_address.clone(),
            user_agent: token.user_agent.clone(),
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Record identifier.
    pub id: uuid::Uuid,
    /// Identity email, empty when unknown.
    pub identity_email: String,
    /// Second-channel user.
    pub external_user_ref: String,
    /// Client IP, empty when unknown.
    pub ip_address: String,
    /// Client user agent, empty when unknown.
    pub user_agent: String,
    /// Audited action.
    pub action: AuditAction,
    /// Outcome.
    pub status: AuditStatus,
    /// Failure reason (never internal error detail).
    pub error_message: Option<String>,
    /// Handshake involved, if any.
    pub link_token_id: Option<uuid::Uuid>,
    /// Session involved, if any.
    pub session_id: Option<SessionId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Create an entry for `action` with `status`.
    #[must_use]
    pub fn new(
        context: AuditContext,
        action: AuditAction,
        status: AuditStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            identity_email: context.identity_email,
            external_user_ref: context.external_user_ref,
            ip_address: context.ip_address,
            user_agent: context.user_agent,
            action,
            status,
            error_message: None,
            link_token_id: None,
            session_id: None,
            created_at,
        }
    }

    /// Attach a failure reason.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Attach the handshake involved.
    #[must_use]
    pub const fn with_link(mut self, link_token_id: uuid::Uuid) -> Self {
        self.link_token_id = Some(link_token_id);
        self
    }

    /// Attach the session involved.
    #[must_use]
    pub const fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// One page of a user's audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditPage {
    /// Entries, newest first.
    pub entries: Vec<AuditLogEntry>,
    /// Total entries for the user across all pages.
    pub total: u64,
}
