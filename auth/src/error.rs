//! Error types for the cross-channel linking flow.
//!
//! Policy and validation failures are typed, user-facing outcomes. Infrastructure
//! failures carry a detail string for logs, but their `Display` never includes it,
//! so `to_string()` on any error is safe to hand to a caller.

use thiserror::Error;

/// Result type alias for linking operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Error taxonomy for the linking flow and its stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    // ═══════════════════════════════════════════════════════════
    // Handshake Policy Errors
    // ═══════════════════════════════════════════════════════════
    /// An active block exists for the identity.
    #[error("Account is temporarily blocked")]
    AccountBlocked,

    /// The per-window attempt cap was reached.
    #[error("Too many attempts, please retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Time until the current window closes.
        retry_after: std::time::Duration,
    },

    // ═══════════════════════════════════════════════════════════
    // Handshake Validation Errors
    // ═══════════════════════════════════════════════════════════
    /// Unknown secret, wrong owner, or a status that cannot make the requested transition.
    #[error("Invalid link token")]
    InvalidLinkToken,

    /// The handshake exists but is past its expiry.
    #[error("Link has expired")]
    LinkExpired,

    /// Code mismatch, or the code record is missing or expired.
    #[error("Invalid verification code")]
    InvalidVerificationCode,

    /// Identity email failed the shape check.
    #[error("Invalid email address")]
    InvalidEmail,

    // ═══════════════════════════════════════════════════════════
    // Session Errors
    // ═══════════════════════════════════════════════════════════
    /// No session with this handle is visible to the caller.
    #[error("Session not found")]
    SessionNotFound,

    /// Session was revoked or has passed its expiry.
    #[error("Session has expired")]
    SessionExpired,

    /// Refresh token is unknown, revoked, expired, or already rotated.
    #[error("Invalid credentials")]
    InvalidCredentials,

    // ═══════════════════════════════════════════════════════════
    // Resolver Errors
    // ═══════════════════════════════════════════════════════════
    /// The credential resolver has no account for the identity.
    #[error("Account not found")]
    AccountNotFound,

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════
    /// A dependency did not answer before its deadline.
    #[error("Operation timed out")]
    Timeout {
        /// Name of the operation that stalled.
        operation: &'static str,
    },

    /// Fast store (cache) operation failed.
    #[error("Internal error")]
    CacheError(String),

    /// Durable store operation failed.
    #[error("Internal error")]
    DatabaseError(String),

    /// Record could not be encoded or decoded.
    #[error("Internal error")]
    SerializationError(String),

    /// Any other internal failure (should not be exposed to users).
    #[error("Internal error")]
    InternalError(String),
}

impl AuthError {
    /// Returns `true` if this error is an expected, user-facing outcome.
    ///
    /// # Examples
    ///
    /// ```
    /// # use channel_link_auth::AuthError;
    /// assert!(AuthError::InvalidVerificationCode.is_user_error());
    /// assert!(!AuthError::DatabaseError("pool closed".into()).is_user_error());
    /// ```
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::AccountBlocked
                | Self::RateLimitExceeded { .. }
                | Self::InvalidLinkToken
                | Self::LinkExpired
                | Self::InvalidVerificationCode
                | Self::InvalidEmail
                | Self::SessionNotFound
                | Self::SessionExpired
                | Self::InvalidCredentials
        )
    }

    /// Returns `true` if this error indicates possible abuse.
    ///
    /// # Examples
    ///
    /// ```
    /// # use channel_link_auth::AuthError;
    /// assert!(AuthError::AccountBlocked.is_security_issue());
    /// assert!(!AuthError::LinkExpired.is_security_issue());
    /// ```
    #[must_use]
    pub const fn is_security_issue(&self) -> bool {
        matches!(
            self,
            Self::AccountBlocked | Self::RateLimitExceeded { .. } | Self::InvalidCredentials
        )
    }

    /// Returns `true` for failures of a store, resolver, or other dependency.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::CacheError(_)
                | Self::DatabaseError(_)
                | Self::SerializationError(_)
                | Self::InternalError(_)
        )
    }

    /// Internal detail for logging. Never return this to a caller.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::CacheError(detail)
            | Self::DatabaseError(detail)
            | Self::SerializationError(detail)
            | Self::InternalError(detail) => detail.clone(),
            Self::Timeout { operation } => format!("{operation} timed out"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors_hide_detail() {
        let err = AuthError::DatabaseError("relation \"link_tokens\" does not exist".into());
        assert_eq!(err.to_string(), "Internal error");
        assert!(err.detail().contains("link_tokens"));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_timeout_display_is_generic() {
        let err = AuthError::Timeout {
            operation: "resolver.resolve",
        };
        assert_eq!(err.to_string(), "Operation timed out");
        assert_eq!(err.detail(), "resolver.resolve timed out");
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_classification_is_disjoint() {
        let all = [
            AuthError::AccountBlocked,
            AuthError::RateLimitExceeded {
                retry_after: std::time::Duration::from_secs(1),
            },
            AuthError::InvalidLinkToken,
            AuthError::LinkExpired,
            AuthError::InvalidVerificationCode,
            AuthError::InvalidEmail,
            AuthError::SessionNotFound,
            AuthError::SessionExpired,
            AuthError::InvalidCredentials,
            AuthError::CacheError(String::new()),
            AuthError::InternalError(String::new()),
        ];
        for err in all {
            assert!(!(err.is_user_error() && err.is_infrastructure()), "{err:?}");
        }
    }
}
