//! Linking flow constants.

use chrono::Duration;

/// Reasons recorded on account blocks.
pub mod block_reasons {
    /// Created when a rate limit is exceeded.
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
}

/// Failure reasons written to the audit trail.
///
/// These are safe to show to the account owner; internal error detail never is.
pub mod audit_messages {
    /// Identity email failed the shape check.
    pub const INVALID_EMAIL: &str = "invalid email format";
    /// Active block found.
    pub const ACCOUNT_BLOCKED: &str = "account blocked";
    /// Attempt cap reached.
    pub const RATE_LIMITED: &str = "rate limit exceeded";
    /// Handshake could not be persisted.
    pub const STORE_FAILED: &str = "failed to store link";
    /// Handshake lookup failed.
    pub const LOOKUP_FAILED: &str = "failed to load link";
    /// Unknown secret.
    pub const UNKNOWN_LINK: &str = "link not found";
    /// Handshake past its expiry.
    pub const LINK_EXPIRED: &str = "link expired";
    /// Handshake already completed, cancelled, or expired.
    pub const LINK_NOT_PENDING: &str = "link is no longer pending";
    /// Caller does not own the handshake.
    pub const WRONG_OWNER: &str = "link belongs to another user";
    /// Code missing or evicted.
    pub const CODE_MISSING: &str = "verification code expired";
    /// Code mismatch.
    pub const CODE_MISMATCH: &str = "invalid verification code";
    /// Resolver failure.
    pub const RESOLVE_FAILED: &str = "failed to resolve account";
    /// Account has no tenant memberships.
    pub const NO_TENANT: &str = "no tenant membership";
    /// Token minting or session creation failed.
    pub const SESSION_FAILED: &str = "failed to create session";
}

/// Length of one rate-limit window.
pub const RATE_WINDOW: Duration = Duration::minutes(10);

/// Windows summed for the hourly cap.
pub const WINDOWS_PER_HOUR: i32 = 6;

/// How long counters are kept (long enough to answer the hourly cap).
pub const COUNTER_RETENTION: Duration = Duration::hours(1);

/// Shortest accepted lifetime for any configured TTL.
pub const MIN_TTL: Duration = Duration::seconds(1);

/// Longest accepted handshake and verification code lifetime.
pub const MAX_LINK_TTL: Duration = Duration::days(30);

/// Longest accepted session lifetime and block length.
pub const MAX_SESSION_TTL: Duration = Duration::days(365);

/// Fast-store lifetime of an indefinite block.
pub const INDEFINITE_BLOCK_CACHE_TTL: Duration = Duration::hours(24);

/// Largest audit page.
pub const MAX_AUDIT_PAGE: u32 = 100;

/// Token type reported in every [`crate::state::TokenPair`].
pub const TOKEN_TYPE: &str = "Bearer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hourly_cap_spans_one_hour() {
        assert_eq!(RATE_WINDOW * WINDOWS_PER_HOUR, COUNTER_RETENTION);
    }
}
