//! Linking flow configuration.
//!
//! Values are provided by the application, either through the builder methods or
//! from environment variables via [`LinkConfig::from_env`].

use crate::constants::{MAX_LINK_TTL, MAX_SESSION_TTL, MIN_TTL};
use chrono::Duration;
use std::env;

/// Configuration for [`crate::broker::LinkBroker`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Base URL of the web channel.
    ///
    /// Links are formatted as: `{web_base_url}/link?token={secret}`
    pub web_base_url: String,

    /// Lifetime of a handshake.
    ///
    /// Default: 5 minutes
    pub auth_link_ttl: Duration,

    /// Lifetime of a linked session (and of its access token).
    ///
    /// Default: 24 hours
    pub session_ttl: Duration,

    /// Lifetime of a verification code, capped at `auth_link_ttl`.
    ///
    /// Default: 10 minutes
    pub verification_code_ttl: Duration,

    /// Attempts allowed per identity and action within one 10-minute window.
    ///
    /// Default: 3
    pub max_attempts_per_10min: u32,

    /// Attempts allowed per identity and action across the last six windows.
    ///
    /// Default: 10
    pub max_attempts_per_hour: u32,

    /// Length of the block created when a rate limit is exceeded.
    ///
    /// Default: 1 hour
    pub block_duration: Duration,

    /// Deadline applied to every store, resolver, and issuer call.
    ///
    /// Default: 3 seconds
    pub dependency_timeout: std::time::Duration,
}

impl LinkConfig {
    /// Create configuration with default lifetimes for the given web base URL.
    #[must_use]
    pub const fn new(web_base_url: String) -> Self {
        Self {
            web_base_url,
            auth_link_ttl: Duration::minutes(5),
            session_ttl: Duration::hours(24),
            verification_code_ttl: Duration::minutes(10),
            max_attempts_per_10min: 3,
            max_attempts_per_hour: 10,
            block_duration: Duration::hours(1),
            dependency_timeout: std::time::Duration::from_secs(3),
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Recognized variables: `LINK_WEB_BASE_URL`, `LINK_AUTH_TOKEN_TTL_SECS`,
    /// `LINK_SESSION_TTL_SECS`, `LINK_VERIFICATION_CODE_TTL_SECS`,
    /// `LINK_MAX_ATTEMPTS_PER_10MIN`, `LINK_MAX_ATTEMPTS_PER_HOUR`,
    /// `LINK_BLOCK_DURATION_SECS`, `LINK_DEPENDENCY_TIMEOUT_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Missing, unparseable, non-positive, or out-of-range values keep their
    /// defaults. Lifetimes are capped at 30 days for handshakes and codes and
    /// at one year for sessions and blocks.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<i64>().ok());
        let seconds = |key: &str, fallback: Duration, ceiling: Duration| {
            parse(key)
                .filter(|secs| *secs > 0)
                .and_then(Duration::try_seconds)
                .filter(|ttl| *ttl <= ceiling)
                .unwrap_or(fallback)
        };
        let count = |key: &str, fallback: u32| {
            parse(key)
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(fallback)
        };

        Self {
            web_base_url: lookup("LINK_WEB_BASE_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.web_base_url),
            auth_link_ttl: seconds(
                "LINK_AUTH_TOKEN_TTL_SECS",
                defaults.auth_link_ttl,
                MAX_LINK_TTL,
            ),
            session_ttl: seconds("LINK_SESSION_TTL_SECS", defaults.session_ttl, MAX_SESSION_TTL),
            verification_code_ttl: seconds(
                "LINK_VERIFICATION_CODE_TTL_SECS",
                defaults.verification_code_ttl,
                MAX_LINK_TTL,
            ),
            max_attempts_per_10min: count(
                "LINK_MAX_ATTEMPTS_PER_10MIN",
                defaults.max_attempts_per_10min,
            ),
            max_attempts_per_hour: count(
                "LINK_MAX_ATTEMPTS_PER_HOUR",
                defaults.max_attempts_per_hour,
            ),
            block_duration: seconds(
                "LINK_BLOCK_DURATION_SECS",
                defaults.block_duration,
                MAX_SESSION_TTL,
            ),
            dependency_timeout: parse("LINK_DEPENDENCY_TIMEOUT_MS")
                .and_then(|ms| u64::try_from(ms).ok())
                .filter(|ms| *ms > 0)
                .map_or(defaults.dependency_timeout, std::time::Duration::from_millis),
        }
    }

    /// Set the handshake lifetime, clamped to one second..30 days.
    #[must_use]
    pub fn with_auth_link_ttl(mut self, ttl: Duration) -> Self {
        self.auth_link_ttl = ttl.clamp(MIN_TTL, MAX_LINK_TTL);
        self
    }

    /// Set the linked session lifetime, clamped to one second..one year.
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl.clamp(MIN_TTL, MAX_SESSION_TTL);
        self
    }

    /// Set the verification code lifetime, clamped to one second..30 days.
    #[must_use]
    pub fn with_verification_code_ttl(mut self, ttl: Duration) -> Self {
        self.verification_code_ttl = ttl.clamp(MIN_TTL, MAX_LINK_TTL);
        self
    }

    /// Set both rate-limit caps.
    #[must_use]
    pub const fn with_rate_limits(mut self, per_10min: u32, per_hour: u32) -> Self {
        self.max_attempts_per_10min = per_10min;
        self.max_attempts_per_hour = per_hour;
        self
    }

    /// Set the block length used when a rate limit is exceeded, clamped to
    /// one second..one year.
    #[must_use]
    pub fn with_block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = duration.clamp(MIN_TTL, MAX_SESSION_TTL);
        self
    }

    /// Set the per-call dependency deadline.
    #[must_use]
    pub const fn with_dependency_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    /// Access token lifetime for linked sessions.
    #[must_use]
    pub const fn access_token_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Refresh token lifetime for linked sessions (twice the session lifetime).
    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        self.session_ttl * 2
    }

    /// Effective verification code lifetime.
    #[must_use]
    pub fn effective_code_ttl(&self) -> Duration {
        self.verification_code_ttl.min(self.auth_link_ttl)
    }

    /// Build the deep link handed to the second channel.
    #[must_use]
    pub fn link_url(&self, secret: &str) -> String {
        format!(
            "{}/link?token={}",
            self.web_base_url.trim_end_matches('/'),
            urlencoding::encode(secret)
        )
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new("http://localhost:3000".to_string())
    }
}
