//! Secret generation, hashing, and input checks.

use crate::error::{AuthError, Result};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Number of digits in a verification code.
pub const VERIFICATION_CODE_DIGITS: usize = 6;

/// Generate a link secret: 256 random bits, hex-encoded (64 characters).
#[must_use]
pub fn generate_link_secret() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    hex::encode(random_bytes)
}

/// Generate a refresh token: 256 random bits, base64url without padding.
#[must_use]
pub fn generate_refresh_token() -> String {
    use base64::Engine;

    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generate a six-digit verification code.
///
/// Each digit is an independent uniform draw over `0..10` (`gen_range` rejects
/// samples rather than reducing modulo 10).
#[must_use]
pub fn generate_verification_code() -> String {
    let mut rng = rand::thread_rng();
    (0..VERIFICATION_CODE_DIGITS)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// SHA-256 of a token, hex-encoded.
///
/// # Examples
///
/// ```
/// use channel_link_auth::utils::hash_token;
///
/// assert_eq!(hash_token("abc").len(), 64);
/// assert_eq!(hash_token("abc"), hash_token("abc"));
/// ```
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare two secrets without short-circuiting on the first differing byte.
#[must_use]
pub fn secrets_match(supplied: &str, stored: &str) -> bool {
    constant_time_eq::constant_time_eq(supplied.as_bytes(), stored.as_bytes())
}

/// Minimal email shape check: an `@` with a `.` somewhere after it.
///
/// Full validation is the credential resolver's job.
///
/// # Examples
///
/// ```
/// use channel_link_auth::utils::has_email_shape;
///
/// assert!(has_email_shape("u@example.com"));
/// assert!(!has_email_shape("example.com"));
/// assert!(!has_email_shape("u@localhost"));
/// ```
#[must_use]
pub fn has_email_shape(email: &str) -> bool {
    let email = email.trim();
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Normalize an email for comparison and lookup.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// `now + ttl`, or an internal error when the instant is not representable.
///
/// # Errors
///
/// Returns `AuthError::InternalError` on overflow.
pub fn expires_after(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    now.checked_add_signed(ttl)
        .ok_or_else(|| AuthError::InternalError(format!("expiry overflows: {now} + {ttl}")))
}
