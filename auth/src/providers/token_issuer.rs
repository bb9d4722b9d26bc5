//! Token issuer trait.

use crate::error::Result;
use crate::state::TokenPair;
use chrono::Duration;

/// Mints access/refresh token pairs.
///
/// Stateless apart from its signing material, which is injected at construction.
pub trait TokenIssuer: Send + Sync {
    /// Mint a token pair for `subject_user_id` acting in `tenant_id`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InternalError` if signing fails.
    fn issue(
        &self,
        subject_user_id: &str,
        tenant_id: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<TokenPair>;
}
