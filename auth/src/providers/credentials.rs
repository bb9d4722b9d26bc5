//! Credential resolver trait.

use crate::error::Result;
use crate::state::ResolvedAccount;

/// Maps an identity email to its canonical account and tenant memberships.
///
/// Implemented by the account system that owns users; the linking flow only
/// reads from it.
pub trait CredentialResolver: Send + Sync {
    /// Resolve an email.
    ///
    /// # Errors
    ///
    /// - `AuthError::AccountNotFound` if no account has this email
    /// - `AuthError::DatabaseError` if the lookup fails
    fn resolve(&self, email: &str)
    -> impl std::future::Future<Output = Result<ResolvedAccount>> + Send;
}
