//! Audit sink trait.

use crate::error::Result;
use crate::state::{AuditLogEntry, AuditPage};

/// Append-only durable audit trail.
///
/// Writes go through [`crate::audit::AuditLogger`], which never lets a sink
/// failure reach the caller.
pub trait AuditSink: Send + Sync {
    /// Append an entry.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn append(&self, entry: &AuditLogEntry) -> impl std::future::Future<Output = Result<()>> + Send;

    /// One page of a user's entries, newest first, with the user's total count.
    ///
    /// # Errors
    ///
    /// Returns error if the read fails.
    fn page(
        &self,
        external_user_ref: &str,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<AuditPage>> + Send;
}
