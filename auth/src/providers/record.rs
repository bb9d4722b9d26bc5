//! Generic record storage traits.

use crate::error::Result;
use crate::state::{AuthLinkToken, LinkedSession, SessionId};
use chrono::{DateTime, Duration, Utc};
use std::fmt::Display;

/// A record kept in both the fast and the durable store.
pub trait Record: Clone + Send + Sync + 'static {
    /// Lookup key.
    type Key: Clone + Display + Send + Sync + 'static;

    /// Record kind, for logs and metrics.
    const KIND: &'static str;

    /// Key of this record.
    fn key(&self) -> Self::Key;

    /// When the record stops being meaningful.
    fn expires_at(&self) -> DateTime<Utc>;
}

impl Record for AuthLinkToken {
    type Key = String;

    const KIND: &'static str = "link_token";

    fn key(&self) -> String {
        self.secret_hash.clone()
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Record for LinkedSession {
    type Key = SessionId;

    const KIND: &'static str = "linked_session";

    fn key(&self) -> SessionId {
        self.session_id
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Low-latency, TTL-expiring store (the hot path).
///
/// # Implementation Notes
///
/// - Entries disappear on their own once the TTL passes
/// - A `put` for an existing key overwrites it
/// - Deleting a missing key is not an error
pub trait FastStore<T: Record>: Send + Sync {
    /// Store `record` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn put(
        &self,
        record: &T,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch a record, `None` on miss or after TTL expiry.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn get(&self, key: &T::Key) -> impl std::future::Future<Output = Result<Option<T>>> + Send;

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::CacheError` if the store is unreachable.
    fn delete(&self, key: &T::Key) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Persistent store (the system of record).
pub trait DurableStore<T: Record>: Send + Sync {
    /// Persist a new record.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the write fails.
    fn insert(&self, record: &T) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch a record regardless of its state.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::DatabaseError` if the read fails.
    fn fetch(&self, key: &T::Key) -> impl std::future::Future<Output = Result<Option<T>>> + Send;
}
