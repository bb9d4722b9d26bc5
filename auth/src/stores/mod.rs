//! Store implementations for the linking flow.
//!
//! - **Fast store** (Redis): handshakes, codes, sessions, counters and blocks,
//!   all expiring by TTL
//! - **Durable store** (`PostgreSQL`, feature `postgres`): system of record,
//!   audit trail and refresh tokens

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod link_redis;

// Re-exports
#[cfg(feature = "postgres")]
pub use postgres::{PostgresCredentialResolver, PostgresLinkStore};
pub use link_redis::RedisLinkStore;
