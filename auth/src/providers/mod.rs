//! Linking flow providers.
//!
//! This module defines traits for every external dependency of the linking
//! flow. The broker depends only on these traits; the Redis and `PostgreSQL`
//! stores in [`crate::stores`] and the in-memory doubles in `mocks` implement them.
//!
//! # Architecture
//!
//! Handshakes and sessions live in two stores at once:
//!
//! ```text
//! ┌──────────────────┐   put (1st)    ┌──────────────────┐
//! │                  │ ─────────────▶ │ Fast store       │  TTL-expiring,
//! │ Replicated       │                │ (Redis)          │  hot path
//! │ (write-then-     │   insert (2nd) ├──────────────────┤
//! │  compensate)     │ ─────────────▶ │ Durable store    │  system of
//! │                  │                │ (PostgreSQL)     │  record
//! └──────────────────┘                └──────────────────┘
//! ```
//!
//! [`FastStore`] and [`DurableStore`] are generic over the [`Record`] being
//! stored; entity-specific operations (conditional status transitions, session
//! revocation, cleanup) live in the extension traits.

pub mod audit;
pub mod block;
pub mod credentials;
pub mod link_store;
pub mod rate_limiter;
pub mod record;
pub mod refresh_store;
pub mod session;
pub mod token_issuer;

pub use audit::AuditSink;
pub use block::BlockStore;
pub use credentials::CredentialResolver;
pub use link_store::{LinkTokenCache, LinkTokenRepository, Transition};
pub use rate_limiter::AttemptCounter;
pub use record::{DurableStore, FastStore, Record};
pub use refresh_store::{RefreshRecord, RefreshStore};
pub use session::SessionRepository;
pub use token_issuer::TokenIssuer;
