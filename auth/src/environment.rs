//! Linking environment.
//!
//! This module defines the dependency bundle handed to
//! [`crate::broker::LinkBroker`].

use crate::clock::SharedClock;
use crate::providers::{
    AttemptCounter, AuditSink, BlockStore, CredentialResolver, FastStore, LinkTokenCache,
    LinkTokenRepository, RefreshStore, SessionRepository, TokenIssuer,
};
use crate::state::LinkedSession;

/// Everything the linking flow keeps in the fast store (Redis).
pub trait FastBackend:
    LinkTokenCache + FastStore<LinkedSession> + AttemptCounter + BlockStore + Clone + 'static
{
}

impl<T> FastBackend for T where
    T: LinkTokenCache + FastStore<LinkedSession> + AttemptCounter + BlockStore + Clone + 'static
{
}

/// Everything the linking flow keeps in the durable store (`PostgreSQL`).
pub trait DurableBackend:
    LinkTokenRepository
    + SessionRepository
    + AttemptCounter
    + BlockStore
    + AuditSink
    + RefreshStore
    + Clone
    + 'static
{
}

impl<T> DurableBackend for T where
    T: LinkTokenRepository
        + SessionRepository
        + AttemptCounter
        + BlockStore
        + AuditSink
        + RefreshStore
        + Clone
        + 'static
{
}

/// Linking environment.
///
/// Contains all external dependencies needed by the broker.
///
/// # Type Parameters
///
/// - `F`: Fast store (`Redis`)
/// - `D`: Durable store (`PostgreSQL`)
/// - `C`: Credential resolver
/// - `I`: Token issuer
#[derive(Clone)]
pub struct LinkEnvironment<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone,
    I: TokenIssuer + Clone,
{
    /// Fast store: handshakes, codes, sessions, counters, blocks.
    pub fast: F,

    /// Durable store: the system of record, plus audit and refresh tokens.
    pub durable: D,

    /// Maps identity emails to accounts.
    pub resolver: C,

    /// Mints token pairs.
    pub issuer: I,

    /// Source of time for every expiry decision.
    pub clock: SharedClock,
}

impl<F, D, C, I> LinkEnvironment<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone,
    I: TokenIssuer + Clone,
{
    /// Create a new linking environment.
    #[must_use]
    pub const fn new(fast: F, durable: D, resolver: C, issuer: I, clock: SharedClock) -> Self {
        Self {
            fast,
            durable,
            resolver,
            issuer,
            clock,
        }
    }
}
