//! Cross-channel linking broker.
//!
//! # Flow
//!
//! ```text
//! channel B (bot)            broker                       channel A (web)
//!  start_link ────────────▶ block? rate? store link+code
//!             ◀──────────── link URL ───────────────────▶ open link
//!                                            reveal_code ◀─┘
//!  complete_link(code) ───▶ verify, resolve, issue,
//!             ◀──────────── tokens + session id
//! ```
//!
//! Operations are split by concern:
//! - [`link`]: the handshake (`start_link`, `reveal_code`, `complete_link`,
//!   `cancel_link`, `get_link_status`)
//! - [`session`]: delegated sessions and the audit trail
//! - [`maintenance`]: periodic cleanup of expired state

pub mod link;
pub mod maintenance;
pub mod session;

pub use maintenance::CleanupReport;

use crate::audit::AuditLogger;
use crate::blocker::AccountBlocker;
use crate::clock::SharedClock;
use crate::config::LinkConfig;
use crate::environment::{DurableBackend, FastBackend, LinkEnvironment};
use crate::providers::{CredentialResolver, TokenIssuer};
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::replicated::Replicated;
use crate::state::AuditLogEntry;
use crate::tokens::TokenService;
use chrono::{DateTime, Utc};

/// Orchestrates the linking handshake and the sessions it grants.
///
/// Cheap to clone; clones share stores and the audit worker.
#[derive(Clone)]
pub struct LinkBroker<F, D, C, I> {
    config: LinkConfig,
    stores: Replicated<F, D>,
    limiter: RateLimiter<F, D>,
    blocker: AccountBlocker<F, D>,
    tokens: TokenService<I, D>,
    resolver: C,
    audit: AuditLogger,
    clock: SharedClock,
}

impl<F, D, C, I> LinkBroker<F, D, C, I>
where
    F: FastBackend,
    D: DurableBackend,
    C: CredentialResolver + Clone + 'static,
    I: TokenIssuer + Clone + 'static,
{
    /// Create a broker and start its audit worker.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(env: LinkEnvironment<F, D, C, I>, config: LinkConfig) -> Self {
        let timeout = config.dependency_timeout;
        let (audit, _worker) = AuditLogger::spawn(env.durable.clone(), timeout);

        Self {
            stores: Replicated::new(env.fast.clone(), env.durable.clone(), timeout),
            limiter: RateLimiter::new(
                env.fast.clone(),
                env.durable.clone(),
                RateLimitPolicy::from_config(&config),
                env.clock.clone(),
                timeout,
            ),
            blocker: AccountBlocker::new(
                env.fast,
                env.durable.clone(),
                env.clock.clone(),
                timeout,
            ),
            tokens: TokenService::new(env.issuer, env.durable, env.clock.clone(), timeout),
            resolver: env.resolver,
            audit,
            clock: env.clock,
            config,
        }
    }

    /// Linking configuration.
    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Account blocker, for manual blocks and unblocks.
    #[must_use]
    pub const fn blocker(&self) -> &AccountBlocker<F, D> {
        &self.blocker
    }

    /// Rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter<F, D> {
        &self.limiter
    }

    /// Token service shared with the credential-login path.
    #[must_use]
    pub const fn tokens(&self) -> &TokenService<I, D> {
        &self.tokens
    }

    /// Wait until every audit entry queued so far has reached the sink.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn timeout(&self) -> std::time::Duration {
        self.config.dependency_timeout
    }

    fn audit(&self, entry: AuditLogEntry) {
        self.audit.record(entry);
    }
}
