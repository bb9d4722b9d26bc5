//! # Channel Link Auth
//!
//! Cross-channel account linking: a user on a second channel (a chat bot, a
//! TV app) proves ownership of a web account by opening a deep link in the
//! browser, reading a six-digit code there, and typing it back into the
//! second channel. On success the second channel receives a delegated session
//! and a token pair.
//!
//! ## Features
//!
//! - **Replicated state**: handshakes and sessions live in a fast TTL store and
//!   a durable system of record, written with compensation on failure
//! - **Abuse controls**: fixed-window rate limits and automatic blocks
//! - **Single completion**: conditional status transitions in both stores
//! - **Audit trail**: asynchronous, never on the caller's critical path
//! - **Testable**: in-memory stores and a manual clock behind `test-utils`
//!
//! ## Example
//!
//! ```rust,ignore
//! use channel_link_auth::*;
//!
//! let broker = LinkBroker::new(env, LinkConfig::from_env());
//!
//! // Second channel asks for a link on behalf of its user.
//! let grant = broker.start_link("user@example.com", "tg:42", ua, ip).await?;
//!
//! // Browser opens the link and shows the code.
//! let code = broker.reveal_code(&grant.link_secret).await?;
//!
//! // User types the code into the second channel.
//! let done = broker.complete_link(&grant.link_secret, &code, "tg:42").await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Public modules
pub mod audit;
pub mod blocker;
pub mod broker;
pub mod clock;
pub mod config;
pub mod constants;
pub mod deadline;
pub mod environment;
pub mod error;
pub mod issuer;
pub mod providers;
pub mod rate_limit;
pub mod replicated;
pub mod state;
pub mod stores;
pub mod tokens;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use broker::{CleanupReport, LinkBroker};
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use config::LinkConfig;
pub use environment::{DurableBackend, FastBackend, LinkEnvironment};
pub use error::{AuthError, Result};
pub use issuer::JwtTokenIssuer;
pub use state::{
    AuditLogEntry, AuditPage, AuthLinkToken, CompletedLink, LinkGrant, LinkSecret, LinkStatus,
    LinkStatusView, LinkedSession, SessionId, TokenPair,
};
