//! Time source abstraction.
//!
//! Every expiry decision (handshakes, codes, sessions, blocks, rate windows, access
//! tokens) reads time through a [`Clock`] so tests can drive it deterministically.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Clock trait - abstracts time operations for testability.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle held by the broker and its collaborators.
pub type SharedClock = Arc<dyn Clock>;

/// Shared handle to the system clock.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
