//! Mock provider implementations for testing.
//!
//! In-memory implementations of every provider trait, driven by a
//! [`ManualClock`] so TTLs and expiry are deterministic. Each store carries a
//! [`Failures`] switchboard for injecting outages and latency.

pub mod clock;
pub mod durable;
pub mod fast;
pub mod resolver;

pub use clock::ManualClock;
pub use durable::MockDurableStore;
pub use fast::MockFastStore;
pub use resolver::MockCredentialResolver;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Kind of mock store call, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Insert,
    Write,
}

/// Failure and latency injection shared by the mock stores.
#[derive(Debug, Default)]
pub struct Failures {
    all: AtomicBool,
    inserts: AtomicBool,
    writes: AtomicBool,
    latency_ms: AtomicU64,
}

impl Failures {
    /// Fail every call.
    pub fn fail_all(&self, on: bool) {
        self.all.store(on, Ordering::SeqCst);
    }

    /// Fail record inserts (handshakes and sessions) only.
    pub fn fail_inserts(&self, on: bool) {
        self.inserts.store(on, Ordering::SeqCst);
    }

    /// Fail updates and deletes only.
    pub fn fail_writes(&self, on: bool) {
        self.writes.store(on, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    pub(crate) async fn gate(&self, op: Op) -> std::result::Result<(), String> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failing = self.all.load(Ordering::SeqCst)
            || (op == Op::Insert && self.inserts.load(Ordering::SeqCst))
            || (op == Op::Write && self.writes.load(Ordering::SeqCst));
        if failing {
            Err(format!("injected {op:?} failure"))
        } else {
            Ok(())
        }
    }
}
