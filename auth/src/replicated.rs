//! Fast-store + durable-store replication with compensation.
//!
//! # Ordering
//!
//! 1. Write the fast store
//! 2. Write the durable store
//! 3. If (2) fails, delete the fast copy and surface the error
//!
//! The only inconsistency this allows is "durable record without a fast copy",
//! which reads handle by falling back to the durable store. A fast copy without
//! a durable record (a phantom handshake or session) cannot be left behind,
//! even if the caller is cancelled mid-write.

use crate::deadline::{detached, with_deadline};
use crate::error::Result;
use crate::providers::{DurableStore, FastStore, Record};
use chrono::Duration;
use std::future::Future;

/// A pair of stores kept in step for write-then-read entities.
#[derive(Debug, Clone)]
pub struct Replicated<F, D> {
    fast: F,
    durable: D,
    timeout: std::time::Duration,
}

impl<F, D> Replicated<F, D>
where
    F: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    /// Pair `fast` with `durable`; every call to either carries `timeout`.
    #[must_use]
    pub const fn new(fast: F, durable: D, timeout: std::time::Duration) -> Self {
        Self {
            fast,
            durable,
            timeout,
        }
    }

    /// Fast store.
    #[must_use]
    pub const fn fast(&self) -> &F {
        &self.fast
    }

    /// Durable store.
    #[must_use]
    pub const fn durable(&self) -> &D {
        &self.durable
    }

    /// Per-call deadline.
    #[must_use]
    pub const fn timeout(&self) -> std::time::Duration {
        self.timeout
    }

    /// Write `record` to both stores, compensating on durable failure.
    ///
    /// Runs on a detached task: once started, the write and any compensation
    /// finish even if the caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns the fast-store error (nothing written), or the durable-store
    /// error (fast copy deleted again).
    pub async fn put<T>(&self, record: &T, ttl: Duration) -> Result<()>
    where
        T: Record,
        F: FastStore<T>,
        D: DurableStore<T>,
    {
        let fast = self.fast.clone();
        let durable = self.durable.clone();
        let record = record.clone();
        let limit = self.timeout;

        detached(T::KIND, async move {
            with_deadline("fast_store.put", limit, fast.put(&record, ttl)).await?;

            if let Err(err) =
                with_deadline("durable_store.insert", limit, durable.insert(&record)).await
            {
                tracing::warn!(
                    kind = T::KIND,
                    error = %err.detail(),
                    "Durable write failed, removing fast copy"
                );
                compensate::<T, F>(&fast, &record.key(), limit).await;
                return Err(err);
            }

            Ok(())
        })
        .await
    }

    /// Read a record: fast store first, durable store on a miss.
    ///
    /// A fast-store failure is treated as a miss.
    ///
    /// # Errors
    ///
    /// Returns the durable-store error if the fallback read fails.
    pub async fn get<T>(&self, key: &T::Key) -> Result<Option<T>>
    where
        T: Record,
        F: FastStore<T>,
        D: DurableStore<T>,
    {
        match with_deadline("fast_store.get", self.timeout, self.fast.get(key)).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    kind = T::KIND,
                    error = %err.detail(),
                    "Fast store read failed, falling back to durable store"
                );
            }
        }

        with_deadline("durable_store.fetch", self.timeout, self.durable.fetch(key)).await
    }

    /// Remove a record from both stores.
    ///
    /// `durable_op` is the durable-side removal (a delete or a soft revoke).
    /// Only its failure is returned; a fast-store failure is logged and left to
    /// TTL expiry.
    ///
    /// # Errors
    ///
    /// Returns the durable operation's error.
    pub async fn remove<T, R, Fut>(&self, key: &T::Key, durable_op: Fut) -> Result<R>
    where
        T: Record,
        F: FastStore<T>,
        Fut: Future<Output = Result<R>>,
    {
        if let Err(err) = with_deadline("fast_store.delete", self.timeout, self.fast.delete(key)).await
        {
            tracing::warn!(
                kind = T::KIND,
                key = %redact_key::<T>(key),
                error = %err.detail(),
                "Fast store delete failed, leaving entry to TTL expiry"
            );
        }

        with_deadline("durable_store.remove", self.timeout, durable_op).await
    }
}

async fn compensate<T, F>(fast: &F, key: &T::Key, limit: std::time::Duration)
where
    T: Record,
    F: FastStore<T>,
{
    match with_deadline("fast_store.delete", limit, fast.delete(key)).await {
        Ok(()) => {
            metrics::counter!("link.compensated", "kind" => T::KIND).increment(1);
        }
        Err(err) => {
            // The entry now outlives its durable record until its TTL passes.
            tracing::error!(
                kind = T::KIND,
                key = %redact_key::<T>(key),
                error = %err.detail(),
                "Compensating fast store delete failed"
            );
        }
    }
}

/// Log-safe prefix of a key.
fn redact_key<T: Record>(key: &T::Key) -> String {
    key.to_string().chars().take(8).collect()
}
