//! In-memory fast store.

use super::{Failures, Op};
use crate::clock::SharedClock;
use crate::constants::INDEFINITE_BLOCK_CACHE_TTL;
use crate::error::{AuthError, Result};
use crate::providers::{AttemptCounter, BlockStore, FastStore, LinkTokenCache, Transition};
use crate::state::{AccountBlock, AuthLinkToken, LinkStatus, LinkedSession, RateLimitKey, SessionId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FastState {
    links: HashMap<String, Entry<AuthLinkToken>>,
    codes: HashMap<String, Entry<String>>,
    sessions: HashMap<SessionId, Entry<LinkedSession>>,
    counters: HashMap<RateLimitKey, Entry<u64>>,
    blocks: HashMap<String, Entry<AccountBlock>>,
}

/// Fetch a live entry, dropping it if its TTL has passed.
fn live<K: Eq + Hash, T: Clone>(
    map: &mut HashMap<K, Entry<T>>,
    key: &K,
    now: DateTime<Utc>,
) -> Option<T> {
    match map.get(key) {
        Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
        Some(_) => {
            map.remove(key);
            None
        }
        None => None,
    }
}

/// In-memory stand-in for the Redis fast store.
///
/// Entries expire against the injected clock, like Redis TTLs.
#[derive(Clone)]
pub struct MockFastStore {
    state: Arc<Mutex<FastState>>,
    clock: SharedClock,
    failures: Arc<Failures>,
}

impl MockFastStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(FastState::default())),
            clock,
            failures: Arc::new(Failures::default()),
        }
    }

    /// Failure injection.
    #[must_use]
    pub fn failures(&self) -> &Failures {
        &self.failures
    }

    /// Whether a live handshake is cached under `secret_hash`.
    #[must_use]
    pub fn contains_link(&self, secret_hash: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .is_ok_and(|mut state| live(&mut state.links, &secret_hash.to_string(), now).is_some())
    }

    /// Number of live cached handshakes.
    #[must_use]
    pub fn link_count(&self) -> usize {
        let now = self.clock.now();
        self.lock().map_or(0, |state| {
            state.links.values().filter(|e| e.expires_at > now).count()
        })
    }

    /// Whether a live verification code is cached under `secret_hash`.
    #[must_use]
    pub fn contains_code(&self, secret_hash: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .is_ok_and(|mut state| live(&mut state.codes, &secret_hash.to_string(), now).is_some())
    }

    /// Whether a live session is cached under `session_id`.
    #[must_use]
    pub fn contains_session(&self, session_id: SessionId) -> bool {
        let now = self.clock.now();
        self.lock()
            .is_ok_and(|mut state| live(&mut state.sessions, &session_id, now).is_some())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FastState>> {
        self.state
            .lock()
            .map_err(|_| AuthError::InternalError("Mutex lock failed".into()))
    }

    async fn gate(&self, op: Op) -> Result<()> {
        self.failures.gate(op).await.map_err(AuthError::CacheError)
    }
}

impl std::fmt::Debug for MockFastStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFastStore").finish_non_exhaustive()
    }
}

impl FastStore<AuthLinkToken> for MockFastStore {
    async fn put(&self, record: &AuthLinkToken, ttl: Duration) -> Result<()> {
        self.gate(Op::Insert).await?;
        let expires_at = self.clock.now() + ttl;
        self.lock()?.links.insert(
            record.secret_hash.clone(),
            Entry {
                value: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &String) -> Result<Option<AuthLinkToken>> {
        self.gate(Op::Read).await?;
        let now = self.clock.now();
        Ok(live(&mut self.lock()?.links, key, now))
    }

    async fn delete(&self, key: &String) -> Result<()> {
        self.gate(Op::Write).await?;
        self.lock()?.links.remove(key);
        Ok(())
    }
}

impl FastStore<LinkedSession> for MockFastStore {
    async fn put(&self, record: &LinkedSession, ttl: Duration) -> Result<()> {
        self.gate(Op::Insert).await?;
        let expires_at = self.clock.now() + ttl;
        self.lock()?.sessions.insert(
            record.session_id,
            Entry {
                value: record.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &SessionId) -> Result<Option<LinkedSession>> {
        self.gate(Op::Read).await?;
        let now = self.clock.now();
        Ok(live(&mut self.lock()?.sessions, key, now))
    }

    async fn delete(&self, key: &SessionId) -> Result<()> {
        self.gate(Op::Write).await?;
        self.lock()?.sessions.remove(key);
        Ok(())
    }
}

impl LinkTokenCache for MockFastStore {
    async fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        self.gate(Op::Write).await?;
        let now = self.clock.now();
        let mut state = self.lock()?;

        let key = secret_hash.to_string();
        if live(&mut state.links, &key, now).is_none() {
            return Ok(Transition::Missing);
        }
        let Some(entry) = state.links.get_mut(&key) else {
            return Ok(Transition::Missing);
        };
        if entry.value.status != expected {
            return Ok(Transition::Conflict(entry.value.status));
        }
        entry.value.apply_status(next, at);
        Ok(Transition::Applied)
    }

    async fn put_code(&self, secret_hash: &str, code: &str, ttl: Duration) -> Result<()> {
        self.gate(Op::Insert).await?;
        let expires_at = self.clock.now() + ttl;
        self.lock()?.codes.insert(
            secret_hash.to_string(),
            Entry {
                value: code.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_code(&self, secret_hash: &str) -> Result<Option<String>> {
        self.gate(Op::Read).await?;
        let now = self.clock.now();
        Ok(live(&mut self.lock()?.codes, &secret_hash.to_string(), now))
    }

    async fn delete_code(&self, secret_hash: &str) -> Result<()> {
        self.gate(Op::Write).await?;
        self.lock()?.codes.remove(secret_hash);
        Ok(())
    }
}

impl AttemptCounter for MockFastStore {
    async fn increment(&self, key: &RateLimitKey, retention: Duration) -> Result<u64> {
        self.gate(Op::Write).await?;
        let now = self.clock.now();
        let mut state = self.lock()?;

        let count = live(&mut state.counters, key, now).unwrap_or(0) + 1;
        let expires_at = state
            .counters
            .get(key)
            .map_or(now + retention, |entry| entry.expires_at);
        state.counters.insert(
            key.clone(),
            Entry {
                value: count,
                expires_at,
            },
        );
        Ok(count)
    }

    async fn sum_counts(&self, keys: &[RateLimitKey]) -> Result<u64> {
        self.gate(Op::Read).await?;
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(keys
            .iter()
            .map(|key| live(&mut state.counters, key, now).unwrap_or(0))
            .sum())
    }
}

impl BlockStore for MockFastStore {
    async fn put_block(&self, block: &AccountBlock) -> Result<()> {
        self.gate(Op::Insert).await?;
        let expires_at = block
            .expires_at
            .unwrap_or(block.blocked_at + INDEFINITE_BLOCK_CACHE_TTL);
        self.lock()?.blocks.insert(
            block.identity.clone(),
            Entry {
                value: block.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_block(&self, identity: &str) -> Result<Option<AccountBlock>> {
        self.gate(Op::Read).await?;
        let now = self.clock.now();
        Ok(live(&mut self.lock()?.blocks, &identity.to_string(), now))
    }

    async fn lift_block(&self, identity: &str) -> Result<()> {
        self.gate(Op::Write).await?;
        self.lock()?.blocks.remove(identity);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::mocks::ManualClock;

    #[tokio::test]
    async fn test_entries_expire_with_clock() {
        let clock = ManualClock::default();
        let store = MockFastStore::new(Arc::new(clock.clone()));

        store.put_code("h", "123456", Duration::minutes(5)).await.unwrap();
        assert_eq!(store.get_code("h").await.unwrap().as_deref(), Some("123456"));

        clock.advance(Duration::minutes(5));
        assert_eq!(store.get_code("h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_keeps_first_expiry() {
        let clock = ManualClock::default();
        let store = MockFastStore::new(Arc::new(clock.clone()));
        let key = RateLimitKey::containing(
            "tg:1",
            crate::state::RateAction::StartLink,
            clock.now(),
            Duration::minutes(10),
        );

        store.increment(&key, Duration::hours(1)).await.unwrap();
        clock.advance(Duration::minutes(59));
        assert_eq!(store.increment(&key, Duration::hours(1)).await.unwrap(), 2);

        clock.advance(Duration::minutes(1));
        assert_eq!(store.sum_counts(&[key]).await.unwrap(), 0);
    }
}
