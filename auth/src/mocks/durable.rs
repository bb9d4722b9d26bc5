//! In-memory durable store.

use super::{Failures, Op};
use crate::clock::SharedClock;
use crate::error::{AuthError, Result};
use crate::providers::{
    AttemptCounter, AuditSink, BlockStore, DurableStore, LinkTokenRepository, RefreshRecord,
    RefreshStore, SessionRepository, Transition,
};
use crate::state::{
    AccountBlock, AuditLogEntry, AuditPage, AuthLinkToken, LinkStatus, LinkedSession,
    RateLimitKey, SessionId,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct DurableState {
    links: HashMap<String, AuthLinkToken>,
    sessions: HashMap<SessionId, LinkedSession>,
    counters: HashMap<RateLimitKey, u64>,
    blocks: HashMap<String, AccountBlock>,
    audit: Vec<AuditLogEntry>,
    refresh: HashMap<String, RefreshRecord>,
}

/// In-memory stand-in for the `PostgreSQL` durable store.
///
/// Conditional updates run under one lock, so they are atomic like the SQL
/// `UPDATE … WHERE` statements they mirror.
#[derive(Clone)]
pub struct MockDurableStore {
    state: Arc<Mutex<DurableState>>,
    clock: SharedClock,
    failures: Arc<Failures>,
    session_inserts_fail: Arc<AtomicBool>,
}

impl MockDurableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(DurableState::default())),
            clock,
            failures: Arc::new(Failures::default()),
            session_inserts_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Failure injection.
    #[must_use]
    pub fn failures(&self) -> &Failures {
        &self.failures
    }

    /// Fail session inserts only, leaving refresh tokens and handshakes writable.
    pub fn fail_session_inserts(&self, on: bool) {
        self.session_inserts_fail.store(on, Ordering::SeqCst);
    }

    /// Whether a handshake is stored under `secret_hash`.
    #[must_use]
    pub fn contains_link(&self, secret_hash: &str) -> bool {
        self.lock()
            .is_ok_and(|state| state.links.contains_key(secret_hash))
    }

    /// Stored status of a handshake.
    #[must_use]
    pub fn link_status(&self, secret_hash: &str) -> Option<LinkStatus> {
        self.lock()
            .ok()
            .and_then(|state| state.links.get(secret_hash).map(|link| link.status))
    }

    /// Stored copy of a session.
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<LinkedSession> {
        self.lock()
            .ok()
            .and_then(|state| state.sessions.get(&session_id).cloned())
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().map_or(0, |state| state.sessions.len())
    }

    /// Every audit entry, oldest first.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.lock().map_or_else(|_| Vec::new(), |state| state.audit.clone())
    }

    /// Refresh records that can still be redeemed.
    #[must_use]
    pub fn redeemable_refresh_count(&self) -> usize {
        let now = self.clock.now();
        self.lock().map_or(0, |state| {
            state
                .refresh
                .values()
                .filter(|record| record.is_redeemable_at(now))
                .count()
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, DurableState>> {
        self.state
            .lock()
            .map_err(|_| AuthError::InternalError("Mutex lock failed".into()))
    }

    async fn gate(&self, op: Op) -> Result<()> {
        self.failures.gate(op).await.map_err(AuthError::DatabaseError)
    }
}

impl std::fmt::Debug for MockDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDurableStore").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Handshakes
// ═══════════════════════════════════════════════════════════════════════

impl DurableStore<AuthLinkToken> for MockDurableStore {
    async fn insert(&self, record: &AuthLinkToken) -> Result<()> {
        self.gate(Op::Insert).await?;
        let mut state = self.lock()?;
        if state.links.contains_key(&record.secret_hash) {
            return Err(AuthError::DatabaseError(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        state.links.insert(record.secret_hash.clone(), record.clone());
        Ok(())
    }

    async fn fetch(&self, key: &String) -> Result<Option<AuthLinkToken>> {
        self.gate(Op::Read).await?;
        Ok(self.lock()?.links.get(key).cloned())
    }
}

impl LinkTokenRepository for MockDurableStore {
    async fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let Some(link) = state.links.get_mut(secret_hash) else {
            return Ok(Transition::Missing);
        };
        if link.status != expected {
            return Ok(Transition::Conflict(link.status));
        }
        link.apply_status(next, at);
        Ok(Transition::Applied)
    }

    async fn purge_expired_links(&self, now: DateTime<Utc>) -> Result<u64> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let before = state.links.len();
        state.links.retain(|_, link| {
            !(matches!(link.status, LinkStatus::Pending | LinkStatus::Expired)
                && link.expires_at < now)
        });
        Ok((before - state.links.len()) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════

impl DurableStore<LinkedSession> for MockDurableStore {
    async fn insert(&self, record: &LinkedSession) -> Result<()> {
        self.gate(Op::Insert).await?;
        if self.session_inserts_fail.load(Ordering::SeqCst) {
            return Err(AuthError::DatabaseError("injected session insert failure".into()));
        }
        let mut state = self.lock()?;
        if state.sessions.contains_key(&record.session_id) {
            return Err(AuthError::DatabaseError(
                "duplicate key value violates unique constraint".into(),
            ));
        }
        state.sessions.insert(record.session_id, record.clone());
        Ok(())
    }

    async fn fetch(&self, key: &SessionId) -> Result<Option<LinkedSession>> {
        self.gate(Op::Read).await?;
        Ok(self.lock()?.sessions.get(key).cloned())
    }
}

impl SessionRepository for MockDurableStore {
    async fn touch_session(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.gate(Op::Write).await?;
        if let Some(session) = self.lock()?.sessions.get_mut(&session_id) {
            session.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn revoke_session(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoke(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_token_hashes(
        &self,
        session_id: SessionId,
        access_token_hash: &str,
        refresh_token_hash: &str,
    ) -> Result<bool> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        match state.sessions.get_mut(&session_id) {
            Some(session) if session.is_active && session.revoked_at.is_none() => {
                session.access_token_hash = access_token_hash.to_string();
                session.refresh_token_hash = refresh_token_hash.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_sessions(&self, external_user_ref: &str) -> Result<Vec<LinkedSession>> {
        self.gate(Op::Read).await?;
        let mut sessions: Vec<LinkedSession> = self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.external_user_ref == external_user_ref && s.is_active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn revoke_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let mut revoked = 0;
        for session in state.sessions.values_mut() {
            if session.is_active && session.expires_at < now {
                session.revoke(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Abuse Controls
// ═══════════════════════════════════════════════════════════════════════

impl AttemptCounter for MockDurableStore {
    async fn increment(&self, key: &RateLimitKey, _retention: Duration) -> Result<u64> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let count = state.counters.entry(key.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn sum_counts(&self, keys: &[RateLimitKey]) -> Result<u64> {
        self.gate(Op::Read).await?;
        let state = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| state.counters.get(key))
            .sum())
    }

    async fn purge_windows_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let before = state.counters.len();
        state.counters.retain(|key, _| key.window_start >= cutoff);
        Ok((before - state.counters.len()) as u64)
    }
}

impl BlockStore for MockDurableStore {
    async fn put_block(&self, block: &AccountBlock) -> Result<()> {
        self.gate(Op::Write).await?;
        self.lock()?
            .blocks
            .insert(block.identity.clone(), block.clone());
        Ok(())
    }

    async fn get_block(&self, identity: &str) -> Result<Option<AccountBlock>> {
        self.gate(Op::Read).await?;
        Ok(self.lock()?.blocks.get(identity).cloned())
    }

    async fn lift_block(&self, identity: &str) -> Result<()> {
        self.gate(Op::Write).await?;
        if let Some(block) = self.lock()?.blocks.get_mut(identity) {
            block.is_active = false;
        }
        Ok(())
    }

    async fn deactivate_expired_blocks(&self, now: DateTime<Utc>) -> Result<u64> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        let mut deactivated = 0;
        for block in state.blocks.values_mut() {
            if block.is_active && block.expires_at.is_some_and(|expires| expires < now) {
                block.is_active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Audit and Refresh Tokens
// ═══════════════════════════════════════════════════════════════════════

impl AuditSink for MockDurableStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.gate(Op::Insert).await?;
        self.lock()?.audit.push(entry.clone());
        Ok(())
    }

    async fn page(&self, external_user_ref: &str, limit: u32, offset: u32) -> Result<AuditPage> {
        self.gate(Op::Read).await?;
        let state = self.lock()?;
        let mut entries: Vec<&AuditLogEntry> = state
            .audit
            .iter()
            .rev()
            .filter(|e| e.external_user_ref == external_user_ref)
            .collect();
        // Stable sort: entries sharing a timestamp stay latest-appended first.
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(AuditPage {
            total: entries.len() as u64,
            entries: entries
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }
}

impl RefreshStore for MockDurableStore {
    async fn store_refresh(&self, record: &RefreshRecord) -> Result<()> {
        self.gate(Op::Insert).await?;
        self.lock()?
            .refresh
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<RefreshRecord>> {
        self.gate(Op::Read).await?;
        Ok(self.lock()?.refresh.get(token_hash).cloned())
    }

    async fn rotate_refresh(
        &self,
        old_hash: &str,
        replacement: &RefreshRecord,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.gate(Op::Write).await?;
        let mut state = self.lock()?;
        match state.refresh.get_mut(old_hash) {
            Some(old) if old.is_redeemable_at(at) => old.revoked_at = Some(at),
            _ => return Err(AuthError::InvalidCredentials),
        }
        state
            .refresh
            .insert(replacement.token_hash.clone(), replacement.clone());
        Ok(())
    }

    async fn revoke_refresh(&self, token_hash: &str, at: DateTime<Utc>) -> Result<bool> {
        self.gate(Op::Write).await?;
        match self.lock()?.refresh.get_mut(token_hash) {
            Some(record) if record.revoked_at.is_none() => {
                record.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
