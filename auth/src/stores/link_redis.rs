//! Redis fast store for the linking flow.
//!
//! # Architecture
//!
//! Everything lives under the `link:` prefix with Redis-managed TTLs:
//! - `link:token:{secret_hash}` → JSON `AuthLinkToken` (TTL = handshake lifetime)
//! - `link:code:{secret_hash}` → verification code (TTL = code lifetime)
//! - `link:session:{session_id}` → bincode `LinkedSession` (TTL = session lifetime)
//! - `link:rate:{identity}:{action}:{window_start}` → attempt counter
//! - `link:block:{identity}` → JSON `AccountBlock` (expires with the block)
//!
//! Handshakes are stored as JSON so the status transition can run as a Lua
//! compare-and-set on the server.
//!
//! # Example
//!
//! ```no_run
//! use channel_link_auth::stores::RedisLinkStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisLinkStore::new("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use crate::constants::INDEFINITE_BLOCK_CACHE_TTL;
use crate::error::{AuthError, Result};
use crate::providers::{AttemptCounter, BlockStore, FastStore, LinkTokenCache, Transition};
use crate::state::{AccountBlock, AuthLinkToken, LinkStatus, LinkedSession, RateLimitKey, SessionId};
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

/// Compare-and-set on a stored handshake's status, keeping its TTL.
///
/// Returns `{0, ''}` if missing, `{2, status}` on conflict, `{1, next}` if applied.
const TRANSITION_SCRIPT: &str = r"
    local raw = redis.call('GET', KEYS[1])
    if not raw then
        return {0, ''}
    end

    local link = cjson.decode(raw)
    if link.status ~= ARGV[1] then
        return {2, link.status}
    end

    link.status = ARGV[2]
    if ARGV[2] == 'completed' then
        link.completed_at = ARGV[3]
    elseif ARGV[2] == 'cancelled' then
        link.cancelled_at = ARGV[3]
    end

    redis.call('SET', KEYS[1], cjson.encode(link), 'KEEPTTL')
    return {1, ARGV[2]}
";

/// Increment a counter, setting its expiry only on creation.
const INCREMENT_SCRIPT: &str = r"
    local count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('EXPIRE', KEYS[1], ARGV[1])
    end
    return count
";

/// Redis-backed fast store.
///
/// This type is `Clone`; each clone shares the same `ConnectionManager`.
#[derive(Clone)]
pub struct RedisLinkStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
}

impl RedisLinkStore {
    /// Create a new Redis link store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns error if connection to Redis fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AuthError::CacheError(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            AuthError::CacheError(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("RedisLinkStore initialized successfully");

        Ok(Self { conn_manager })
    }

    fn token_key(secret_hash: &str) -> String {
        format!("link:token:{secret_hash}")
    }

    fn code_key(secret_hash: &str) -> String {
        format!("link:code:{secret_hash}")
    }

    fn session_key(session_id: &SessionId) -> String {
        format!("link:session:{}", session_id.0)
    }

    fn rate_key(key: &RateLimitKey) -> String {
        format!(
            "link:rate:{}:{}:{}",
            key.identity,
            key.action.as_str(),
            key.window_start.timestamp()
        )
    }

    fn block_key(identity: &str) -> String {
        format!("link:block:{identity}")
    }
}

/// Whole seconds of `ttl`, at least one (`SET EX 0` is an error).
fn ttl_seconds(ttl: Duration) -> u64 {
    u64::try_from(ttl.num_seconds()).unwrap_or(0).max(1)
}

fn cache_error(context: &'static str) -> impl FnOnce(redis::RedisError) -> AuthError {
    move |e| AuthError::CacheError(format!("{context}: {e}"))
}

// ═══════════════════════════════════════════════════════════════════════
// Handshakes
// ═══════════════════════════════════════════════════════════════════════

impl FastStore<AuthLinkToken> for RedisLinkStore {
    async fn put(&self, record: &AuthLinkToken, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let json = serde_json::to_string(record)
            .map_err(|e| AuthError::SerializationError(e.to_string()))?;

        let _: () = conn
            .set_ex(Self::token_key(&record.secret_hash), json, ttl_seconds(ttl))
            .await
            .map_err(cache_error("Failed to store link token"))?;
        Ok(())
    }

    async fn get(&self, key: &String) -> Result<Option<AuthLinkToken>> {
        let mut conn = self.conn_manager.clone();
        let json: Option<String> = conn
            .get(Self::token_key(key))
            .await
            .map_err(cache_error("Failed to get link token"))?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| AuthError::SerializationError(e.to_string()))
        })
        .transpose()
    }

    async fn delete(&self, key: &String) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::token_key(key))
            .await
            .map_err(cache_error("Failed to delete link token"))?;
        Ok(())
    }
}

impl LinkTokenCache for RedisLinkStore {
    async fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let mut conn = self.conn_manager.clone();
        let (outcome, status): (i64, String) = redis::Script::new(TRANSITION_SCRIPT)
            .key(Self::token_key(secret_hash))
            .arg(expected.as_str())
            .arg(next.as_str())
            .arg(at.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error("Failed to transition link token"))?;

        match outcome {
            0 => Ok(Transition::Missing),
            1 => Ok(Transition::Applied),
            _ => Ok(Transition::Conflict(status.parse()?)),
        }
    }

    async fn put_code(&self, secret_hash: &str, code: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .set_ex(Self::code_key(secret_hash), code, ttl_seconds(ttl))
            .await
            .map_err(cache_error("Failed to store verification code"))?;
        Ok(())
    }

    async fn get_code(&self, secret_hash: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get(Self::code_key(secret_hash))
            .await
            .map_err(cache_error("Failed to get verification code"))
    }

    async fn delete_code(&self, secret_hash: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::code_key(secret_hash))
            .await
            .map_err(cache_error("Failed to delete verification code"))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════

impl FastStore<LinkedSession> for RedisLinkStore {
    async fn put(&self, record: &LinkedSession, ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let bytes =
            bincode::serialize(record).map_err(|e| AuthError::SerializationError(e.to_string()))?;

        let _: () = conn
            .set_ex(Self::session_key(&record.session_id), bytes, ttl_seconds(ttl))
            .await
            .map_err(cache_error("Failed to store session"))?;

        tracing::debug!(session_id = %record.session_id, "Cached linked session");
        Ok(())
    }

    async fn get(&self, key: &SessionId) -> Result<Option<LinkedSession>> {
        let mut conn = self.conn_manager.clone();
        let bytes: Option<Vec<u8>> = conn
            .get(Self::session_key(key))
            .await
            .map_err(cache_error("Failed to get session"))?;

        bytes
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| AuthError::SerializationError(e.to_string()))
            })
            .transpose()
    }

    async fn delete(&self, key: &SessionId) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::session_key(key))
            .await
            .map_err(cache_error("Failed to delete session"))?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Abuse Controls
// ═══════════════════════════════════════════════════════════════════════

impl AttemptCounter for RedisLinkStore {
    async fn increment(&self, key: &RateLimitKey, retention: Duration) -> Result<u64> {
        let mut conn = self.conn_manager.clone();
        redis::Script::new(INCREMENT_SCRIPT)
            .key(Self::rate_key(key))
            .arg(ttl_seconds(retention))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error("Failed to increment rate limit"))
    }

    async fn sum_counts(&self, keys: &[RateLimitKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let redis_keys: Vec<String> = keys.iter().map(Self::rate_key).collect();
        let counts: Vec<Option<u64>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await
            .map_err(cache_error("Failed to read rate limits"))?;

        Ok(counts.into_iter().flatten().sum())
    }
}

impl BlockStore for RedisLinkStore {
    async fn put_block(&self, block: &AccountBlock) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = Self::block_key(&block.identity);
        let json =
            serde_json::to_string(block).map_err(|e| AuthError::SerializationError(e.to_string()))?;
        let expires_at = block
            .expires_at
            .unwrap_or(block.blocked_at + INDEFINITE_BLOCK_CACHE_TTL);

        let _: () = redis::pipe()
            .atomic()
            .set(&key, json)
            .ignore()
            .expire_at(&key, expires_at.timestamp())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(cache_error("Failed to store block"))?;
        Ok(())
    }

    async fn get_block(&self, identity: &str) -> Result<Option<AccountBlock>> {
        let mut conn = self.conn_manager.clone();
        let json: Option<String> = conn
            .get(Self::block_key(identity))
            .await
            .map_err(cache_error("Failed to get block"))?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| AuthError::SerializationError(e.to_string()))
        })
        .transpose()
    }

    async fn lift_block(&self, identity: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::block_key(identity))
            .await
            .map_err(cache_error("Failed to lift block"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RateAction;

    #[test]
    fn test_key_layout() {
        let window_start = DateTime::from_timestamp(1_700_000_400, 0).unwrap_or_default();
        let key = RateLimitKey {
            identity: "tg:42".into(),
            action: RateAction::CompleteLink,
            window_start,
        };

        assert_eq!(RedisLinkStore::token_key("abc"), "link:token:abc");
        assert_eq!(
            RedisLinkStore::rate_key(&key),
            "link:rate:tg:42:complete_link:1700000400"
        );
        assert_eq!(RedisLinkStore::block_key("tg:42"), "link:block:tg:42");
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_seconds(Duration::zero()), 1);
        assert_eq!(ttl_seconds(Duration::milliseconds(-5)), 1);
        assert_eq!(ttl_seconds(Duration::minutes(5)), 300);
    }

    // Integration tests (require Redis):
    // docker run -d -p 6379:6379 redis:7-alpine
    // cargo test -- --ignored

    fn link(now: DateTime<Utc>) -> AuthLinkToken {
        AuthLinkToken {
            id: uuid::Uuid::new_v4(),
            secret_hash: crate::utils::hash_token(&crate::utils::generate_link_secret()),
            identity_email: "u@example.com".into(),
            external_user_ref: "tg:42".into(),
            verification_code: "123456".into(),
            status: LinkStatus::Pending,
            ip_address: "127.0.0.1".into(),
            user_agent: "test".into(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            completed_at: None,
            cancelled_at: None,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_redis_transition_is_compare_and_set() {
        let store = RedisLinkStore::new("redis://127.0.0.1:6379").await.unwrap();
        let now = Utc::now();
        let link = link(now);
        FastStore::<AuthLinkToken>::put(&store, &link, Duration::minutes(5))
            .await
            .unwrap();

        let first = store
            .transition_link(&link.secret_hash, LinkStatus::Pending, LinkStatus::Completed, now)
            .await
            .unwrap();
        let second = store
            .transition_link(&link.secret_hash, LinkStatus::Pending, LinkStatus::Cancelled, now)
            .await
            .unwrap();

        assert_eq!(first, Transition::Applied);
        assert_eq!(second, Transition::Conflict(LinkStatus::Completed));

        let stored = FastStore::<AuthLinkToken>::get(&store, &link.secret_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LinkStatus::Completed);
        assert!(stored.completed_at.is_some());

        assert_eq!(
            store
                .transition_link("missing", LinkStatus::Pending, LinkStatus::Expired, now)
                .await
                .unwrap(),
            Transition::Missing
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_redis_counters_sum_across_windows() {
        let store = RedisLinkStore::new("redis://127.0.0.1:6379").await.unwrap();
        let identity = format!("tg:{}", uuid::Uuid::new_v4());
        let current = RateLimitKey::containing(
            &identity,
            RateAction::StartLink,
            Utc::now(),
            Duration::minutes(10),
        );
        let previous = current.previous(1, Duration::minutes(10));

        store.increment(&current, Duration::hours(1)).await.unwrap();
        store.increment(&current, Duration::hours(1)).await.unwrap();
        store.increment(&previous, Duration::hours(1)).await.unwrap();

        assert_eq!(store.sum_counts(&[current.clone()]).await.unwrap(), 2);
        assert_eq!(store.sum_counts(&[current, previous]).await.unwrap(), 3);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_redis_session_round_trip() {
        let store = RedisLinkStore::new("redis://127.0.0.1:6379").await.unwrap();
        let now = Utc::now();
        let session = LinkedSession {
            id: uuid::Uuid::new_v4(),
            session_id: SessionId::new(),
            subject_user_id: "user-1".into(),
            external_user_ref: "tg:42".into(),
            tenant_id: "tenant-1".into(),
            access_token_hash: "a".into(),
            refresh_token_hash: "r".into(),
            created_at: now,
            expires_at: now + Duration::hours(24),
            last_used_at: None,
            revoked_at: None,
            is_active: true,
        };

        FastStore::<LinkedSession>::put(&store, &session, Duration::hours(24))
            .await
            .unwrap();
        let loaded = FastStore::<LinkedSession>::get(&store, &session.session_id)
            .await
            .unwrap();
        assert_eq!(loaded, Some(session.clone()));

        FastStore::<LinkedSession>::delete(&store, &session.session_id)
            .await
            .unwrap();
        assert_eq!(
            FastStore::<LinkedSession>::get(&store, &session.session_id)
                .await
                .unwrap(),
            None
        );
    }
}
