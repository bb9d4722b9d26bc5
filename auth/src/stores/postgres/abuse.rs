//! Attempt counters and account blocks.
//!
//! The durable counters mirror the fast ones for analytics and survive a cache
//! flush; windows older than the cleanup cutoff are deleted by
//! [`AttemptCounter::purge_windows_before`].

use super::{PostgresLinkStore, column, db_error};
use crate::error::Result;
use crate::providers::{AttemptCounter, BlockStore};
use crate::state::{AccountBlock, RateAction, RateLimitKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

impl AttemptCounter for PostgresLinkStore {
    async fn increment(&self, key: &RateLimitKey, _retention: Duration) -> Result<u64> {
        let attempts: i64 = sqlx::query_scalar(
            r"
            INSERT INTO link_rate_limits (identity, action, window_start, attempts)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (identity, action, window_start)
            DO UPDATE SET attempts = link_rate_limits.attempts + 1
            RETURNING attempts
            ",
        )
        .bind(&key.identity)
        .bind(key.action.as_str())
        .bind(key.window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("increment attempts"))?;

        Ok(u64::try_from(attempts).unwrap_or(0))
    }

    async fn sum_counts(&self, keys: &[RateLimitKey]) -> Result<u64> {
        // Callers pass one identity/action at a time, but group anyway.
        let mut groups: HashMap<(&str, RateAction), Vec<DateTime<Utc>>> = HashMap::new();
        for key in keys {
            groups
                .entry((key.identity.as_str(), key.action))
                .or_default()
                .push(key.window_start);
        }

        let mut total = 0u64;
        for ((identity, action), windows) in groups {
            let sum: i64 = sqlx::query_scalar(
                r"
                SELECT COALESCE(SUM(attempts), 0)::BIGINT
                FROM link_rate_limits
                WHERE identity = $1 AND action = $2 AND window_start = ANY($3)
                ",
            )
            .bind(identity)
            .bind(action.as_str())
            .bind(windows)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("sum attempts"))?;
            total += u64::try_from(sum).unwrap_or(0);
        }
        Ok(total)
    }

    async fn purge_windows_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM link_rate_limits WHERE window_start < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_error("purge attempts"))?;
        Ok(result.rows_affected())
    }
}

impl BlockStore for PostgresLinkStore {
    async fn put_block(&self, block: &AccountBlock) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO link_account_blocks (id, identity, reason, blocked_at, expires_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (identity) DO UPDATE
            SET id = EXCLUDED.id,
                reason = EXCLUDED.reason,
                blocked_at = EXCLUDED.blocked_at,
                expires_at = EXCLUDED.expires_at,
                is_active = EXCLUDED.is_active
            ",
        )
        .bind(block.id)
        .bind(&block.identity)
        .bind(&block.reason)
        .bind(block.blocked_at)
        .bind(block.expires_at)
        .bind(block.is_active)
        .execute(&self.pool)
        .await
        .map_err(db_error("put block"))?;
        Ok(())
    }

    async fn get_block(&self, identity: &str) -> Result<Option<AccountBlock>> {
        let row = sqlx::query(
            r"
            SELECT id, identity, reason, blocked_at, expires_at, is_active
            FROM link_account_blocks
            WHERE identity = $1
            ",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get block"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AccountBlock {
            id: column(&row, "id")?,
            identity: column(&row, "identity")?,
            reason: column(&row, "reason")?,
            blocked_at: column(&row, "blocked_at")?,
            expires_at: column(&row, "expires_at")?,
            is_active: column(&row, "is_active")?,
        }))
    }

    async fn lift_block(&self, identity: &str) -> Result<()> {
        sqlx::query("UPDATE link_account_blocks SET is_active = FALSE WHERE identity = $1")
            .bind(identity)
            .execute(&self.pool)
            .await
            .map_err(db_error("lift block"))?;
        Ok(())
    }

    async fn deactivate_expired_blocks(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE link_account_blocks
            SET is_active = FALSE
            WHERE is_active AND expires_at IS NOT NULL AND expires_at < $1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("deactivate blocks"))?;
        Ok(result.rows_affected())
    }
}
