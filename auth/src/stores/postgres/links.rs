//! Handshake and linked session tables.

use super::{PostgresLinkStore, column, db_error};
use crate::error::Result;
use crate::providers::{DurableStore, LinkTokenRepository, SessionRepository, Transition};
use crate::state::{AuthLinkToken, LinkStatus, LinkedSession, SessionId};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;

const LINK_COLUMNS: &str = "id, secret_hash, identity_email, external_user_ref, \
     verification_code, status, ip_address, user_agent, created_at, expires_at, \
     completed_at, cancelled_at";

const SESSION_COLUMNS: &str = "id, session_id, subject_user_id, external_user_ref, tenant_id, \
     access_token_hash, refresh_token_hash, created_at, expires_at, last_used_at, revoked_at, \
     is_active";

fn row_to_link(row: &PgRow) -> Result<AuthLinkToken> {
    let status: String = column(row, "status")?;
    Ok(AuthLinkToken {
        id: column(row, "id")?,
        secret_hash: column(row, "secret_hash")?,
        identity_email: column(row, "identity_email")?,
        external_user_ref: column(row, "external_user_ref")?,
        verification_code: column(row, "verification_code")?,
        status: status.parse()?,
        ip_address: column(row, "ip_address")?,
        user_agent: column(row, "user_agent")?,
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
        completed_at: column(row, "completed_at")?,
        cancelled_at: column(row, "cancelled_at")?,
    })
}

fn row_to_session(row: &PgRow) -> Result<LinkedSession> {
    Ok(LinkedSession {
        id: column(row, "id")?,
        session_id: SessionId(column(row, "session_id")?),
        subject_user_id: column(row, "subject_user_id")?,
        external_user_ref: column(row, "external_user_ref")?,
        tenant_id: column(row, "tenant_id")?,
        access_token_hash: column(row, "access_token_hash")?,
        refresh_token_hash: column(row, "refresh_token_hash")?,
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
        last_used_at: column(row, "last_used_at")?,
        revoked_at: column(row, "revoked_at")?,
        is_active: column(row, "is_active")?,
    })
}

impl DurableStore<AuthLinkToken> for PostgresLinkStore {
    async fn insert(&self, link: &AuthLinkToken) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO link_tokens (
                id, secret_hash, identity_email, external_user_ref, verification_code,
                status, ip_address, user_agent, created_at, expires_at,
                completed_at, cancelled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(link.id)
        .bind(&link.secret_hash)
        .bind(&link.identity_email)
        .bind(&link.external_user_ref)
        .bind(&link.verification_code)
        .bind(link.status.as_str())
        .bind(&link.ip_address)
        .bind(&link.user_agent)
        .bind(link.created_at)
        .bind(link.expires_at)
        .bind(link.completed_at)
        .bind(link.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert link"))?;
        Ok(())
    }

    async fn fetch(&self, secret_hash: &String) -> Result<Option<AuthLinkToken>> {
        let query = format!("SELECT {LINK_COLUMNS} FROM link_tokens WHERE secret_hash = $1");
        let row = sqlx::query(&query)
            .bind(secret_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("fetch link"))?;

        row.as_ref().map(row_to_link).transpose()
    }
}

impl LinkTokenRepository for PostgresLinkStore {
    async fn transition_link(
        &self,
        secret_hash: &str,
        expected: LinkStatus,
        next: LinkStatus,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        let result = sqlx::query(
            r"
            UPDATE link_tokens
            SET status = $3,
                completed_at = CASE WHEN $3 = 'completed' THEN $4 ELSE completed_at END,
                cancelled_at = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancelled_at END
            WHERE secret_hash = $1 AND status = $2
            ",
        )
        .bind(secret_hash)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("transition link"))?;

        if result.rows_affected() > 0 {
            return Ok(Transition::Applied);
        }

        // Lost the race or never existed; report what is there now.
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM link_tokens WHERE secret_hash = $1")
                .bind(secret_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("read link status"))?;

        match current {
            Some(status) => Ok(Transition::Conflict(status.parse()?)),
            None => Ok(Transition::Missing),
        }
    }

    async fn purge_expired_links(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM link_tokens
            WHERE status IN ('pending', 'expired') AND expires_at < $1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("purge links"))?;
        Ok(result.rows_affected())
    }
}

impl DurableStore<LinkedSession> for PostgresLinkStore {
    async fn insert(&self, session: &LinkedSession) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO linked_sessions (
                id, session_id, subject_user_id, external_user_ref, tenant_id,
                access_token_hash, refresh_token_hash, created_at, expires_at,
                last_used_at, revoked_at, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(session.id)
        .bind(session.session_id.0)
        .bind(&session.subject_user_id)
        .bind(&session.external_user_ref)
        .bind(&session.tenant_id)
        .bind(&session.access_token_hash)
        .bind(&session.refresh_token_hash)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.last_used_at)
        .bind(session.revoked_at)
        .bind(session.is_active)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert session"))?;
        Ok(())
    }

    async fn fetch(&self, session_id: &SessionId) -> Result<Option<LinkedSession>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM linked_sessions WHERE session_id = $1");
        let row = sqlx::query(&query)
            .bind(session_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("fetch session"))?;

        row.as_ref().map(row_to_session).transpose()
    }
}

impl SessionRepository for PostgresLinkStore {
    async fn touch_session(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE linked_sessions SET last_used_at = $2 WHERE session_id = $1")
            .bind(session_id.0)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_error("touch session"))?;
        Ok(())
    }

    async fn revoke_session(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE linked_sessions
            SET revoked_at = $2, is_active = FALSE
            WHERE session_id = $1 AND revoked_at IS NULL
            ",
        )
        .bind(session_id.0)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("revoke session"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_token_hashes(
        &self,
        session_id: SessionId,
        access_token_hash: &str,
        refresh_token_hash: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE linked_sessions
            SET access_token_hash = $2, refresh_token_hash = $3
            WHERE session_id = $1 AND is_active AND revoked_at IS NULL
            ",
        )
        .bind(session_id.0)
        .bind(access_token_hash)
        .bind(refresh_token_hash)
        .execute(&self.pool)
        .await
        .map_err(db_error("replace token hashes"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_sessions(&self, external_user_ref: &str) -> Result<Vec<LinkedSession>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM linked_sessions \
             WHERE external_user_ref = $1 AND is_active \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(external_user_ref)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list sessions"))?;

        rows.iter().map(row_to_session).collect()
    }

    async fn revoke_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE linked_sessions
            SET is_active = FALSE, revoked_at = COALESCE(revoked_at, $1)
            WHERE is_active AND expires_at < $1
            ",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("revoke expired sessions"))?;
        Ok(result.rows_affected())
    }
}
