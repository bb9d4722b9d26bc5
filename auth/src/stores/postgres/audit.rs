//! Audit trail and refresh token tables.

use super::{PostgresLinkStore, column, db_error};
use crate::error::{AuthError, Result};
use crate::providers::{AuditSink, RefreshRecord, RefreshStore};
use crate::state::{AuditLogEntry, AuditPage, SessionId};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;

fn row_to_entry(row: &PgRow) -> Result<AuditLogEntry> {
    let action: String = column(row, "action")?;
    let status: String = column(row, "status")?;
    let session_id: Option<uuid::Uuid> = column(row, "session_id")?;
    Ok(AuditLogEntry {
        id: column(row, "id")?,
        identity_email: column(row, "identity_email")?,
        external_user_ref: column(row, "external_user_ref")?,
        ip_address: column(row, "ip_address")?,
        user_agent: column(row, "user_agent")?,
        action: action.parse()?,
        status: status.parse()?,
        error_message: column(row, "error_message")?,
        link_token_id: column(row, "link_token_id")?,
        session_id: session_id.map(SessionId),
        created_at: column(row, "created_at")?,
    })
}

fn row_to_refresh(row: &PgRow) -> Result<RefreshRecord> {
    Ok(RefreshRecord {
        token_hash: column(row, "token_hash")?,
        subject_user_id: column(row, "subject_user_id")?,
        tenant_id: column(row, "tenant_id")?,
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
        revoked_at: column(row, "revoked_at")?,
    })
}

impl AuditSink for PostgresLinkStore {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO link_audit_log (
                id, identity_email, external_user_ref, ip_address, user_agent,
                action, status, error_message, link_token_id, session_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(entry.id)
        .bind(&entry.identity_email)
        .bind(&entry.external_user_ref)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.action.as_str())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(entry.link_token_id)
        .bind(entry.session_id.map(|id| id.0))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("append audit entry"))?;
        Ok(())
    }

    async fn page(&self, external_user_ref: &str, limit: u32, offset: u32) -> Result<AuditPage> {
        let rows = sqlx::query(
            r"
            SELECT id, identity_email, external_user_ref, ip_address, user_agent,
                   action, status, error_message, link_token_id, session_id, created_at
            FROM link_audit_log
            WHERE external_user_ref = $1
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(external_user_ref)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("page audit log"))?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM link_audit_log WHERE external_user_ref = $1")
                .bind(external_user_ref)
                .fetch_one(&self.pool)
                .await
                .map_err(db_error("count audit log"))?;

        Ok(AuditPage {
            entries: rows.iter().map(row_to_entry).collect::<Result<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
        })
    }
}

impl RefreshStore for PostgresLinkStore {
    async fn store_refresh(&self, record: &RefreshRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO refresh_tokens
                (token_hash, subject_user_id, tenant_id, created_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(&record.token_hash)
        .bind(&record.subject_user_id)
        .bind(&record.tenant_id)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("store refresh token"))?;
        Ok(())
    }

    async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<RefreshRecord>> {
        let row = sqlx::query(
            r"
            SELECT token_hash, subject_user_id, tenant_id, created_at, expires_at, revoked_at
            FROM refresh_tokens
            WHERE token_hash = $1
            ",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get refresh token"))?;

        row.as_ref().map(row_to_refresh).transpose()
    }

    async fn rotate_refresh(
        &self,
        old_hash: &str,
        replacement: &RefreshRecord,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("begin refresh rotation"))?;

        // Row lock on the old token serializes concurrent rotations.
        let revoked = sqlx::query(
            r"
            UPDATE refresh_tokens
            SET revoked_at = $2
            WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > $2
            ",
        )
        .bind(old_hash)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("revoke rotated refresh token"))?;

        if revoked.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(db_error("rollback refresh rotation"))?;
            return Err(AuthError::InvalidCredentials);
        }

        sqlx::query(
            r"
            INSERT INTO refresh_tokens
                (token_hash, subject_user_id, tenant_id, created_at, expires_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, NULL)
            ",
        )
        .bind(&replacement.token_hash)
        .bind(&replacement.subject_user_id)
        .bind(&replacement.tenant_id)
        .bind(replacement.created_at)
        .bind(replacement.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("insert rotated refresh token"))?;

        tx.commit()
            .await
            .map_err(db_error("commit refresh rotation"))?;
        Ok(())
    }

    async fn revoke_refresh(&self, token_hash: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2 WHERE token_hash = $1 AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("revoke refresh token"))?;
        Ok(result.rows_affected() > 0)
    }
}
