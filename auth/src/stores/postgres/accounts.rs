//! Credential resolver over the account directory tables.

use super::{column, db_error};
use crate::error::{AuthError, Result};
use crate::providers::CredentialResolver;
use crate::state::{ResolvedAccount, TenantMembership};
use crate::utils::normalize_email;
use sqlx::PgPool;

/// Resolves identity emails against the `users` and `user_tenants` tables.
///
/// Read-only; the tables belong to the account system.
#[derive(Clone)]
pub struct PostgresCredentialResolver {
    pool: PgPool,
}

impl PostgresCredentialResolver {
    /// Create a resolver on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CredentialResolver for PostgresCredentialResolver {
    async fn resolve(&self, email: &str) -> Result<ResolvedAccount> {
        let rows = sqlx::query(
            r"
            SELECT u.id AS user_id, t.tenant_id, t.role, t.is_default
            FROM users u
            LEFT JOIN user_tenants t ON t.user_id = u.id
            WHERE lower(u.email) = $1
            ORDER BY t.is_default DESC NULLS LAST, t.created_at, t.tenant_id
            ",
        )
        .bind(normalize_email(email))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("resolve account"))?;

        let Some(first) = rows.first() else {
            return Err(AuthError::AccountNotFound);
        };
        let subject_user_id: String = column(first, "user_id")?;

        let mut memberships = Vec::with_capacity(rows.len());
        for row in &rows {
            // LEFT JOIN yields one NULL row for accounts without tenants.
            let Some(tenant_id) = column::<Option<String>>(row, "tenant_id")? else {
                continue;
            };
            memberships.push(TenantMembership {
                tenant_id,
                role: column::<Option<String>>(row, "role")?.unwrap_or_default(),
                is_default: column::<Option<bool>>(row, "is_default")?.unwrap_or(false),
            });
        }

        Ok(ResolvedAccount {
            subject_user_id,
            memberships,
        })
    }
}
