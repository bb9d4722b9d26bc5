//! `PostgreSQL` durable store.
//!
//! One [`PostgresLinkStore`] backs every durable trait the broker needs:
//! handshakes, linked sessions, attempt counters, blocks, the audit trail and
//! refresh tokens. [`PostgresCredentialResolver`] reads the account directory.
//!
//! # Example
//!
//! ```no_run
//! use channel_link_auth::stores::postgres::PostgresLinkStore;
//! use sqlx::PgPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgresql://localhost/links").await?;
//! let store = PostgresLinkStore::new(pool);
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

pub mod abuse;
pub mod accounts;
pub mod audit;
pub mod links;

pub use accounts::PostgresCredentialResolver;

use crate::error::{AuthError, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};

/// `PostgreSQL` system of record for the linking flow.
#[derive(Clone)]
pub struct PostgresLinkStore {
    pool: PgPool,
}

impl PostgresLinkStore {
    /// Create a store on an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AuthError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }
}

/// Map a driver error, naming the failed step.
pub(crate) fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AuthError {
    move |e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AuthError::DatabaseError(format!("{context}: duplicate key"))
        }
        _ => AuthError::DatabaseError(format!("{context}: {e}")),
    }
}

/// Read one column, turning decode failures into `DatabaseError`.
pub(crate) fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| AuthError::DatabaseError(format!("column {name}: {e}")))
}
