//! `PostgreSQL` storage for the Allotment allocation engine.
//!
//! [`PostgresAllocationStore`] implements the `AllocationStore` seam from
//! `allotment-core` on top of sqlx:
//!
//! - Every unit of work is one database transaction
//! - Ledger and order rows are locked with `SELECT ... FOR UPDATE`
//! - Ledger rows are created lazily with `INSERT ... ON CONFLICT DO NOTHING`
//! - Outbox rows are inserted in the same transaction as the state they describe
//!
//! Lock waits are bounded by the `lock_timeout` set on every pooled
//! connection; an expired wait surfaces as `StoreError::LockTimeout`.
//!
//! # Example
//!
//! ```no_run
//! use allotment_postgres::{PoolSettings, PostgresAllocationStore};
//!
//! # async fn example() -> Result<(), allotment_core::StoreError> {
//! let settings = PoolSettings::new("postgres://localhost/shop");
//! let store = PostgresAllocationStore::connect(&settings).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod rows;
mod unit_of_work;

use allotment_core::outbox::OutboxRecord;
use allotment_core::store::{AllocationStore, Isolation, StoreError};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub use unit_of_work::PgUnitOfWork;

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Connection string
    pub url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Connections kept open when idle
    pub min_connections: u32,
    /// How long to wait for a connection
    pub connect_timeout: Duration,
    /// How long an idle connection is kept
    pub idle_timeout: Duration,
    /// Longest wait for a row lock before the statement fails
    pub lock_timeout: Duration,
}

impl PoolSettings {
    /// Settings with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_millis(5000),
        }
    }
}

/// `PostgreSQL`-backed allocation store.
#[derive(Debug, Clone)]
pub struct PostgresAllocationStore {
    pool: PgPool,
}

impl PostgresAllocationStore {
    /// Open a connection pool with `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be reached.
    pub async fn connect(settings: &PoolSettings) -> Result<Self, StoreError> {
        let lock_timeout_ms = settings.lock_timeout.as_millis();
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout)
            .idle_timeout(Some(settings.idle_timeout))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET lock_timeout = {lock_timeout_ms}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&settings.url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;

        tracing::info!(
            max_connections = settings.max_connections,
            lock_timeout_ms = %lock_timeout_ms,
            "PostgreSQL pool ready"
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Committed outbox rows not yet marked relayed, lowest sequence first.
    ///
    /// Sequences are taken at insert time, so a row can become visible after
    /// rows with higher sequences. Relays therefore poll by the `relayed_at`
    /// marker instead of a sequence cursor: a late commit stays pending until
    /// [`mark_relayed`](Self::mark_relayed) covers it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn pending_outbox(&self, limit: u32) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT sequence, aggregate_type, aggregate_id, event_type, payload, metadata, occurred_at
            FROM outbox
            WHERE relayed_at IS NULL
            ORDER BY sequence ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(rows::map_sqlx_error)?;

        rows.iter().map(rows::outbox_record).collect()
    }

    /// Mark outbox rows as forwarded. Returns how many were newly marked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_relayed(
        &self,
        sequences: &[i64],
        relayed_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE outbox SET relayed_at = $2 WHERE sequence = ANY($1) AND relayed_at IS NULL",
        )
        .bind(sequences)
        .bind(relayed_at)
        .execute(&self.pool)
        .await
        .map_err(rows::map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

impl AllocationStore for PostgresAllocationStore {
    type UnitOfWork = PgUnitOfWork;

    async fn begin(&self, isolation: Isolation) -> Result<PgUnitOfWork, StoreError> {
        let mut tx = self.pool.begin().await.map_err(rows::map_sqlx_error)?;
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
        sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(rows::map_sqlx_error)?;
        Ok(PgUnitOfWork::new(tx))
    }
}
