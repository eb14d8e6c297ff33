//! Postgres-backed transactional storage.
//!
//! Entity rows live in one generic table keyed by `(table_name, row_key)` with
//! a `version` column and a JSONB body; the relational mapping of business
//! fields is left to downstream read models.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StorageError | Scenario |
//! |------------|----------------------|--------------|----------|
//! | Database (unique violation) | `23505` | `Backend` | Duplicate outbox sequence (counter bypassed) |
//! | Database (lock not available) | `55P03` | `LockTimeout` | `lock_timeout` expired on an entity row or the sequence counter row |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed | N/A | `Backend` | Connection pool was closed |
//! | Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! Version precondition failures are not database errors: an `UPDATE … WHERE
//! version = $n` or `INSERT … ON CONFLICT DO NOTHING` that touches no row is
//! reported as `StorageError::Conflict` with the version actually stored.
//!
//! ## Lock waits
//!
//! Every transaction starts with `SET LOCAL lock_timeout` set to
//! [`PostgresStorage::lock_timeout`], so a write blocked on another
//! transaction's row gives up instead of waiting forever. Sequence allocation
//! narrows it further to the commit budget that remains.
//!
//! ## Sync bridge
//!
//! The [`Storage`] trait is synchronous. `PostgresStorage` owns a
//! current-thread tokio runtime and blocks on it, so it must be driven from
//! plain threads, not from inside another async runtime.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::instrument;
use uuid::Uuid;

use commitbox_core::{EntityId, ExpectedVersion};

use super::{RowWrite, Storage, StorageError, StoredRow, TxnHandle};
use crate::config::UnitOfWorkConfig;
use crate::outbox::{DispatchMark, OutboxRow, OutboxStatus, OutboxStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS commitbox_rows (
        table_name  TEXT        NOT NULL,
        row_key     UUID        NOT NULL,
        version     BIGINT      NOT NULL CHECK (version > 0),
        body        JSONB       NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (table_name, row_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commitbox_sequences (
        scope       TEXT   PRIMARY KEY,
        last_value  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commitbox_outbox (
        sequence        BIGINT      PRIMARY KEY,
        event_id        UUID        NOT NULL UNIQUE,
        event_type      TEXT        NOT NULL,
        schema_version  INT         NOT NULL,
        payload         JSONB       NOT NULL,
        occurred_at     TIMESTAMPTZ NOT NULL,
        correlates_with UUID        NULL,
        status          TEXT        NOT NULL,
        recorded_at     TIMESTAMPTZ NOT NULL,
        dispatched_at   TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS commitbox_outbox_pending
        ON commitbox_outbox (sequence)
        WHERE status = 'pending'
    "#,
];

/// Postgres-backed [`Storage`] + [`OutboxStore`].
///
/// Each [`TxnHandle`] maps to one pooled connection holding an open
/// transaction until `commit` or `rollback`.
pub struct PostgresStorage {
    pool: PgPool,
    runtime: Runtime,
    next_txn: AtomicU64,
    lock_timeout: Duration,
    open: Mutex<HashMap<TxnHandle, Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStorage")
            .field("pool", &self.pool)
            .field("next_txn", &self.next_txn)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl PostgresStorage {
    /// Connect a pool and start the runtime that drives it.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to start runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime,
            next_txn: AtomicU64::new(0),
            lock_timeout: UnitOfWorkConfig::default().commit_timeout,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Bound every lock wait of later transactions; usually the unit of work's
    /// `commit_timeout`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Create the row, counter and outbox tables if they are missing.
    #[instrument(skip(self), err)]
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        self.runtime.block_on(async {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            }
            Ok(())
        })
    }

    fn take(&self, txn: TxnHandle) -> Result<Transaction<'static, Postgres>, StorageError> {
        self.open
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .remove(&txn)
            .ok_or(StorageError::UnknownTransaction(txn))
    }

    fn put_back(&self, txn: TxnHandle, tx: Transaction<'static, Postgres>) -> Result<(), StorageError> {
        self.open
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .insert(txn, tx);
        Ok(())
    }
}

impl Storage for PostgresStorage {
    #[instrument(skip(self), err)]
    fn begin(&self) -> Result<TxnHandle, StorageError> {
        let tx = self.runtime.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            set_lock_timeout(&mut tx, self.lock_timeout).await?;
            Ok::<_, StorageError>(tx)
        })?;
        let txn = TxnHandle::from_raw(self.next_txn.fetch_add(1, Ordering::Relaxed) + 1);
        self.put_back(txn, tx)?;
        Ok(txn)
    }

    #[instrument(skip(self), fields(%txn, %key), err)]
    fn read_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
    ) -> Result<Option<StoredRow>, StorageError> {
        let mut tx = self.take(txn)?;
        let result = self.runtime.block_on(select_row(&mut tx, table, key));
        self.put_back(txn, tx)?;
        result
    }

    #[instrument(skip(self, write), fields(%txn, %key, expected = %write.expected), err)]
    fn write_row(
        &self,
        txn: TxnHandle,
        table: &str,
        key: EntityId,
        write: RowWrite,
    ) -> Result<u64, StorageError> {
        let mut tx = self.take(txn)?;
        let result = self
            .runtime
            .block_on(upsert_row(&mut tx, table, key, &write, self.lock_timeout));
        self.put_back(txn, tx)?;
        result
    }

    #[instrument(skip(self), fields(%txn), err)]
    fn allocate_sequence(
        &self,
        txn: TxnHandle,
        scope: &str,
        count: u64,
        timeout: Duration,
    ) -> Result<Range<u64>, StorageError> {
        let mut tx = self.take(txn)?;
        let result = self
            .runtime
            .block_on(bump_counter(&mut tx, scope, count, timeout));
        self.put_back(txn, tx)?;
        result
    }

    #[instrument(skip(self), fields(%txn), err)]
    fn commit(&self, txn: TxnHandle) -> Result<(), StorageError> {
        let tx = self.take(txn)?;
        self.runtime
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(%txn), err)]
    fn rollback(&self, txn: TxnHandle) -> Result<(), StorageError> {
        let tx = self.take(txn)?;
        self.runtime
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

impl OutboxStore for PostgresStorage {
    #[instrument(skip(self, rows), fields(%txn, count = rows.len()), err)]
    fn insert_outbox_rows(&self, txn: TxnHandle, rows: &[OutboxRow]) -> Result<(), StorageError> {
        let mut tx = self.take(txn)?;
        let result = self.runtime.block_on(async {
            for row in rows {
                insert_outbox_row(&mut tx, row).await?;
            }
            Ok(())
        });
        self.put_back(txn, tx)?;
        result
    }

    #[instrument(skip(self), err)]
    fn pending_outbox_rows(&self, limit: usize) -> Result<Vec<OutboxRow>, StorageError> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT
                        sequence,
                        event_id,
                        event_type,
                        schema_version,
                        payload,
                        occurred_at,
                        correlates_with,
                        status,
                        recorded_at,
                        dispatched_at
                    FROM commitbox_outbox
                    WHERE status = 'pending'
                    ORDER BY sequence ASC
                    LIMIT $1
                    "#,
                )
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("pending_outbox_rows", e))?;

        rows.iter()
            .map(|row| {
                OutboxRowRecord::from_row(row)
                    .map_err(|e| StorageError::Backend(format!("failed to decode outbox row: {e}")))
                    .and_then(OutboxRow::try_from)
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    fn set_dispatched(&self, sequence: u64, at: DateTime<Utc>) -> Result<DispatchMark, StorageError> {
        self.runtime.block_on(async {
            let updated = sqlx::query(
                r#"
                UPDATE commitbox_outbox
                SET status = 'dispatched', dispatched_at = $2
                WHERE sequence = $1 AND status = 'pending'
                "#,
            )
            .bind(sequence as i64)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_dispatched", e))?;

            if updated.rows_affected() == 1 {
                return Ok(DispatchMark::Marked);
            }

            let exists = sqlx::query("SELECT 1 FROM commitbox_outbox WHERE sequence = $1")
                .bind(sequence as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("set_dispatched", e))?;

            Ok(if exists.is_some() {
                DispatchMark::AlreadyDispatched
            } else {
                DispatchMark::Unknown
            })
        })
    }

    #[instrument(skip(self), err)]
    fn count_pending(&self) -> Result<u64, StorageError> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT COUNT(*) AS total FROM commitbox_outbox WHERE status = 'pending'")
                    .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("count_pending", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StorageError::Backend(format!("failed to read count: {e}")))?;
        Ok(total as u64)
    }
}

async fn select_row(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    key: EntityId,
) -> Result<Option<StoredRow>, StorageError> {
    let row = sqlx::query(
        "SELECT version, body FROM commitbox_rows WHERE table_name = $1 AND row_key = $2",
    )
    .bind(table)
    .bind(key.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("read_row", e))?;

    row.map(|row| {
        let version: i64 = row
            .try_get("version")
            .map_err(|e| StorageError::Backend(format!("failed to read version: {e}")))?;
        let body: serde_json::Value = row
            .try_get("body")
            .map_err(|e| StorageError::Backend(format!("failed to read body: {e}")))?;
        Ok(StoredRow {
            key,
            version: version as u64,
            body,
        })
    })
    .transpose()
}

async fn stored_version(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    key: EntityId,
) -> Result<Option<u64>, StorageError> {
    Ok(select_row(tx, table, key).await?.map(|row| row.version))
}

async fn upsert_row(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    key: EntityId,
    write: &RowWrite,
    lock_timeout: Duration,
) -> Result<u64, StorageError> {
    let next = write.next_version();
    let touched = match write.expected {
        ExpectedVersion::Absent => sqlx::query(
            r#"
            INSERT INTO commitbox_rows (table_name, row_key, version, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (table_name, row_key) DO NOTHING
            "#,
        )
        .bind(table)
        .bind(key.as_uuid())
        .bind(next as i64)
        .bind(&write.body)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_lock_error(table, lock_timeout, "insert_row", e))?,
        ExpectedVersion::Exact(current) => sqlx::query(
            r#"
            UPDATE commitbox_rows
            SET version = $4, body = $5, updated_at = NOW()
            WHERE table_name = $1 AND row_key = $2 AND version = $3
            "#,
        )
        .bind(table)
        .bind(key.as_uuid())
        .bind(current as i64)
        .bind(next as i64)
        .bind(&write.body)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_lock_error(table, lock_timeout, "update_row", e))?,
    };

    if touched.rows_affected() == 1 {
        return Ok(next);
    }

    Err(StorageError::Conflict {
        table: table.to_string(),
        key,
        expected: write.expected,
        actual: stored_version(tx, table, key).await?,
    })
}

async fn set_lock_timeout(
    tx: &mut Transaction<'static, Postgres>,
    timeout: Duration,
) -> Result<(), StorageError> {
    // SET does not accept bind parameters.
    let statement = format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis().max(1));
    sqlx::query(&statement)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
    Ok(())
}

/// Bump the scope counter; the row lock is held until the transaction ends,
/// which serializes allocation in commit order.
async fn bump_counter(
    tx: &mut Transaction<'static, Postgres>,
    scope: &str,
    count: u64,
    timeout: Duration,
) -> Result<Range<u64>, StorageError> {
    set_lock_timeout(tx, timeout).await?;

    sqlx::query(
        "INSERT INTO commitbox_sequences (scope, last_value) VALUES ($1, 0) ON CONFLICT (scope) DO NOTHING",
    )
    .bind(scope)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_lock_error(scope, timeout, "seed_sequence", e))?;

    let row = sqlx::query(
        r#"
        UPDATE commitbox_sequences
        SET last_value = last_value + $2
        WHERE scope = $1
        RETURNING last_value
        "#,
    )
    .bind(scope)
    .bind(count as i64)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_lock_error(scope, timeout, "allocate_sequence", e))?;

    let last: i64 = row
        .try_get("last_value")
        .map_err(|e| StorageError::Backend(format!("failed to read last_value: {e}")))?;
    let last = last as u64;
    Ok(last + 1 - count..last + 1)
}

async fn insert_outbox_row(
    tx: &mut Transaction<'static, Postgres>,
    row: &OutboxRow,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO commitbox_outbox (
            sequence,
            event_id,
            event_type,
            schema_version,
            payload,
            occurred_at,
            correlates_with,
            status,
            recorded_at,
            dispatched_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(row.sequence as i64)
    .bind(row.event_id)
    .bind(&row.event_type)
    .bind(row.schema_version as i32)
    .bind(&row.payload)
    .bind(row.occurred_at)
    .bind(row.correlates_with.map(Uuid::from))
    .bind(row.status.as_str())
    .bind(row.recorded_at)
    .bind(row.dispatched_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox_row", e))?;
    Ok(())
}

fn map_lock_error(scope: &str, timeout: Duration, operation: &str, err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("55P03") {
            return StorageError::LockTimeout {
                scope: scope.to_string(),
                waited: timeout,
            };
        }
    }
    map_sqlx_error(operation, err)
}

/// Map SQLx errors to StorageError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StorageError::Backend(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            StorageError::Backend(format!("connection pool closed in {operation}"))
        }
        _ => StorageError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct OutboxRowRecord {
    sequence: i64,
    event_id: Uuid,
    event_type: String,
    schema_version: i32,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    correlates_with: Option<Uuid>,
    status: String,
    recorded_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRowRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRowRecord {
            sequence: row.try_get("sequence")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            schema_version: row.try_get("schema_version")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
            correlates_with: row.try_get("correlates_with")?,
            status: row.try_get("status")?,
            recorded_at: row.try_get("recorded_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
        })
    }
}

impl TryFrom<OutboxRowRecord> for OutboxRow {
    type Error = StorageError;

    fn try_from(row: OutboxRowRecord) -> Result<Self, Self::Error> {
        Ok(OutboxRow {
            sequence: row.sequence as u64,
            event_id: row.event_id,
            event_type: row.event_type,
            schema_version: row.schema_version as u32,
            payload: row.payload,
            occurred_at: row.occurred_at,
            correlates_with: row.correlates_with.map(EntityId::from_uuid),
            status: row.status.parse::<OutboxStatus>()?,
            recorded_at: row.recorded_at,
            dispatched_at: row.dispatched_at,
        })
    }
}
