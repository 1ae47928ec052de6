//! [`Database`] over an `sqlx` any-driver pool.
//!
//! The URL scheme picks the driver (`postgres://`, `mysql://`,
//! `sqlite:`), so one type covers every supported dialect.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{Any, AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::db::{Database, Queryable, SqlRow, SqlValue, Tx};
use crate::error::{LedgerError, LedgerResult};

/// Pool-backed store handle. Cheap to clone.
#[derive(Clone)]
pub struct SqlxDatabase {
    pool: AnyPool,
}

impl SqlxDatabase {
    /// Connect to `url` with at most `max_connections` pooled connections.
    ///
    /// An in-memory sqlite URL is pinned to one connection that never
    /// expires, since every sqlite connection would otherwise see its own
    /// empty database.
    pub async fn connect(url: &str, max_connections: u32) -> LedgerResult<Self> {
        sqlx::any::install_default_drivers();

        let in_memory = url.starts_with("sqlite::memory:") || url.contains("mode=memory");
        let options = if in_memory {
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(5))
        };

        let pool = options.connect(url).await?;
        debug!(in_memory, max_connections, "ledger pool connected");
        Ok(Self { pool })
    }

    /// Wait for pooled connections to close.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Database for SqlxDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn Tx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlxTx { tx }))
    }
}

/// An open any-driver transaction. Rolls back on drop.
pub struct SqlxTx {
    tx: sqlx::Transaction<'static, Any>,
}

#[async_trait]
impl Queryable for SqlxTx {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> LedgerResult<u64> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> LedgerResult<Vec<SqlRow>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Tx for SqlxTx {
    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[SqlValue],
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Text(s) => query.bind(s.clone()),
            SqlValue::Bytes(b) => query.bind(b.clone()),
        };
    }
    query
}

/// Decode every column of an any-driver row.
///
/// Drivers disagree on integer widths (postgres `INT` is 32-bit, sqlite
/// integers are 64-bit), so each column is probed from the widest
/// integer down to raw bytes.
fn decode_row(row: &AnyRow) -> LedgerResult<SqlRow> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            v.map_or(SqlValue::Null, SqlValue::Int)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            v.map_or(SqlValue::Null, |v| SqlValue::Int(v as i64))
        } else if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            v.map_or(SqlValue::Null, SqlValue::Text)
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            v.map_or(SqlValue::Null, SqlValue::Bytes)
        } else {
            return Err(LedgerError::Decode(format!(
                "column {idx} has an unsupported type"
            )));
        };
        values.push(value);
    }
    Ok(SqlRow(values))
}
