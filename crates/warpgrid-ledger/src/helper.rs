//! Statement builders.
//!
//! `SqlHelper` assembles SELECT / INSERT / UPDATE / DELETE / COUNT
//! statements from a table name, a column list or attribute map, and a
//! `?`-marker predicate, rebinds them for the configured dialect, and runs
//! them against any [`Queryable`] (a transaction, usually).

use tracing::debug;

use crate::db::{Queryable, SqlAttributes, SqlRow, SqlValue};
use crate::dialect::{Dialect, question_marks};
use crate::error::{LedgerError, LedgerResult};

/// Whether a select takes a row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// `FOR UPDATE`, held until the surrounding transaction ends.
    Lock,
    NoLock,
}

/// Dialect-aware statement builder. `Copy`, so it can be moved into
/// units of work freely.
#[derive(Debug, Clone, Copy)]
pub struct SqlHelper {
    dialect: Dialect,
}

impl SqlHelper {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn rebind(&self, query: &str) -> String {
        self.dialect.rebind(query)
    }

    // ── Statement text ─────────────────────────────────────────────

    /// `SELECT cols FROM table [WHERE …] [LIMIT 1] [FOR UPDATE]`
    pub fn select_sql(
        &self,
        table: &str,
        columns: &[&str],
        lock: RowLock,
        wheres: &str,
        single: bool,
    ) -> String {
        let mut query = format!("SELECT {} FROM {table}", columns.join(", "));
        push_where(&mut query, wheres);
        if single {
            query.push_str(" LIMIT 1");
        }
        if lock == RowLock::Lock && self.dialect.supports_row_lock() {
            query.push_str(" FOR UPDATE");
        }
        self.rebind(&query)
    }

    /// `INSERT INTO table (cols) VALUES (?, …)` plus its bindings.
    pub fn insert_sql(&self, table: &str, attributes: &SqlAttributes) -> (String, Vec<SqlValue>) {
        let columns: Vec<&str> = attributes.keys().map(String::as_str).collect();
        let values: Vec<SqlValue> = attributes.values().cloned().collect();
        let query = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            question_marks(columns.len())
        );
        (self.rebind(&query), values)
    }

    /// `UPDATE table SET col = ?, … [WHERE …]` plus its bindings: the
    /// attribute values first, then the predicate bindings.
    pub fn update_sql(
        &self,
        table: &str,
        updates: &SqlAttributes,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> (String, Vec<SqlValue>) {
        let assignments: Vec<String> = updates.keys().map(|col| format!("{col} = ?")).collect();
        let mut query = format!("UPDATE {table} SET {}", assignments.join(", "));
        push_where(&mut query, wheres);

        let mut bindings: Vec<SqlValue> = updates.values().cloned().collect();
        bindings.extend_from_slice(where_bindings);
        (self.rebind(&query), bindings)
    }

    /// `DELETE FROM table [WHERE …]`
    pub fn delete_sql(&self, table: &str, wheres: &str) -> String {
        let mut query = format!("DELETE FROM {table}");
        push_where(&mut query, wheres);
        self.rebind(&query)
    }

    /// `SELECT COUNT(*) FROM table [WHERE …]`
    pub fn count_sql(&self, table: &str, wheres: &str) -> String {
        let mut query = format!("SELECT COUNT(*) FROM {table}");
        push_where(&mut query, wheres);
        self.rebind(&query)
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Fetch at most one row.
    pub async fn one<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        columns: &[&str],
        lock: RowLock,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<Option<SqlRow>> {
        let query = self.select_sql(table, columns, lock, wheres, true);
        let rows = q.query(&query, where_bindings).await?;
        Ok(rows.into_iter().next())
    }

    /// Fetch every matching row.
    pub async fn all<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        columns: &[&str],
        lock: RowLock,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<Vec<SqlRow>> {
        let query = self.select_sql(table, columns, lock, wheres, false);
        q.query(&query, where_bindings).await
    }

    /// Insert one row. Returns the affected row count.
    pub async fn insert<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        attributes: &SqlAttributes,
    ) -> LedgerResult<u64> {
        let (query, bindings) = self.insert_sql(table, attributes);
        q.execute(&query, &bindings).await
    }

    /// Update matching rows. Returns the affected row count.
    pub async fn update<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        updates: &SqlAttributes,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<u64> {
        let (query, bindings) = self.update_sql(table, updates, wheres, where_bindings);
        q.execute(&query, &bindings).await
    }

    /// Delete matching rows. Returns the affected row count.
    pub async fn delete<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<u64> {
        let query = self.delete_sql(table, wheres);
        q.execute(&query, where_bindings).await
    }

    /// Count matching rows.
    pub async fn count<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<i64> {
        let query = self.count_sql(table, wheres);
        let rows = q.query(&query, where_bindings).await?;
        let row = rows
            .first()
            .ok_or_else(|| LedgerError::Decode("COUNT(*) returned no rows".into()))?;
        Ok(row.int(0)?.unwrap_or(0))
    }

    /// Update the rows matching the predicate, or insert `attributes` if
    /// none matched. Returns `true` when an insert happened.
    ///
    /// The predicate should select on the primary key that `attributes`
    /// also carries. The two statements are not atomic: a concurrent
    /// insert of the same key between them surfaces as
    /// [`LedgerError::DuplicateKey`], which callers can resolve by
    /// re-running the upsert.
    pub async fn upsert<Q: Queryable + ?Sized>(
        &self,
        q: &mut Q,
        table: &str,
        attributes: &SqlAttributes,
        wheres: &str,
        where_bindings: &[SqlValue],
    ) -> LedgerResult<bool> {
        let updated = self
            .update(q, table, attributes, wheres, where_bindings)
            .await?;
        if updated > 0 {
            debug!(%table, rows = updated, "upsert updated existing rows");
            return Ok(false);
        }

        self.insert(q, table, attributes).await?;
        debug!(%table, "upsert inserted new row");
        Ok(true)
    }
}

fn push_where(query: &mut String, wheres: &str) {
    if !wheres.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(wheres);
    }
}
