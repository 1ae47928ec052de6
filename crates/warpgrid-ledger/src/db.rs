//! Storage capability traits.
//!
//! The ledger never talks to a driver directly. It needs three things:
//! run a parameterized statement, run a parameterized query, and open a
//! transaction that can be committed or rolled back. Anything that
//! implements [`Database`] can back a ledger.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{LedgerError, LedgerResult};

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Bytes(v.to_vec())
    }
}

/// Column → value mapping for inserts and updates.
///
/// Ordered so the column list and the value list of a generated statement
/// always line up.
pub type SqlAttributes = BTreeMap<String, SqlValue>;

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn column(&self, idx: usize) -> LedgerResult<&SqlValue> {
        self.0.get(idx).ok_or_else(|| {
            LedgerError::Decode(format!("column {idx} out of range ({} columns)", self.0.len()))
        })
    }

    /// Text column. NULL is an error.
    pub fn text(&self, idx: usize) -> LedgerResult<String> {
        match self.column(idx)? {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(LedgerError::Decode(format!("column {idx}: expected text, got {other:?}"))),
        }
    }

    /// Integer column. NULL reads as `None`.
    pub fn int(&self, idx: usize) -> LedgerResult<Option<i64>> {
        match self.column(idx)? {
            SqlValue::Int(v) => Ok(Some(*v)),
            SqlValue::Null => Ok(None),
            other => Err(LedgerError::Decode(format!("column {idx}: expected integer, got {other:?}"))),
        }
    }

    /// Binary column. NULL reads as empty; text is taken as its UTF-8 bytes.
    pub fn bytes(&self, idx: usize) -> LedgerResult<Vec<u8>> {
        match self.column(idx)? {
            SqlValue::Bytes(b) => Ok(b.clone()),
            SqlValue::Text(s) => Ok(s.clone().into_bytes()),
            SqlValue::Null => Ok(Vec::new()),
            other => Err(LedgerError::Decode(format!("column {idx}: expected bytes, got {other:?}"))),
        }
    }
}

/// Something parameterized statements can be run against.
#[async_trait]
pub trait Queryable: Send {
    /// Run a statement and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> LedgerResult<u64>;

    /// Run a query and return every row.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> LedgerResult<Vec<SqlRow>>;
}

/// An open transaction.
///
/// Dropping a transaction without calling [`Tx::commit`] must roll it back.
#[async_trait]
pub trait Tx: Queryable {
    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}

/// A handle to the backing store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> LedgerResult<Box<dyn Tx>>;
}
