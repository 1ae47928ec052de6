//! AsyncLedger — durable rendezvous store for asynchronously dispatched
//! calls.
//!
//! A dispatcher creates an `InProgress` record, the handler that finishes
//! the call completes it exactly once with a terminal status and the
//! captured response, and the caller polls with `fetch` and finally
//! acknowledges with `delete`. The ledger is not a history log.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{Database, SqlAttributes, SqlRow, SqlValue};
use crate::dialect::Dialect;
use crate::error::{LedgerError, LedgerResult};
use crate::helper::{RowLock, SqlHelper};
use crate::transact::{RetryPolicy, transact};

pub const ASYNC_TABLE: &str = "async_table";

const RECORD_COLUMNS: [&str; 5] = ["guid", "pod", "status", "body", "status_code"];

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS async_table (
    guid VARCHAR(255) PRIMARY KEY,
    pod VARCHAR(255) NOT NULL,
    status INT NOT NULL,
    body MEDIUMBLOB,
    status_code INT
)";

/// Lifecycle of an async call. Moves only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Ready,
    Failed,
}

impl CallStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            CallStatus::InProgress => 0,
            CallStatus::Ready => 1,
            CallStatus::Failed => 2,
        }
    }

    pub fn from_i64(v: i64) -> LedgerResult<Self> {
        match v {
            0 => Ok(CallStatus::InProgress),
            1 => Ok(CallStatus::Ready),
            2 => Ok(CallStatus::Failed),
            other => Err(LedgerError::Decode(format!("unknown call status {other}"))),
        }
    }

    /// `Ready` and `Failed` are terminal; payload and code are frozen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::InProgress)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::InProgress => "in_progress",
            CallStatus::Ready => "ready",
            CallStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One ledger row, as an owned copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncCallRecord {
    /// Request identifier (primary key).
    pub guid: String,
    /// Identity of the worker that accepted the call.
    pub pod: String,
    pub status: CallStatus,
    pub body: Vec<u8>,
    pub status_code: i32,
}

impl AsyncCallRecord {
    fn from_row(row: &SqlRow) -> LedgerResult<Self> {
        let status = CallStatus::from_i64(
            row.int(2)?
                .ok_or_else(|| LedgerError::Decode("status is NULL".into()))?,
        )?;
        let status_code = row.int(4)?.unwrap_or(0);
        Ok(Self {
            guid: row.text(0)?,
            pod: row.text(1)?,
            status,
            body: row.bytes(3)?,
            status_code: i32::try_from(status_code)
                .map_err(|_| LedgerError::Decode(format!("status code {status_code} out of range")))?,
        })
    }
}

/// Buffers a handler's response so it can be written to the ledger.
#[derive(Debug, Clone, Default)]
pub struct ResponseCapture {
    body: Vec<u8>,
    status_code: Option<u16>,
}

impl ResponseCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append body bytes. Returns the number written.
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        self.body.extend_from_slice(chunk);
        chunk.len()
    }

    /// Record the status code. The first call wins.
    pub fn write_header(&mut self, code: u16) {
        if self.status_code.is_none() {
            self.status_code = Some(code);
        }
    }

    /// The recorded status code, 200 if the handler never set one.
    pub fn status_code(&self) -> u16 {
        self.status_code.unwrap_or(200)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Server errors mark the call `Failed`, everything else `Ready`.
    pub fn outcome(&self) -> CallStatus {
        if self.status_code() >= 500 {
            CallStatus::Failed
        } else {
            CallStatus::Ready
        }
    }
}

/// Transactional store of async-call records.
#[derive(Clone)]
pub struct AsyncLedger {
    db: Arc<dyn Database>,
    helper: SqlHelper,
    retry: RetryPolicy,
}

impl AsyncLedger {
    /// Create a ledger over `db` using the default retry policy.
    pub fn new(db: Arc<dyn Database>, dialect: Dialect) -> Self {
        Self {
            db,
            helper: SqlHelper::new(dialect),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.helper.dialect()
    }

    /// Create the ledger table if it does not exist yet.
    pub async fn create_table(&self) -> LedgerResult<()> {
        let ddl = self.helper.rebind(CREATE_TABLE);
        transact(self.db.as_ref(), self.retry, move |tx| {
            let ddl = ddl.clone();
            Box::pin(async move {
                tx.execute(&ddl, &[]).await?;
                Ok::<_, LedgerError>(())
            })
        })
        .await?;
        info!(table = ASYNC_TABLE, dialect = %self.dialect(), "async ledger table ready");
        Ok(())
    }

    /// Register a newly dispatched call as `InProgress`.
    ///
    /// Fails with [`LedgerError::DuplicateKey`] if `guid` is already known.
    pub async fn create(&self, guid: &str, pod: &str) -> LedgerResult<()> {
        let helper = self.helper;
        let mut attrs = SqlAttributes::new();
        attrs.insert("guid".into(), guid.into());
        attrs.insert("pod".into(), pod.into());
        attrs.insert("status".into(), CallStatus::InProgress.as_i64().into());
        attrs.insert("status_code".into(), 0i64.into());

        transact(self.db.as_ref(), self.retry, move |tx| {
            let attrs = attrs.clone();
            Box::pin(async move {
                helper.insert(tx, ASYNC_TABLE, &attrs).await?;
                Ok::<_, LedgerError>(())
            })
        })
        .await
        .map_err(|e| match e {
            LedgerError::DuplicateKey(_) => LedgerError::DuplicateKey(guid.to_string()),
            other => other,
        })?;

        debug!(%guid, %pod, "async call registered");
        Ok(())
    }

    /// Record the terminal outcome of a call.
    ///
    /// The record is locked, checked and updated in one transaction.
    /// Fails with [`LedgerError::NotFound`] for an unknown `guid`,
    /// [`LedgerError::AlreadyTerminal`] if it was completed before, and
    /// [`LedgerError::InvalidTransition`] if `status` is not terminal.
    pub async fn complete(
        &self,
        guid: &str,
        status: CallStatus,
        body: &[u8],
        status_code: i32,
    ) -> LedgerResult<()> {
        if !status.is_terminal() {
            return Err(LedgerError::InvalidTransition(format!(
                "{guid}: cannot complete with status {status}"
            )));
        }

        let helper = self.helper;
        let key = guid.to_string();
        let mut updates = SqlAttributes::new();
        updates.insert("status".into(), status.as_i64().into());
        updates.insert("body".into(), body.into());
        updates.insert("status_code".into(), SqlValue::Int(status_code as i64));

        transact(self.db.as_ref(), self.retry, move |tx| {
            let key = key.clone();
            let updates = updates.clone();
            Box::pin(async move {
                let bindings = [SqlValue::Text(key.clone())];
                let current = helper
                    .one(&mut *tx, ASYNC_TABLE, &["status"], RowLock::Lock, "guid = ?", &bindings)
                    .await?
                    .ok_or_else(|| LedgerError::NotFound(key.clone()))?;
                let current = CallStatus::from_i64(current.int(0)?.unwrap_or_default())?;
                if current.is_terminal() {
                    return Err(LedgerError::AlreadyTerminal(format!("{key} is {current}")));
                }

                helper
                    .update(&mut *tx, ASYNC_TABLE, &updates, "guid = ?", &bindings)
                    .await?;
                Ok::<_, LedgerError>(())
            })
        })
        .await?;

        debug!(%guid, %status, status_code, "async call completed");
        Ok(())
    }

    /// Complete a call from a captured handler response.
    pub async fn complete_with(&self, guid: &str, capture: &ResponseCapture) -> LedgerResult<()> {
        self.complete(
            guid,
            capture.outcome(),
            capture.body(),
            capture.status_code() as i32,
        )
        .await
    }

    /// Read a record, holding a row lock for the duration of the read.
    pub async fn fetch(&self, guid: &str) -> LedgerResult<AsyncCallRecord> {
        let helper = self.helper;
        let key = guid.to_string();

        transact(self.db.as_ref(), self.retry, move |tx| {
            let key = key.clone();
            Box::pin(async move {
                let rows = helper
                    .all(
                        tx,
                        ASYNC_TABLE,
                        &RECORD_COLUMNS,
                        RowLock::Lock,
                        "guid = ?",
                        &[SqlValue::Text(key.clone())],
                    )
                    .await?;
                match rows.as_slice() {
                    [] => Err(LedgerError::NotFound(key)),
                    [row] => AsyncCallRecord::from_row(row),
                    many => Err(LedgerError::Inconsistent(format!(
                        "{} records share guid {key}",
                        many.len()
                    ))),
                }
            })
        })
        .await
    }

    /// Remove a record once the caller has consumed it.
    ///
    /// Deleting an absent record is not an error. Returns whether a row
    /// was removed.
    pub async fn delete(&self, guid: &str) -> LedgerResult<bool> {
        let helper = self.helper;
        let key = guid.to_string();

        let removed = transact(self.db.as_ref(), self.retry, move |tx| {
            let key = key.clone();
            Box::pin(async move {
                helper
                    .delete(tx, ASYNC_TABLE, "guid = ?", &[SqlValue::Text(key)])
                    .await
            })
        })
        .await?;

        debug!(%guid, existed = removed > 0, "async call deleted");
        Ok(removed > 0)
    }

    /// Number of records, optionally only those owned by one worker.
    pub async fn count(&self, pod: Option<&str>) -> LedgerResult<i64> {
        let helper = self.helper;
        let pod = pod.map(str::to_string);

        transact(self.db.as_ref(), self.retry, move |tx| {
            let pod = pod.clone();
            Box::pin(async move {
                match pod {
                    Some(pod) => {
                        helper
                            .count(tx, ASYNC_TABLE, "pod = ?", &[SqlValue::Text(pod)])
                            .await
                    }
                    None => helper.count(tx, ASYNC_TABLE, "", &[]).await,
                }
            })
        })
        .await
    }
}
