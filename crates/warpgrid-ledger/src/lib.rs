//! warpgrid-ledger — durable bookkeeping for asynchronously dispatched calls.
//!
//! Callers hand a request to a worker and get a GUID back. The worker
//! records the outcome in a SQL table keyed by that GUID, and the caller
//! polls the ledger until the call reaches a terminal status.
//!
//! # Architecture
//!
//! ```text
//! AsyncLedger (create / complete / fetch / delete)
//!   ├── transact()        BEGIN … COMMIT, rollback on error or panic,
//!   │                     bounded retry of transient failures
//!   ├── SqlHelper         SELECT / INSERT / UPDATE / DELETE / COUNT text
//!   │     └── Dialect     `?` markers → `$n` for postgres, type tokens
//!   └── dyn Database      begin() → Box<dyn Tx>
//!         └── SqlxDatabase (sqlx AnyPool: postgres, mysql, sqlite)
//! ```

pub mod db;
pub mod dialect;
pub mod error;
pub mod helper;
pub mod ledger;
pub mod sqlx_db;
pub mod transact;

pub use db::{Database, Queryable, SqlAttributes, SqlRow, SqlValue, Tx};
pub use dialect::{Dialect, question_marks};
pub use error::{LedgerError, LedgerResult};
pub use helper::{RowLock, SqlHelper};
pub use ledger::{ASYNC_TABLE, AsyncCallRecord, AsyncLedger, CallStatus, ResponseCapture};
pub use sqlx_db::SqlxDatabase;
pub use transact::{BoxFuture, RetryDecision, RetryPolicy, RetryState, transact};
