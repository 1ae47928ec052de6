//! Error types for the async-call ledger.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while talking to the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("inconsistent ledger: {0}")]
    Inconsistent(String),

    #[error("record already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unit of work panicked: {0}")]
    Panicked(String),
}

impl LedgerError {
    /// Whether a transaction that failed with this error may be re-run.
    ///
    /// Only connection-level failures, timeouts, deadlocks and
    /// serialization conflicts qualify. Logical errors never do.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

/// SQLSTATE / vendor codes that signal a retryable conflict.
///
/// `40001` serialization failure, `40P01` postgres deadlock, `1213` and
/// `1205` mysql deadlock and lock wait timeout, `5` and `6` sqlite
/// busy and locked.
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "1213", "1205", "5", "6"];

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                LedgerError::DuplicateKey(db.message().to_string())
            }
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| TRANSIENT_CODES.contains(&&*code)) =>
            {
                LedgerError::Transient(db.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => LedgerError::Transient(e.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. } => LedgerError::Decode(e.to_string()),
            sqlx::Error::Configuration(_) => LedgerError::Configuration(e.to_string()),
            _ => LedgerError::Database(e.to_string()),
        }
    }
}
