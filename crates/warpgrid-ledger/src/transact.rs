//! Transaction runner with bounded retry.
//!
//! ```text
//! attempt 1 ── BEGIN ── work ── COMMIT ──► Ok
//!                         │
//!                         └─ Err / panic ── ROLLBACK ──► RetryState
//!                                                           │
//!                      transient, attempts left ◄───────────┤
//!                      (sleep backoff, re-run work)         │
//!                                                           └─► Err
//! ```
//!
//! A retry re-runs the entire unit of work, so work must have no side
//! effects outside the transaction.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::db::{Database, Tx};
use crate::error::{LedgerError, LedgerResult};

/// Boxed future returned by a unit of work.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How many times a transaction may run and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never below one.
    pub max_attempts: u32,
    /// Fixed delay before each re-run.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Run once, never retry.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 500ms apart.
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the unit of work again after the delay.
    RetryAfter(Duration),
    /// Stop and surface the error.
    GiveUp,
}

/// Attempt counter for one transaction.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Mark the start of an attempt and return its 1-based number.
    pub fn start_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide on the next step after `err` ended the current attempt.
    pub fn on_failure(&self, err: &LedgerError) -> RetryDecision {
        if err.is_transient() && self.attempt < self.policy.max_attempts {
            RetryDecision::RetryAfter(self.policy.backoff)
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Run `work` inside a transaction, retrying transient failures.
///
/// On `Ok` the transaction is committed and a commit failure is returned
/// as the result. On `Err` or a panic inside `work`, the transaction is
/// rolled back before anything is returned.
pub async fn transact<T, F>(db: &dyn Database, policy: RetryPolicy, mut work: F) -> LedgerResult<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn Tx) -> BoxFuture<'t, LedgerResult<T>> + Send,
{
    let mut retry = RetryState::new(policy);
    loop {
        let attempt = retry.start_attempt();
        let err = match run_once(db, &mut work).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match retry.on_failure(&err) {
            RetryDecision::RetryAfter(delay) => {
                warn!(attempt, error = %err, ?delay, "transaction failed, retrying");
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => {
                if attempt > 1 {
                    error!(attempt, error = %err, "transaction failed after retries");
                }
                return Err(err);
            }
        }
    }
}

async fn run_once<T, F>(db: &dyn Database, work: &mut F) -> LedgerResult<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn Tx) -> BoxFuture<'t, LedgerResult<T>> + Send,
{
    let mut tx = db.begin().await?;

    let outcome = AssertUnwindSafe(work(&mut *tx)).catch_unwind().await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => Err(LedgerError::Panicked(panic_message(panic))),
    };

    match result {
        Ok(value) => {
            if let Err(e) = tx.commit().await {
                warn!(error = %e, "failed committing transaction");
                return Err(e);
            }
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            } else {
                debug!(error = %e, "transaction rolled back");
            }
            Err(e)
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::db::{Queryable, SqlRow, SqlValue};

    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<&'static str>>,
    }

    impl Journal {
        fn push(&self, e: &'static str) {
            self.events.lock().unwrap().push(e);
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    struct FakeTx {
        journal: Arc<Journal>,
        fail_commit: bool,
    }

    #[async_trait]
    impl Queryable for FakeTx {
        async fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> LedgerResult<u64> {
            self.journal.push("execute");
            Ok(1)
        }

        async fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> LedgerResult<Vec<SqlRow>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Tx for FakeTx {
        async fn commit(self: Box<Self>) -> LedgerResult<()> {
            self.journal.push("commit");
            if self.fail_commit {
                Err(LedgerError::Database("commit refused".into()))
            } else {
                Ok(())
            }
        }

        async fn rollback(self: Box<Self>) -> LedgerResult<()> {
            self.journal.push("rollback");
            Ok(())
        }
    }

    struct FakeDb {
        journal: Arc<Journal>,
        fail_commit: bool,
    }

    impl FakeDb {
        fn new() -> Self {
            Self {
                journal: Arc::new(Journal::default()),
                fail_commit: false,
            }
        }
    }

    #[async_trait]
    impl Database for FakeDb {
        async fn begin(&self) -> LedgerResult<Box<dyn Tx>> {
            self.journal.push("begin");
            Ok(Box::new(FakeTx {
                journal: self.journal.clone(),
                fail_commit: self.fail_commit,
            }))
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn retry_state_walks_every_boundary() {
        let mut state = RetryState::new(quick(3));
        let transient = LedgerError::Transient("deadlock".into());

        assert_eq!(state.start_attempt(), 1);
        assert_eq!(
            state.on_failure(&transient),
            RetryDecision::RetryAfter(Duration::from_millis(1))
        );
        assert_eq!(state.start_attempt(), 2);
        assert!(matches!(state.on_failure(&transient), RetryDecision::RetryAfter(_)));
        assert_eq!(state.start_attempt(), 3);
        assert_eq!(state.on_failure(&transient), RetryDecision::GiveUp);
    }

    #[test]
    fn retry_state_never_retries_logical_errors() {
        let mut state = RetryState::new(quick(5));
        state.start_attempt();
        assert_eq!(
            state.on_failure(&LedgerError::DuplicateKey("g1".into())),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn policy_clamps_to_one_attempt() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }

    #[tokio::test]
    async fn success_commits() {
        let db = FakeDb::new();
        let value = transact(&db, RetryPolicy::none(), |tx| {
            Box::pin(async move {
                tx.execute("INSERT", &[]).await?;
                Ok::<_, LedgerError>(7)
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(db.journal.events(), vec!["begin", "execute", "commit"]);
    }

    #[tokio::test]
    async fn failure_rolls_back_and_propagates() {
        let db = FakeDb::new();
        let err = transact(&db, RetryPolicy::none(), |tx| {
            Box::pin(async move {
                tx.execute("INSERT", &[]).await?;
                Err::<(), _>(LedgerError::NotFound("g1".into()))
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
        assert_eq!(db.journal.events(), vec!["begin", "execute", "rollback"]);
    }

    #[tokio::test]
    async fn panic_in_work_rolls_back() {
        let db = FakeDb::new();
        let explode = true;
        let err = transact(&db, RetryPolicy::none(), move |_tx| {
            Box::pin(async move {
                if explode {
                    panic!("boom");
                }
                Ok::<_, LedgerError>(())
            })
        })
        .await
        .unwrap_err();
        match err {
            LedgerError::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.journal.events(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn commit_failure_is_surfaced() {
        let db = FakeDb {
            fail_commit: true,
            ..FakeDb::new()
        };
        let err = transact(&db, RetryPolicy::none(), |_tx| {
            Box::pin(async move { Ok::<_, LedgerError>(()) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        assert_eq!(db.journal.events(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn transient_failures_rerun_whole_unit() {
        let db = FakeDb::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = transact(&db, quick(3), move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                tx.execute("UPDATE", &[]).await?;
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(LedgerError::Transient("serialization failure".into()));
                }
                Ok::<_, LedgerError>("done")
            })
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            db.journal.events(),
            vec![
                "begin", "execute", "rollback",
                "begin", "execute", "rollback",
                "begin", "execute", "commit",
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_give_up_at_ceiling() {
        let db = FakeDb::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = transact(&db, quick(2), move |_tx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LedgerError::Transient("conn reset".into()))
            })
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
