//! Pod directory — the source of the worker set for a scrape target.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ScrapeResult;

/// Label equality selector. Empty matches everything.
pub type Selector = BTreeMap<String, String>;

/// Lifecycle phase of a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Pending,
    #[default]
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A worker as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    /// Host or `host:port` the metrics endpoint is reachable on.
    pub address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: WorkerPhase,
    /// Marked for deletion but possibly still running.
    #[serde(default)]
    pub terminating: bool,
}

impl Worker {
    pub fn running(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            labels: BTreeMap::new(),
            phase: WorkerPhase::Running,
            terminating: false,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Only running workers that are not shutting down report useful load.
    pub fn is_sampleable(&self) -> bool {
        self.phase == WorkerPhase::Running && !self.terminating
    }

    pub fn matches(&self, selector: &Selector) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

/// Count of `(pending, terminating)` workers.
///
/// A worker counts as terminating only while it is still running.
pub fn pending_terminating_count(workers: &[Worker]) -> (usize, usize) {
    let mut pending = 0;
    let mut terminating = 0;
    for worker in workers {
        if worker.terminating && worker.phase == WorkerPhase::Running {
            terminating += 1;
            continue;
        }
        if worker.phase == WorkerPhase::Pending {
            pending += 1;
        }
    }
    (pending, terminating)
}

/// Lists the workers behind a scrape target.
#[async_trait]
pub trait PodDirectory: Send + Sync {
    /// Workers whose labels match `selector`.
    ///
    /// Fails with [`ScrapeError::DirectoryUnavailable`](crate::ScrapeError::DirectoryUnavailable).
    async fn list_workers(&self, selector: &Selector) -> ScrapeResult<Vec<Worker>>;
}

/// In-memory directory fed from configuration or by the embedding
/// process. Cheap to clone; clones share the worker list.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    workers: Arc<RwLock<Vec<Worker>>>,
}

impl StaticDirectory {
    pub fn new(workers: Vec<Worker>) -> Self {
        Self {
            workers: Arc::new(RwLock::new(workers)),
        }
    }

    /// Add or replace a worker by name.
    pub async fn upsert(&self, worker: Worker) {
        let mut guard = self.workers.write().await;
        match guard.iter_mut().find(|w| w.name == worker.name) {
            Some(existing) => *existing = worker,
            None => guard.push(worker),
        }
    }

    pub async fn remove(&self, name: &str) -> bool {
        let mut guard = self.workers.write().await;
        let before = guard.len();
        guard.retain(|w| w.name != name);
        guard.len() != before
    }
}

#[async_trait]
impl PodDirectory for StaticDirectory {
    async fn list_workers(&self, selector: &Selector) -> ScrapeResult<Vec<Worker>> {
        let guard = self.workers.read().await;
        Ok(guard.iter().filter(|w| w.matches(selector)).cloned().collect())
    }
}
