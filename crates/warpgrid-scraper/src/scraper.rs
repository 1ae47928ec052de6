//! Fleet scraper — one sampling round over the workers of a target.
//!
//! ```text
//! Resolving ──► Sampling ──► Aggregating ──► Done
//!    │             │  ▲                  └──► PartialFailure
//!    │             └──┘ re-resolve + re-sample outstanding workers,
//!    │                  at most `max_retries` attempts
//!    └─► Err(DirectoryUnavailable)   round aborted, nothing published
//! ```
//!
//! Workers are sampled concurrently, one task per outstanding worker. A
//! reading whose `(pod_name, key)` identity was already recorded this
//! round is discarded as a duplicate and its worker stays outstanding.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::SampleClient;
use crate::directory::{PodDirectory, Selector, Worker, pending_terminating_count};
use crate::error::{ScrapeError, ScrapeResult};
use crate::sample::{FleetSnapshot, Sample};

/// Default ceiling on sampling attempts per round.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Phase of a scraping round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Resolving,
    Sampling,
    Aggregating,
    Done,
    PartialFailure,
}

/// What to scrape and how hard to try.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Logical key of the target. Readings without a key of their own, and
    /// the empty snapshot of a worker-less round, are filed under it.
    pub target: String,
    pub selector: Selector,
    /// Ask each worker for one reading per hosted service.
    pub bulk: bool,
    /// Sampling attempts per round, at least one.
    pub max_retries: u32,
}

impl ScraperConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            selector: Selector::new(),
            bulk: false,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_bulk(mut self, bulk: bool) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

/// Outcome and bookkeeping of one round.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Every state the round entered, in order.
    pub transitions: Vec<RoundState>,
    /// Sampleable workers at the first resolve.
    pub workers: usize,
    pub pending: usize,
    pub terminating: usize,
    /// Sampling attempts used.
    pub attempts: u32,
    /// Workers that delivered at least one distinct reading.
    pub successes: usize,
    /// Failed sample calls, across all attempts.
    pub failures: usize,
    /// Readings discarded for a repeated identity.
    pub duplicates: usize,
    /// Aggregated readings by service key. Empty unless the round is `Done`.
    pub snapshots: BTreeMap<String, FleetSnapshot>,
    /// Why a `PartialFailure` round produced nothing.
    pub failure: Option<ScrapeError>,
}

impl RoundReport {
    fn enter(&mut self, state: RoundState) {
        self.transitions.push(state);
    }

    /// Final state, `Resolving` for a round that never started.
    pub fn state(&self) -> RoundState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(RoundState::Resolving)
    }

    /// Only `Done` rounds publish.
    pub fn is_publishable(&self) -> bool {
        self.state() == RoundState::Done
    }

    /// Total readings across all keys.
    pub fn sample_count(&self) -> usize {
        self.snapshots.values().map(Vec::len).sum()
    }
}

/// Runs scraping rounds against a directory through a sample client.
pub struct FleetScraper {
    directory: Arc<dyn PodDirectory>,
    client: Arc<dyn SampleClient>,
    config: ScraperConfig,
}

impl FleetScraper {
    pub fn new(
        directory: Arc<dyn PodDirectory>,
        client: Arc<dyn SampleClient>,
        config: ScraperConfig,
    ) -> Self {
        Self {
            directory,
            client,
            config,
        }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    /// Run one round.
    ///
    /// Fails only when the directory cannot be listed at the start. A
    /// round whose every sample failed returns a `PartialFailure` report
    /// with no snapshots.
    pub async fn scrape_round(&self) -> ScrapeResult<RoundReport> {
        let target = self.config.target.as_str();
        let mut report = RoundReport::default();

        report.enter(RoundState::Resolving);
        let listed = self.resolve().await?;
        let (pending, terminating) = pending_terminating_count(&listed);
        let mut workers = sampleable(listed);
        report.workers = workers.len();
        report.pending = pending;
        report.terminating = terminating;

        if workers.is_empty() {
            report.enter(RoundState::Aggregating);
            report.snapshots.insert(target.to_string(), Vec::new());
            report.enter(RoundState::Done);
            debug!(service = %target, pending, terminating, "no sampleable workers, publishing empty snapshot");
            return Ok(report);
        }

        report.enter(RoundState::Sampling);
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut collected: Vec<Sample> = Vec::new();

        while report.attempts < self.config.max_retries {
            let outstanding: Vec<Worker> = workers
                .iter()
                .filter(|w| !satisfied.contains(&w.name))
                .cloned()
                .collect();
            if outstanding.is_empty() {
                break;
            }
            report.attempts += 1;

            for (worker, result) in self.sample_all(outstanding).await {
                let samples = match result {
                    Ok(samples) => samples,
                    Err(e) => {
                        report.failures += 1;
                        debug!(service = %target, worker = %worker, attempt = report.attempts, error = %e, "sample failed");
                        continue;
                    }
                };

                // An empty bulk answer is a worker hosting nothing.
                let mut fresh = samples.is_empty();
                for mut sample in samples {
                    if sample.key.is_empty() {
                        sample.key = target.to_string();
                    }
                    if seen.insert((sample.pod_name.clone(), sample.key.clone())) {
                        collected.push(sample);
                        fresh = true;
                    } else {
                        report.duplicates += 1;
                        debug!(service = %target, worker = %worker, pod = %sample.pod_name, "duplicate reading discarded");
                    }
                }
                if fresh {
                    satisfied.insert(worker);
                }
            }

            let complete = workers.iter().all(|w| satisfied.contains(&w.name));
            if complete || report.attempts >= self.config.max_retries {
                break;
            }

            // Workers may have vanished or appeared since the last attempt.
            match self.resolve().await {
                Ok(listed) => workers = sampleable(listed),
                Err(e) => {
                    warn!(service = %target, error = %e, "re-resolve failed, keeping previous worker set");
                }
            }
        }

        report.enter(RoundState::Aggregating);
        report.successes = satisfied.len();

        if report.successes == 0 {
            report.failure = Some(if report.failures == 0 && report.duplicates > 0 {
                ScrapeError::NoDistinctSample {
                    attempts: report.attempts,
                }
            } else {
                ScrapeError::AllSamplesFailed {
                    workers: report.workers,
                }
            });
            report.enter(RoundState::PartialFailure);
            warn!(
                service = %target,
                workers = report.workers,
                attempts = report.attempts,
                failures = report.failures,
                duplicates = report.duplicates,
                "scrape round produced no samples"
            );
            return Ok(report);
        }

        report.snapshots = aggregate(collected);
        if report.snapshots.is_empty() {
            report.snapshots.insert(target.to_string(), Vec::new());
        }
        report.enter(RoundState::Done);

        if report.successes < report.workers {
            info!(
                service = %target,
                sampled = report.successes,
                workers = report.workers,
                attempts = report.attempts,
                "scrape round finished with missing workers"
            );
        } else {
            debug!(
                service = %target,
                samples = report.sample_count(),
                attempts = report.attempts,
                "scrape round done"
            );
        }
        Ok(report)
    }

    async fn resolve(&self) -> ScrapeResult<Vec<Worker>> {
        self.directory
            .list_workers(&self.config.selector)
            .await
            .map_err(|e| match e {
                ScrapeError::DirectoryUnavailable(_) => e,
                other => ScrapeError::DirectoryUnavailable(other.to_string()),
            })
    }

    /// Sample every worker concurrently and wait for all of them.
    ///
    /// Returns `(worker name, result)` pairs in completion order.
    async fn sample_all(&self, workers: Vec<Worker>) -> Vec<(String, ScrapeResult<Vec<Sample>>)> {
        let mut tasks = JoinSet::new();
        for worker in workers {
            let client = self.client.clone();
            let bulk = self.config.bulk;
            tasks.spawn(async move {
                let result = if bulk {
                    client.bulk_sample(&worker.address).await
                } else {
                    client.sample(&worker.address).await.map(|s| vec![s])
                };
                (worker.name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => warn!(error = %e, "sample task did not complete"),
            }
        }
        results
    }
}

fn sampleable(workers: Vec<Worker>) -> Vec<Worker> {
    workers.into_iter().filter(Worker::is_sampleable).collect()
}

/// Group readings by service key, ordered by pod within each key.
fn aggregate(samples: Vec<Sample>) -> BTreeMap<String, FleetSnapshot> {
    let mut snapshots: BTreeMap<String, FleetSnapshot> = BTreeMap::new();
    for sample in samples {
        snapshots.entry(sample.key.clone()).or_default().push(sample);
    }
    for snapshot in snapshots.values_mut() {
        snapshot.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    }
    snapshots
}
