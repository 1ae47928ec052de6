//! Round and loop behavior against scripted clients and directories.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use warpgrid_scraper::{
    FleetScraper, PodDirectory, ResultCache, RoundState, Sample, SampleClient, ScrapeError,
    ScrapeLoop, ScrapeResult, ScraperConfig, Selector, StaticDirectory, Worker, WorkerPhase,
};

/// Answers with a reading named after the worker address unless scripted
/// otherwise.
#[derive(Default)]
struct ScriptedClient {
    /// address → failures left before it starts answering.
    failures_left: Mutex<HashMap<String, usize>>,
    /// address → pod identity to report instead of the default.
    identity: HashMap<String, String>,
    /// address → service keys a bulk call reports.
    bulk_keys: HashMap<String, Vec<String>>,
    /// Removed from this directory on first contact, then fails.
    vanish: Option<(StaticDirectory, String, String)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn failing(mut self, address: &str, times: usize) -> Self {
        self.failures_left
            .get_mut()
            .unwrap()
            .insert(address.to_string(), times);
        self
    }

    fn pod_for(&self, address: &str) -> String {
        self.identity
            .get(address)
            .cloned()
            .unwrap_or_else(|| format!("pod-{address}"))
    }

    async fn answer(&self, address: &str) -> ScrapeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((dir, name, vanishing)) = &self.vanish {
            if vanishing == address {
                dir.remove(name).await;
                return Err(ScrapeError::Unreachable {
                    address: address.to_string(),
                    reason: "connection refused".into(),
                });
            }
        }
        let mut failures = self.failures_left.lock().unwrap();
        if let Some(left) = failures.get_mut(address) {
            if *left > 0 {
                *left -= 1;
                return Err(ScrapeError::Unreachable {
                    address: address.to_string(),
                    reason: "connection reset".into(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SampleClient for ScriptedClient {
    async fn sample(&self, address: &str) -> ScrapeResult<Sample> {
        self.answer(address).await?;
        Ok(Sample::new(self.pod_for(address), "svc").with_concurrency(1.0))
    }

    async fn bulk_sample(&self, address: &str) -> ScrapeResult<Vec<Sample>> {
        self.answer(address).await?;
        let keys = self.bulk_keys.get(address).cloned().unwrap_or_default();
        Ok(keys
            .into_iter()
            .map(|key| Sample::new(self.pod_for(address), key))
            .collect())
    }
}

struct DownDirectory;

#[async_trait]
impl PodDirectory for DownDirectory {
    async fn list_workers(&self, _selector: &Selector) -> ScrapeResult<Vec<Worker>> {
        Err(ScrapeError::DirectoryUnavailable("api server unreachable".into()))
    }
}

fn fleet(n: usize) -> StaticDirectory {
    StaticDirectory::new(
        (1..=n)
            .map(|i| Worker::running(format!("p{i}"), format!("10.0.0.{i}")))
            .collect(),
    )
}

fn scraper(directory: impl PodDirectory + 'static, client: ScriptedClient) -> FleetScraper {
    FleetScraper::new(Arc::new(directory), Arc::new(client), ScraperConfig::new("svc"))
}

#[tokio::test]
async fn transient_failures_are_retried_to_full_fleet() {
    let client = ScriptedClient::default()
        .failing("10.0.0.2", 1)
        .failing("10.0.0.4", 1);
    let report = scraper(fleet(5), client).scrape_round().await.unwrap();

    assert_eq!(report.state(), RoundState::Done);
    assert_eq!(
        report.transitions,
        vec![
            RoundState::Resolving,
            RoundState::Sampling,
            RoundState::Aggregating,
            RoundState::Done
        ]
    );
    assert_eq!(report.attempts, 2);
    assert_eq!(report.failures, 2);
    assert_eq!(report.successes, 5);

    let samples = &report.snapshots["svc"];
    assert_eq!(samples.len(), 5);
    let mut pods: Vec<&str> = samples.iter().map(|s| s.pod_name.as_str()).collect();
    pods.dedup();
    assert_eq!(pods.len(), 5);
}

#[tokio::test]
async fn duplicate_identity_is_discarded_and_retried_to_ceiling() {
    let client = ScriptedClient {
        identity: HashMap::from([("10.0.0.3".to_string(), "pod-10.0.0.1".to_string())]),
        ..Default::default()
    };
    let scraper = FleetScraper::new(
        Arc::new(fleet(3)),
        Arc::new(client),
        ScraperConfig::new("svc").with_max_retries(3),
    );
    let report = scraper.scrape_round().await.unwrap();

    assert_eq!(report.state(), RoundState::Done);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.successes, 2);
    assert_eq!(report.sample_count(), 2);
    // p1 and p3 race in the first attempt, so one of them lands three
    // duplicates and the other none; the total is fixed.
    assert_eq!(report.duplicates, 3);
}

#[tokio::test]
async fn every_sample_failing_is_partial_failure() {
    let client = ScriptedClient::default()
        .failing("10.0.0.1", usize::MAX)
        .failing("10.0.0.2", usize::MAX);
    let report = scraper(fleet(2), client).scrape_round().await.unwrap();

    assert_eq!(report.state(), RoundState::PartialFailure);
    assert_eq!(report.attempts, 10);
    assert_eq!(report.failures, 20);
    assert!(report.snapshots.is_empty());
    assert!(matches!(
        report.failure,
        Some(ScrapeError::AllSamplesFailed { workers: 2 })
    ));
}

#[tokio::test]
async fn directory_outage_aborts_round() {
    let err = scraper(DownDirectory, ScriptedClient::default())
        .scrape_round()
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::DirectoryUnavailable(_)));
}

#[tokio::test]
async fn empty_fleet_publishes_empty_snapshot() {
    let report = scraper(fleet(0), ScriptedClient::default())
        .scrape_round()
        .await
        .unwrap();
    assert_eq!(report.state(), RoundState::Done);
    assert_eq!(report.attempts, 0);
    assert_eq!(report.snapshots.get("svc"), Some(&Vec::new()));
}

#[tokio::test]
async fn only_running_workers_are_sampled() {
    let mut pending = Worker::running("p2", "10.0.0.2");
    pending.phase = WorkerPhase::Pending;
    let mut terminating = Worker::running("p3", "10.0.0.3");
    terminating.terminating = true;
    let directory = StaticDirectory::new(vec![
        Worker::running("p1", "10.0.0.1"),
        pending,
        terminating,
    ]);

    let report = scraper(directory, ScriptedClient::default())
        .scrape_round()
        .await
        .unwrap();
    assert_eq!(report.workers, 1);
    assert_eq!(report.pending, 1);
    assert_eq!(report.terminating, 1);
    assert_eq!(report.sample_count(), 1);
}

#[tokio::test]
async fn vanished_worker_is_dropped_after_re_resolve() {
    let directory = fleet(3);
    let client = ScriptedClient {
        vanish: Some((directory.clone(), "p3".into(), "10.0.0.3".into())),
        ..Default::default()
    };
    let report = scraper(directory, client).scrape_round().await.unwrap();

    assert_eq!(report.state(), RoundState::Done);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.workers, 3);
    assert_eq!(report.successes, 2);
    assert_eq!(report.sample_count(), 2);
}

#[tokio::test]
async fn bulk_round_splits_by_service_key() {
    let client = ScriptedClient {
        bulk_keys: HashMap::from([
            ("10.0.0.1".to_string(), vec!["svc-a".to_string(), "svc-b".to_string()]),
            ("10.0.0.2".to_string(), vec!["svc-a".to_string()]),
        ]),
        ..Default::default()
    };
    let scraper = FleetScraper::new(
        Arc::new(fleet(2)),
        Arc::new(client),
        ScraperConfig::new("svc").with_bulk(true),
    );
    let report = scraper.scrape_round().await.unwrap();

    assert_eq!(report.state(), RoundState::Done);
    assert_eq!(report.snapshots["svc-a"].len(), 2);
    assert_eq!(report.snapshots["svc-b"].len(), 1);
    assert!(!report.snapshots.contains_key("svc"));
}

#[tokio::test]
async fn failed_rounds_leave_cache_untouched() {
    let cache = ResultCache::default();
    cache.publish("svc", vec![Sample::new("old", "svc")]).await;

    let down = ScrapeLoop::new(
        Arc::new(scraper(DownDirectory, ScriptedClient::default())),
        cache.clone(),
        Duration::from_secs(1),
    );
    assert_eq!(down.tick().await, RoundState::Resolving);
    assert_eq!(down.stats().directory_failures, 1);

    let failing = ScrapeLoop::new(
        Arc::new(scraper(
            fleet(1),
            ScriptedClient::default().failing("10.0.0.1", usize::MAX),
        )),
        cache.clone(),
        Duration::from_secs(1),
    );
    assert_eq!(failing.tick().await, RoundState::PartialFailure);
    assert_eq!(failing.stats().partial_failures, 1);

    let kept = cache.consume("svc").await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].pod_name, "old");
}

#[tokio::test]
async fn shutdown_mid_round_publishes_nothing() {
    let client = ScriptedClient {
        delay: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let cache = ResultCache::default();
    let scrape_loop = ScrapeLoop::new(
        Arc::new(scraper(fleet(2), client)),
        cache.clone(),
        Duration::from_millis(10),
    );

    let (tx, rx) = watch::channel(false);
    let runner = scrape_loop.clone();
    let handle = tokio::spawn(async move { runner.run(rx).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop did not stop promptly")
        .unwrap();

    assert_eq!(scrape_loop.stats().rounds, 0);
    assert!(cache.is_empty().await);
}
