//! Scrape loop — drives rounds on a fixed interval and publishes into the
//! result cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::scraper::{FleetScraper, RoundState};

/// Counters shared between the loop and its observers.
#[derive(Debug, Default)]
struct LoopCounters {
    rounds: AtomicU64,
    published: AtomicU64,
    partial_failures: AtomicU64,
    directory_failures: AtomicU64,
}

/// Point-in-time copy of the loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Rounds that ran to completion or failure.
    pub rounds: u64,
    /// Rounds whose snapshots reached the cache.
    pub published: u64,
    pub partial_failures: u64,
    pub directory_failures: u64,
}

/// Periodic driver for one scrape target.
#[derive(Clone)]
pub struct ScrapeLoop {
    scraper: Arc<FleetScraper>,
    cache: ResultCache,
    interval: Duration,
    counters: Arc<LoopCounters>,
}

impl ScrapeLoop {
    pub fn new(scraper: Arc<FleetScraper>, cache: ResultCache, interval: Duration) -> Self {
        Self {
            scraper,
            cache,
            interval,
            counters: Arc::new(LoopCounters::default()),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn stats(&self) -> LoopStats {
        LoopStats {
            rounds: self.counters.rounds.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            partial_failures: self.counters.partial_failures.load(Ordering::Relaxed),
            directory_failures: self.counters.directory_failures.load(Ordering::Relaxed),
        }
    }

    /// Run one round and publish its snapshots if it finished `Done`.
    pub async fn tick(&self) -> RoundState {
        let target = &self.scraper.config().target;
        let outcome = self.scraper.scrape_round().await;
        self.counters.rounds.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(report) if report.is_publishable() => {
                self.cache.publish_all(report.snapshots).await;
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                RoundState::Done
            }
            Ok(report) => {
                self.counters.partial_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(e) = &report.failure {
                    warn!(service = %target, error = %e, "scrape round failed, cache left untouched");
                }
                report.state()
            }
            Err(e) => {
                self.counters.directory_failures.fetch_add(1, Ordering::Relaxed);
                warn!(service = %target, error = %e, "scrape round aborted");
                RoundState::Resolving
            }
        }
    }

    /// Run rounds until the shutdown signal.
    ///
    /// A round still in flight when shutdown arrives is dropped, along
    /// with its sample tasks, and publishes nothing. A round that reached
    /// the cache lands whole, since `publish_all` holds one lock.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let target = self.scraper.config().target.clone();
        info!(service = %target, interval_ms = self.interval.as_millis() as u64, "scrape loop started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        state = self.tick() => {
                            debug!(service = %target, ?state, "scrape round finished");
                        }
                        _ = shutdown.changed() => {
                            debug!(service = %target, "shutdown during scrape round, discarding it");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!(service = %target, rounds = self.stats().rounds, "scrape loop stopped");
    }
}
