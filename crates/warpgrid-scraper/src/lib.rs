//! warpgrid-scraper — load telemetry sampling for a changing worker fleet.
//!
//! Samples every worker behind a scrape target on a fixed interval,
//! tolerates workers that fail or vanish mid-round, and hands the
//! aggregated readings to a single consumer through a read-once cache.
//!
//! # Architecture
//!
//! ```text
//! ScrapeLoop (interval timer, watch shutdown)
//!   └── FleetScraper::scrape_round()
//!         ├── PodDirectory::list_workers(selector)
//!         ├── SampleClient::sample / bulk_sample   ← one task per worker
//!         └── RoundReport { state, snapshots }
//!   └── ResultCache::publish()  ──►  consumer: ResultCache::consume()
//! ```

pub mod cache;
pub mod client;
pub mod directory;
pub mod error;
pub mod runloop;
pub mod sample;
pub mod scraper;

pub use cache::{DEFAULT_MAX_SAMPLES_PER_KEY, ResultCache};
pub use client::{HttpSampleClient, SampleClient};
pub use directory::{
    PodDirectory, Selector, StaticDirectory, Worker, WorkerPhase, pending_terminating_count,
};
pub use error::{ScrapeError, ScrapeResult};
pub use runloop::{LoopStats, ScrapeLoop};
pub use sample::{FleetSnapshot, Sample, decode_samples};
pub use scraper::{DEFAULT_MAX_RETRIES, FleetScraper, RoundReport, RoundState, ScraperConfig};
