//! warpscrape.toml configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use warpgrid_ledger::{Dialect, RetryPolicy};
use warpgrid_scraper::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_SAMPLES_PER_KEY, Selector, Worker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scraper: ScraperSection,
    pub ledger: Option<LedgerSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperSection {
    /// Service key the empty snapshot of a worker-less round is filed under.
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub bulk: bool,
    #[serde(default = "default_max_samples_per_key")]
    pub max_samples_per_key: usize,
    #[serde(default)]
    pub selector: Selector,
    pub pods: Vec<Worker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    pub dialect: String,
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: String,
}

fn default_target() -> String {
    "default".to_string()
}

fn default_interval() -> String {
    "1s".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_timeout() -> String {
    "3s".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_max_samples_per_key() -> usize {
    DEFAULT_MAX_SAMPLES_PER_KEY
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> String {
    "500ms".to_string()
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate. Every duration and the dialect tag are checked
    /// here so a bad value stops the process before anything starts.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.scraper.interval()?;
        config.scraper.timeout()?;
        if let Some(ledger) = &config.ledger {
            ledger.dialect()?;
            ledger.retry_policy()?;
        }
        Ok(config)
    }
}

impl ScraperSection {
    pub fn interval(&self) -> anyhow::Result<Duration> {
        let interval = parse_duration(&self.interval).context("scraper.interval")?;
        if interval.is_zero() {
            bail!("scraper.interval must be positive");
        }
        Ok(interval)
    }

    pub fn timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.timeout).context("scraper.timeout")
    }
}

impl LedgerSection {
    pub fn dialect(&self) -> anyhow::Result<Dialect> {
        Dialect::from_str(&self.dialect).context("ledger.dialect")
    }

    pub fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        let backoff = parse_duration(&self.backoff).context("ledger.backoff")?;
        Ok(RetryPolicy::fixed(self.max_attempts, backoff))
    }
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let parsed = if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().map(Duration::from_secs)
    };
    parsed.with_context(|| format!("invalid duration {s:?}"))
}
