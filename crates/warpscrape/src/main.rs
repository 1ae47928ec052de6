//! warpscrape — fleet load scraper daemon.
//!
//! Samples the configured workers on a fixed interval, keeps the latest
//! readings in a read-once cache, and optionally prepares the async-call
//! ledger table.
//!
//! # Usage
//!
//! ```text
//! warpscrape run --config /etc/warpgrid/warpscrape.toml
//! warpscrape check --config warpscrape.toml
//! warpscrape ledger init --config warpscrape.toml
//! warpscrape ledger fetch <guid> --config warpscrape.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info};

use warpgrid_ledger::{AsyncLedger, SqlxDatabase};
use warpgrid_scraper::{
    FleetScraper, HttpSampleClient, ResultCache, ScrapeLoop, ScraperConfig, StaticDirectory,
};

use crate::config::{Config, LedgerSection};

#[derive(Parser)]
#[command(name = "warpscrape", about = "WarpGrid fleet scraper")]
struct Cli {
    /// Path to warpscrape.toml.
    #[arg(long, short, global = true, default_value = "warpscrape.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scrape loop until Ctrl-C.
    Run {
        /// Override `scraper.interval`.
        #[arg(long)]
        interval: Option<String>,
    },
    /// Validate the configuration and exit.
    Check,
    /// Async-call ledger maintenance.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Create the ledger table if missing.
    Init,
    /// Print one record as JSON.
    Fetch { guid: String },
    /// Delete one record.
    Delete { guid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let mut config = Config::from_file(&cli.config)?;

    match cli.command {
        Command::Run { interval } => {
            if let Some(interval) = interval {
                config.scraper.interval = interval;
                config.scraper.interval()?;
            }
            run(config).await
        }
        Command::Check => {
            info!(
                path = %cli.config.display(),
                pods = config.scraper.pods.len(),
                ledger = config.ledger.is_some(),
                "configuration ok"
            );
            Ok(())
        }
        Command::Ledger { action } => {
            let section = config
                .ledger
                .as_ref()
                .context("no [ledger] section in configuration")?;
            let (ledger, db) = open_ledger(section).await?;
            let outcome = ledger_action(&ledger, action).await;
            db.close().await;
            outcome
        }
    }
}

async fn ledger_action(ledger: &AsyncLedger, action: LedgerAction) -> anyhow::Result<()> {
    match action {
        LedgerAction::Init => ledger.create_table().await?,
        LedgerAction::Fetch { guid } => {
            let record = ledger.fetch(&guid).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        LedgerAction::Delete { guid } => {
            let existed = ledger.delete(&guid).await?;
            info!(%guid, existed, "record deleted");
        }
    }
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,warpscrape=debug,warpgrid=debug"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn open_ledger(section: &LedgerSection) -> anyhow::Result<(AsyncLedger, SqlxDatabase)> {
    let dialect = section.dialect()?;
    let db = SqlxDatabase::connect(&section.url, section.max_connections)
        .await
        .with_context(|| format!("failed to connect to {dialect} ledger"))?;
    info!(%dialect, "ledger connected");
    let ledger = AsyncLedger::new(Arc::new(db.clone()), dialect).with_retry(section.retry_policy()?);
    Ok((ledger, db))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let scraper_cfg = &config.scraper;
    let interval = scraper_cfg.interval()?;
    info!(target_key = %scraper_cfg.target, pods = scraper_cfg.pods.len(), "warpscrape starting");

    // ── Ledger (optional) ──────────────────────────────────────

    if let Some(section) = &config.ledger {
        let (ledger, db) = open_ledger(section).await?;
        let created = ledger.create_table().await;
        db.close().await;
        created?;
    }

    // ── Scraper ────────────────────────────────────────────────

    let directory = Arc::new(StaticDirectory::new(scraper_cfg.pods.clone()));
    let client = Arc::new(
        HttpSampleClient::new(scraper_cfg.metrics_port, scraper_cfg.metrics_path.clone())
            .with_timeout(scraper_cfg.timeout()?),
    );
    let scraper = FleetScraper::new(
        directory,
        client,
        ScraperConfig::new(scraper_cfg.target.clone())
            .with_selector(scraper_cfg.selector.clone())
            .with_bulk(scraper_cfg.bulk)
            .with_max_retries(scraper_cfg.max_retries),
    );
    let cache = ResultCache::new(scraper_cfg.max_samples_per_key);
    let scrape_loop = ScrapeLoop::new(Arc::new(scraper), cache.clone(), interval);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_shutdown = shutdown_rx.clone();
    let report_shutdown = shutdown_rx;

    let loop_runner = scrape_loop.clone();
    let loop_handle = tokio::spawn(async move {
        loop_runner.run(loop_shutdown).await;
    });

    let report_handle = tokio::spawn(async move {
        report_snapshots(cache, interval, report_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = loop_handle.await;
    let _ = report_handle.await;

    let stats = scrape_loop.stats();
    info!(
        rounds = stats.rounds,
        published = stats.published,
        partial_failures = stats.partial_failures,
        directory_failures = stats.directory_failures,
        "warpscrape stopped"
    );
    Ok(())
}

/// Consume and log every unread snapshot once per interval.
async fn report_snapshots(cache: ResultCache, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                for key in cache.keys().await {
                    let Some(samples) = cache.consume(&key).await else {
                        continue;
                    };
                    let concurrency: f64 = samples.iter().map(|s| s.average_concurrent_requests).sum();
                    let requests: f64 = samples.iter().map(|s| s.request_count).sum();
                    info!(%key, samples = samples.len(), concurrency, requests, "fleet snapshot");
                }
            }
            _ = shutdown.changed() => {
                debug!("snapshot reporter shutting down");
                break;
            }
        }
    }
}
