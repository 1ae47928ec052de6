//! Error types for fleet scraping.

use thiserror::Error;

/// Result type alias for scraper operations.
pub type ScrapeResult<T> = Result<T, ScrapeError>;

/// Errors that can occur while sampling a fleet.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("worker unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("malformed telemetry from {address}: {reason}")]
    Malformed { address: String, reason: String },

    #[error("pod directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("no sample from an unscraped worker after {attempts} attempts")]
    NoDistinctSample { attempts: u32 },

    #[error("every sample failed across {workers} workers")]
    AllSamplesFailed { workers: usize },
}
