//! Telemetry sample model.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ScrapeError, ScrapeResult};

/// One load reading reported by one worker for one logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Identity of the reporting worker.
    pub pod_name: String,
    /// Logical-service key the reading belongs to.
    #[serde(alias = "revision_name")]
    pub key: String,
    #[serde(default)]
    pub average_concurrent_requests: f64,
    #[serde(default)]
    pub average_proxied_concurrent_requests: f64,
    #[serde(default)]
    pub request_count: f64,
    #[serde(default)]
    pub proxied_request_count: f64,
    /// Seconds since the worker process started.
    #[serde(default)]
    pub process_uptime: f64,
    /// Unix seconds. Filled in on receipt when the worker omits it.
    #[serde(default)]
    pub timestamp: u64,
}

impl Sample {
    pub fn new(pod_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            key: key.into(),
            average_concurrent_requests: 0.0,
            average_proxied_concurrent_requests: 0.0,
            request_count: 0.0,
            proxied_request_count: 0.0,
            process_uptime: 0.0,
            timestamp: epoch_secs(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: f64) -> Self {
        self.average_concurrent_requests = concurrency;
        self
    }
}

/// Samples for one logical-service key, as held by the result cache.
pub type FleetSnapshot = Vec<Sample>;

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Sample>),
    One(Sample),
}

/// Parse a metrics body holding either one record or a list of records.
///
/// Records without a timestamp are stamped with the receive time.
pub fn decode_samples(address: &str, body: &[u8]) -> ScrapeResult<Vec<Sample>> {
    let parsed: OneOrMany = serde_json::from_slice(body).map_err(|e| ScrapeError::Malformed {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    let mut samples = match parsed {
        OneOrMany::Many(samples) => samples,
        OneOrMany::One(sample) => vec![sample],
    };

    let now = epoch_secs();
    for sample in &mut samples {
        if sample.pod_name.is_empty() {
            return Err(ScrapeError::Malformed {
                address: address.to_string(),
                reason: "record without pod_name".into(),
            });
        }
        if sample.timestamp == 0 {
            sample.timestamp = now;
        }
    }
    Ok(samples)
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
