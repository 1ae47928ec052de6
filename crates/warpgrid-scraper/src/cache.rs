//! Result cache — the hand-off point between the scrape loop and its
//! consumer.
//!
//! One slot per logical-service key. Publishing appends to whatever is
//! still unread; consuming takes the whole slot, so every sample is read
//! at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::sample::{FleetSnapshot, Sample};

/// Default cap on unread samples per key.
pub const DEFAULT_MAX_SAMPLES_PER_KEY: usize = 1024;

/// Read-once map from service key to accumulated samples. Cheap to clone;
/// clones share the same slots.
#[derive(Debug, Clone)]
pub struct ResultCache {
    slots: Arc<Mutex<HashMap<String, FleetSnapshot>>>,
    max_samples_per_key: usize,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES_PER_KEY)
    }
}

impl ResultCache {
    /// Create a cache keeping at most `max_samples_per_key` unread samples
    /// per key. The oldest are dropped first.
    pub fn new(max_samples_per_key: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            max_samples_per_key: max_samples_per_key.max(1),
        }
    }

    /// Append `samples` to the unread snapshot for `key`.
    ///
    /// Publishing an empty list still creates the slot, so a consumer can
    /// tell "no workers" from "nothing scraped yet".
    pub async fn publish(&self, key: &str, samples: Vec<Sample>) {
        let mut slots = self.slots.lock().await;
        self.append(&mut slots, key, samples);
    }

    /// Publish every snapshot of a round under one lock, so a consumer
    /// sees either all keys of the round or none of them.
    pub async fn publish_all(&self, snapshots: BTreeMap<String, FleetSnapshot>) {
        let mut slots = self.slots.lock().await;
        for (key, samples) in snapshots {
            self.append(&mut slots, &key, samples);
        }
    }

    fn append(&self, slots: &mut HashMap<String, FleetSnapshot>, key: &str, samples: Vec<Sample>) {
        let slot = slots.entry(key.to_string()).or_default();
        slot.extend(samples);

        let overflow = slot.len().saturating_sub(self.max_samples_per_key);
        if overflow > 0 {
            slot.drain(..overflow);
            debug!(%key, dropped = overflow, "unread samples over cap, dropped oldest");
        }
    }

    /// Take the unread snapshot for `key`, leaving the slot empty.
    pub async fn consume(&self, key: &str) -> Option<FleetSnapshot> {
        self.slots.lock().await.remove(key)
    }

    /// Keys with an unread snapshot.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}
