//! Ingest worker: turns bus messages into stored readings.
//!
//! The [`IngestWorker`] is the [`MessageHandler`] of the bus session. For
//! each message it normalizes the payload and applies it to its own
//! [`Store`] connection. Failures drop the message and are counted in
//! [`IngestStats`]; nothing is retried.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use fieldnode_store::Store;
use fieldnode_types::Normalizer;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::bus::{BusMessage, MessageHandler};

/// Ingest counters, shared with the HTTP status endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    persisted: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_persist: AtomicU64,
    pruned: AtomicU64,
    handler_panics: AtomicU64,
    /// Unix timestamp of the last persisted message (0 = never).
    last_message_at: AtomicI64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub dropped_decode: u64,
    pub dropped_persist: u64,
    pub pruned: u64,
    pub handler_panics: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

impl IngestStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        let last = self.last_message_at.load(Ordering::Relaxed);
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped_decode: self.dropped_decode.load(Ordering::Relaxed),
            dropped_persist: self.dropped_persist.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            last_message_at: (last > 0)
                .then(|| OffsetDateTime::from_unix_timestamp(last).ok())
                .flatten(),
        }
    }

    /// Count rows removed by the startup prune.
    pub fn record_pruned(&self, rows: u64) {
        self.pruned.fetch_add(rows, Ordering::Relaxed);
    }
}

/// Applies bus messages to the store, one at a time.
pub struct IngestWorker {
    normalizer: Normalizer,
    store: Mutex<Store>,
    stats: Arc<IngestStats>,
}

impl IngestWorker {
    /// Create a worker that owns `store`.
    ///
    /// The normalizer uses the store's shape, so a message can never be
    /// rejected for a shape mismatch.
    pub fn new(store: Store, stats: Arc<IngestStats>) -> Self {
        Self {
            normalizer: Normalizer::new(store.shape()),
            store: Mutex::new(store),
            stats,
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Normalize and persist one payload.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let message = match self.normalizer.normalize(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.dropped_decode.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping message on '{}' ({} bytes): {}",
                    topic,
                    payload.len(),
                    e
                );
                return;
            }
        };

        let result = self.store.lock().await.ingest(&message);
        match result {
            Ok(outcome) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .pruned
                    .fetch_add(outcome.pruned, Ordering::Relaxed);
                self.stats
                    .last_message_at
                    .store(outcome.recorded_at.unix_timestamp(), Ordering::Relaxed);
                debug!(
                    "Stored {} reading(s) for {} (pruned {})",
                    outcome.inserted, message.device.device_id, outcome.pruned
                );
            }
            Err(e) => {
                self.stats.dropped_persist.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Failed to persist message from {}: {}",
                    message.device.device_id, e
                );
            }
        }
    }
}

#[async_trait]
impl MessageHandler for IngestWorker {
    async fn handle(&self, message: BusMessage) {
        self.ingest(&message.topic, &message.payload).await;
    }

    fn on_panic(&self) {
        self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
    }
}
