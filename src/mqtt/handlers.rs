//! Message handler variants.
//!
//! The supervisor hands every inbound [`MessageRecord`] to exactly one
//! [`MessageHandler`], chosen when the bridge is built. Handlers run on the
//! transport's network task, so none of them may wait on I/O:
//!
//! - [`HistoryHandler`] keeps the most recent records in memory
//! - [`EchoHandler`] prints each record, pretty-printing JSON payloads, and
//!   keeps it in a [`HistoryHandler`]
//! - [`QueuedStoreHandler`] pushes records into the ingestion queue
//! - [`DirectStoreHandler`] spawns one store task per record

use super::message::MessageRecord;
use crate::persistence::ingestion_queue::{EnqueueOutcome, QueueProducer};
use crate::persistence::persistence_worker::{store_with_retry, PipelineStats, RetryPolicy};
use crate::persistence::MessageStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, info};

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, record: MessageRecord);

    fn name(&self) -> &'static str;
}

/// Keeps the last `limit` records, oldest evicted first.
pub struct HistoryHandler {
    history: Mutex<VecDeque<MessageRecord>>,
    limit: usize,
}

impl HistoryHandler {
    pub fn new(limit: usize) -> Self {
        HistoryHandler {
            history: Mutex::new(VecDeque::with_capacity(limit.min(64))),
            limit: limit.max(1),
        }
    }

    pub fn history(&self) -> Vec<MessageRecord> {
        match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HistoryHandler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl MessageHandler for HistoryHandler {
    fn handle_message(&self, record: MessageRecord) {
        info!(topic = record.topic(), qos = record.qos_level(), "Message received");
        debug!(payload = %record.payload_text(), "Message payload");

        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };
        if history.len() == self.limit {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn name(&self) -> &'static str {
        "history"
    }
}

/// Prints every record to stdout after recording it in `history`.
pub struct EchoHandler {
    history: Arc<HistoryHandler>,
}

impl EchoHandler {
    pub fn new(history: Arc<HistoryHandler>) -> Self {
        EchoHandler { history }
    }

    pub fn history(&self) -> &HistoryHandler {
        &self.history
    }

    pub fn render(record: &MessageRecord) -> String {
        let payload = record.payload_text();
        let body = serde_json::from_str::<serde_json::Value>(&payload)
            .ok()
            .and_then(|json| serde_json::to_string_pretty(&json).ok())
            .unwrap_or_else(|| payload.into_owned());

        format!(
            "=== New Message ===\nTimestamp: {}\nTopic: {}\nQoS: {}\nPayload:\n{}\n=================",
            record.received_at().format("%Y-%m-%d %H:%M:%S"),
            record.topic(),
            record.qos_level(),
            body
        )
    }
}

impl MessageHandler for EchoHandler {
    fn handle_message(&self, record: MessageRecord) {
        let rendered = Self::render(&record);
        self.history.handle_message(record);
        println!("\n{}\n", rendered);
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// Hands records to the storage worker through the ingestion queue.
pub struct QueuedStoreHandler {
    producer: QueueProducer,
}

impl QueuedStoreHandler {
    pub fn new(producer: QueueProducer) -> Self {
        QueuedStoreHandler { producer }
    }
}

impl MessageHandler for QueuedStoreHandler {
    fn handle_message(&self, record: MessageRecord) {
        // Drops are counted and rate-limit logged by the queue itself.
        if let EnqueueOutcome::Enqueued = self.producer.enqueue(record) {
            debug!(queued = self.producer.size(), "Message queued for storage");
        }
    }

    fn name(&self) -> &'static str {
        "queued_store"
    }
}

/// Stores each record on its own task, without a queue in between.
///
/// Records are not ordered relative to each other and nothing is drained on
/// shutdown; use [`QueuedStoreHandler`] when either matters.
pub struct DirectStoreHandler {
    store: Arc<dyn MessageStore>,
    retry: RetryPolicy,
    stats: Arc<PipelineStats>,
    runtime: Handle,
}

impl DirectStoreHandler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        retry: RetryPolicy,
        stats: Arc<PipelineStats>,
        runtime: Handle,
    ) -> Self {
        DirectStoreHandler {
            store,
            retry,
            stats,
            runtime,
        }
    }
}

impl MessageHandler for DirectStoreHandler {
    fn handle_message(&self, record: MessageRecord) {
        let store = self.store.clone();
        let retry = self.retry;
        let stats = self.stats.clone();
        self.runtime.spawn(async move {
            match store_with_retry(store.as_ref(), &record, &retry).await {
                Ok(_) => stats.record_processed(),
                Err(_) => stats.record_failed(),
            }
        });
    }

    fn name(&self) -> &'static str {
        "direct_store"
    }
}
