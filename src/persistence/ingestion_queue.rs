//! Bounded FIFO between the network task and the storage worker.
//!
//! The producer side never waits: when the queue holds `capacity` records the
//! new record is dropped and counted instead. Every 100th drop is logged as a
//! warning so a sustained overload stays visible without flooding the log.
//!
//! [`QueueProducer::close_intake`] turns every later enqueue into a counted
//! drop while the consumer keeps draining what is already queued.

use super::persistence_worker::PipelineStats;
use crate::mqtt::message::MessageRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{trace, warn};

pub const DEFAULT_CAPACITY: usize = 1000;
const DROP_WARN_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Queue was full; the record was discarded.
    Dropped,
    /// Intake closed or consumer gone; the record was discarded.
    Closed,
}

/// Create a queue holding at most `capacity` records (at least one).
pub fn ingestion_queue(capacity: usize, stats: Arc<PipelineStats>) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let producer = QueueProducer {
        tx,
        stats,
        intake_closed: Arc::new(AtomicBool::new(false)),
    };
    (producer, QueueConsumer { rx })
}

/// Sending half. Clones share the queue, the counters and the intake flag.
#[derive(Clone, Debug)]
pub struct QueueProducer {
    tx: mpsc::Sender<MessageRecord>,
    stats: Arc<PipelineStats>,
    intake_closed: Arc<AtomicBool>,
}

impl QueueProducer {
    /// Append `record` without waiting. Constant time in every outcome.
    pub fn enqueue(&self, record: MessageRecord) -> EnqueueOutcome {
        if self.intake_closed.load(Ordering::SeqCst) {
            self.count_drop(&record, "Ingestion queue intake closed, dropping message");
            return EnqueueOutcome::Closed;
        }
        match self.tx.try_send(record) {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err(TrySendError::Full(record)) => {
                self.count_drop(&record, "Ingestion queue overflow, messages are being dropped");
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(record)) => {
                self.count_drop(&record, "Ingestion queue closed, dropping message");
                EnqueueOutcome::Closed
            }
        }
    }

    /// Refuse every later record. Already queued records stay for the consumer.
    pub fn close_intake(&self) {
        self.intake_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_intake_closed(&self) -> bool {
        self.intake_closed.load(Ordering::SeqCst)
    }

    fn count_drop(&self, record: &MessageRecord, warning: &'static str) {
        let dropped = self.stats.record_dropped();
        trace!(topic = record.topic(), dropped, "Message dropped");
        if dropped % DROP_WARN_EVERY == 0 {
            warn!(dropped, capacity = self.capacity(), "{}", warning);
        }
    }

    /// Records currently waiting in the queue.
    pub fn size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.stats.snapshot().dropped
    }
}

#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::Receiver<MessageRecord>,
}

impl QueueConsumer {
    /// Oldest record, or `None` once `timeout` elapses without one.
    ///
    /// Also returns `None` immediately when every producer is gone and the
    /// queue is empty; check [`QueueConsumer::is_closed`] to tell the two apart.
    pub async fn dequeue(&mut self, timeout: Duration) -> Option<MessageRecord> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .unwrap_or_default()
    }

    pub fn try_dequeue(&mut self) -> Option<MessageRecord> {
        match self.rx.try_recv() {
            Ok(record) => Some(record),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn size(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}
