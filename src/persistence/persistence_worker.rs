//! Storage worker - drains the ingestion queue into the message store.
//!
//! One worker task per bridge. Each iteration waits up to the dequeue timeout
//! for a record, stores it with bounded retries and checks whether the
//! periodic statistics report is due. The dequeue wait is the only recurring
//! suspension point and it is raced against the cancellation token, so a stop
//! request is noticed within one iteration.
//!
//! ```text
//! QueueConsumer ──dequeue(1s)──► store_with_retry ──► processed / failed
//!        ▲                              │
//!        └──── stop: CancellationToken  └── StatsReporter (every 60s)
//! ```

use super::ingestion_queue::QueueConsumer;
use super::{MessageStore, StoreError};
use crate::mqtt::message::MessageRecord;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pipeline counters, shared between the queue producer and the worker.
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl PipelineStats {
    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_failed(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records persisted successfully.
    pub processed: u64,
    /// Records discarded because the queue was full.
    pub dropped: u64,
    /// Records discarded after exhausting store attempts.
    pub failed: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} dropped={} failed={}",
            self.processed, self.dropped, self.failed
        )
    }
}

/// Emits a statistics line at a fixed cadence.
#[derive(Debug)]
pub struct StatsReporter {
    interval: Duration,
    last_report: Instant,
}

impl StatsReporter {
    pub fn new(interval: Duration) -> Self {
        StatsReporter {
            interval,
            last_report: Instant::now(),
        }
    }

    /// Report if the interval has elapsed since the last report.
    pub fn maybe_report(&mut self, stats: &PipelineStats, queued: usize) -> bool {
        if self.last_report.elapsed() >= self.interval {
            self.report(stats, queued);
            true
        } else {
            false
        }
    }

    pub fn report(&mut self, stats: &PipelineStats, queued: usize) {
        let snapshot = stats.snapshot();
        info!(
            processed = snapshot.processed,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            queued,
            "Storage pipeline statistics"
        );
        self.last_report = Instant::now();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

/// Insert `record`, retrying transient failures up to `policy.max_attempts`.
///
/// Earlier failures are logged as warnings, the last one as an error. The
/// record is not touched again after an `Err`; callers only count it.
pub async fn store_with_retry(
    store: &dyn MessageStore,
    record: &MessageRecord,
    policy: &RetryPolicy,
) -> Result<u64, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.insert(record).await {
            Ok(id) => {
                debug!(id, topic = record.topic(), attempt, "Message stored");
                return Ok(id);
            }
            Err(e) if e.is_permanent() => {
                error!(topic = record.topic(), error = %e, "Message rejected by store, discarding");
                return Err(e);
            }
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    topic = record.topic(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Failed to store message, retrying"
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => {
                error!(
                    topic = record.topic(),
                    attempts = attempt,
                    error = %e,
                    "Failed to store message, discarding"
                );
                return Err(StoreError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub retry: RetryPolicy,
    pub dequeue_timeout: Duration,
    pub stats_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            retry: RetryPolicy::default(),
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

pub struct StorageWorker {
    consumer: Arc<Mutex<QueueConsumer>>,
    store: Arc<dyn MessageStore>,
    stats: Arc<PipelineStats>,
    settings: WorkerSettings,
}

impl StorageWorker {
    pub fn new(
        consumer: Arc<Mutex<QueueConsumer>>,
        store: Arc<dyn MessageStore>,
        stats: Arc<PipelineStats>,
        settings: WorkerSettings,
    ) -> Self {
        StorageWorker {
            consumer,
            store,
            stats,
            settings,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { task, cancel }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            max_attempts = self.settings.retry.max_attempts,
            "Storage worker started"
        );
        let mut reporter = StatsReporter::new(self.settings.stats_interval);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // The consumer lock is only held while waiting, never while storing.
            let (next, queued, closed) = {
                let mut consumer = self.consumer.lock().await;
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = consumer.dequeue(self.settings.dequeue_timeout) => next,
                };
                (next, consumer.size(), consumer.is_closed())
            };

            match next {
                Some(record) => self.persist(record).await,
                None if closed && queued == 0 => {
                    info!("Ingestion queue closed, storage worker exiting");
                    break;
                }
                None => {}
            }

            reporter.maybe_report(&self.stats, queued);
        }

        info!(stats = %self.stats.snapshot(), "Storage worker stopped");
    }

    async fn persist(&self, record: MessageRecord) {
        match store_with_retry(self.store.as_ref(), &record, &self.settings.retry).await {
            Ok(_) => {
                self.stats.record_processed();
            }
            Err(_) => {
                self.stats.record_failed();
            }
        }
    }
}

/// Running worker task plus the token that stops it.
pub struct WorkerHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Signal the worker and wait for it to finish its current iteration.
    ///
    /// A store call in flight is never cut short. If the worker is still busy
    /// after `timeout` a warning is logged and the wait continues; the return
    /// value is `false` in that case.
    pub async fn stop(mut self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let (joined, in_time) = match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(joined) => (joined, true),
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Storage worker still busy after shutdown timeout, waiting for the current store"
                );
                (self.task.await, false)
            }
        };
        if let Err(e) = joined {
            error!("Storage worker terminated abnormally: {}", e);
        }
        in_time
    }
}
