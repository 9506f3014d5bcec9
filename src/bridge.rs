//! Bridge wiring and graceful shutdown.
//!
//! [`Bridge::start`] builds the handler chosen by [`HandlerKind`], the
//! connection supervisor around it and, for the queued store handler, the
//! ingestion queue plus its storage worker. [`Bridge::shutdown`] closes the
//! queue intake, stops the worker, drains whatever is still queued, flushes
//! the store and only then releases the broker connection.

use crate::config::{BridgeConfig, HandlerKind, PipelineSettings, Subscription};
use crate::mqtt::client::{BrokerClient, ClientError};
use crate::mqtt::config::BrokerSettings;
use crate::mqtt::handlers::{
    DirectStoreHandler, EchoHandler, HistoryHandler, MessageHandler, QueuedStoreHandler,
    DEFAULT_HISTORY_LIMIT,
};
use crate::mqtt::message::MessageRecord;
use crate::mqtt::supervisor::{ConnectionError, ConnectionSupervisor};
use crate::mqtt::transport::BrokerTransport;
use crate::persistence::ingestion_queue::{ingestion_queue, QueueConsumer, QueueProducer};
use crate::persistence::persistence_worker::{
    store_with_retry, PipelineStats, StatsReporter, StatsSnapshot, StorageWorker, WorkerHandle,
};
use crate::persistence::MessageStore;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("handler {0:?} needs a message store")]
    MissingStore(HandlerKind),

    #[error("bridge must be started inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeOptions {
    pub handler: HandlerKind,
    pub pipeline: PipelineSettings,
    pub history_limit: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            handler: HandlerKind::default(),
            pipeline: PipelineSettings::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BridgeOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        BridgeOptions {
            handler: config.handler.kind,
            pipeline: config.pipeline.clone(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Outcome of [`Bridge::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued records stored during the final drain.
    pub drained: u64,
    /// Queued records discarded during the final drain.
    pub failed: u64,
    pub stats: StatsSnapshot,
}

impl fmt::Display for ShutdownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "drained={} drain_failed={} {}",
            self.drained, self.failed, self.stats
        )
    }
}

struct Pipeline {
    producer: QueueProducer,
    consumer: Arc<Mutex<QueueConsumer>>,
    worker: WorkerHandle,
}

pub struct Bridge {
    supervisor: ConnectionSupervisor,
    client: BrokerClient,
    stats: Arc<PipelineStats>,
    pipeline: Option<Pipeline>,
    store: Option<Arc<dyn MessageStore>>,
    history: Option<Arc<HistoryHandler>>,
    options: BridgeOptions,
}

impl Bridge {
    /// Wire up handler, supervisor and (for the queued store) the storage worker.
    ///
    /// Does not connect; call [`Bridge::connect`] afterwards.
    pub fn start(
        transport: Arc<dyn BrokerTransport>,
        store: Option<Arc<dyn MessageStore>>,
        options: BridgeOptions,
    ) -> Result<Bridge, BridgeError> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let stats = Arc::new(PipelineStats::default());
        let mut pipeline = None;
        let mut history = None;

        let store = store.filter(|_| options.handler.needs_store());
        let handler: Arc<dyn MessageHandler> = match (options.handler, store.clone()) {
            (HandlerKind::QueuedStore, Some(store)) => {
                let (producer, consumer) =
                    ingestion_queue(options.pipeline.queue_capacity, stats.clone());
                let consumer = Arc::new(Mutex::new(consumer));
                let worker = StorageWorker::new(
                    consumer.clone(),
                    store,
                    stats.clone(),
                    options.pipeline.worker_settings(),
                )
                .spawn();
                pipeline = Some(Pipeline {
                    producer: producer.clone(),
                    consumer,
                    worker,
                });
                Arc::new(QueuedStoreHandler::new(producer))
            }
            (HandlerKind::DirectStore, Some(store)) => Arc::new(DirectStoreHandler::new(
                store,
                options.pipeline.retry_policy(),
                stats.clone(),
                runtime,
            )),
            (HandlerKind::Echo, _) => {
                let kept = Arc::new(HistoryHandler::new(options.history_limit));
                history = Some(kept.clone());
                Arc::new(EchoHandler::new(kept))
            }
            (HandlerKind::History, _) => {
                let handler = Arc::new(HistoryHandler::new(options.history_limit));
                history = Some(handler.clone());
                handler
            }
            (kind, None) => return Err(BridgeError::MissingStore(kind)),
        };

        info!(handler = handler.name(), "Bridge started");
        let supervisor = ConnectionSupervisor::new(transport, handler);
        Ok(Bridge {
            client: BrokerClient::new(supervisor.clone()),
            supervisor,
            stats,
            pipeline,
            store,
            history,
            options,
        })
    }

    pub async fn connect(&self, settings: &BrokerSettings) -> Result<(), ConnectionError> {
        self.supervisor.connect(settings).await
    }

    /// Subscribe to every configured filter, stopping at the first failure.
    pub fn subscribe_all(&self, subscriptions: &[Subscription]) -> Result<(), ClientError> {
        for subscription in subscriptions {
            self.client.subscribe(&subscription.filter, subscription.qos())?;
        }
        Ok(())
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records kept by the history and echo handlers; `None` for the others.
    pub fn history(&self) -> Option<Vec<MessageRecord>> {
        self.history.as_ref().map(|h| h.history())
    }

    /// Close the intake, stop the worker, drain the queue into the store,
    /// flush it, then disconnect.
    ///
    /// Messages the broker delivers after this starts are counted as dropped,
    /// so the drain only covers records already queued.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutting down bridge...");
        let mut drained = 0;
        let mut failed = 0;

        if let (Some(pipeline), Some(store)) = (self.pipeline, &self.store) {
            pipeline.producer.close_intake();
            pipeline
                .worker
                .stop(self.options.pipeline.shutdown_timeout())
                .await;

            let retry = self.options.pipeline.retry_policy();
            let mut consumer = pipeline.consumer.lock().await;
            let resident = consumer.size();
            if resident > 0 {
                info!(resident, "Draining ingestion queue");
            }
            // Bounded: nothing enters once the intake is closed.
            while let Some(record) = consumer.try_dequeue() {
                match store_with_retry(store.as_ref(), &record, &retry).await {
                    Ok(_) => {
                        self.stats.record_processed();
                        drained += 1;
                    }
                    Err(_) => {
                        self.stats.record_failed();
                        failed += 1;
                    }
                }
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.flush().await {
                warn!("Flushing the message store failed: {}", e);
            }
        }

        StatsReporter::new(self.options.pipeline.worker_settings().stats_interval)
            .report(&self.stats, 0);

        if let Err(e) = self.supervisor.disconnect() {
            warn!("Disconnect during shutdown failed: {}", e);
        }

        let report = ShutdownReport {
            drained,
            failed,
            stats: self.stats.snapshot(),
        };
        info!(%report, "Bridge stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::persistence::memory_store::MemoryStore;
    use crate::persistence::{MessageUpdate, StoreError, StoredMessage};
    use crate::testing::{
        capture_logs, settings, ConnectBehavior, FlakyStore, MockTransport, SlowStore,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store that receives another broker message every time it is written.
    struct BusyStore {
        inner: MemoryStore,
        transport: Arc<MockTransport>,
    }

    #[async_trait]
    impl MessageStore for BusyStore {
        async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError> {
            self.transport.deliver("late", b"x");
            self.inner.insert(record).await
        }

        async fn get(&self, id: u64) -> Result<Option<StoredMessage>, StoreError> {
            self.inner.get(id).await
        }

        async fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
            self.inner.by_topic(topic, limit).await
        }

        async fn update(&self, id: u64, update: MessageUpdate) -> Result<bool, StoreError> {
            self.inner.update(id, update).await
        }

        async fn delete(&self, id: u64) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn delete_topic(&self, topic: &str) -> Result<usize, StoreError> {
            self.inner.delete_topic(topic).await
        }

        async fn len(&self) -> Result<usize, StoreError> {
            self.inner.len().await
        }
    }

    fn options(handler: HandlerKind) -> BridgeOptions {
        BridgeOptions {
            handler,
            pipeline: PipelineSettings {
                retry_delay_ms: 0,
                dequeue_timeout_ms: 10,
                ..PipelineSettings::default()
            },
            ..BridgeOptions::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn queued_store_persists_received_messages() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("sensors/flood", b"{\"level\": 3}");
        wait_until(|| bridge.stats().processed == 1).await;

        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "sensors/flood");
        assert_eq!(rows[0].client_id.as_deref(), Some("test_client"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_every_resident_record() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("early/1", b"a");
        transport.deliver("early/2", b"b");
        wait_until(|| bridge.stats().processed == 2).await;

        // No await between deliveries and shutdown, so the worker never sees these.
        for i in 0..3 {
            transport.deliver(&format!("late/{i}"), b"x");
        }
        let report = bridge.shutdown().await;

        assert_eq!(report.drained, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.stats.processed, 5);
        assert_eq!(store.snapshot().len(), 5);
        assert_eq!(transport.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn drain_stops_at_records_queued_before_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(BusyStore {
            inner: MemoryStore::new(),
            transport: transport.clone(),
        });
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        for i in 0..3 {
            transport.deliver(&format!("resident/{i}"), b"x");
        }
        let report = bridge.shutdown().await;

        assert_eq!(report.drained, 3);
        assert_eq!(report.stats.processed, 3);
        assert_eq!(report.stats.dropped, 3);
        let topics: Vec<_> = store.inner.snapshot().into_iter().map(|r| r.topic).collect();
        assert_eq!(topics, vec!["resident/0", "resident/1", "resident/2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_an_in_flight_store_finish() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(SlowStore::new(Duration::from_secs(8)));
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("slow", b"1");
        while store.started() == 0 {
            tokio::task::yield_now().await;
        }
        let report = bridge.shutdown().await;

        assert_eq!(report.stats.processed + report.stats.failed, 1);
        assert_eq!(report.drained, 0);
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(transport.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_store_and_reports_once() {
        let (logs, _guard) = capture_logs();
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(FlakyStore::failing_first(0));
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("t/1", b"x");
        transport.deliver("t/2", b"y");
        let report = bridge.shutdown().await;

        assert_eq!(report.stats.processed, 2);
        assert_eq!(store.flushes(), 1);
        assert_eq!(logs.count("Storage pipeline statistics"), 1);
        assert_eq!(logs.count("processed=2 dropped=0 failed=0 queued=0"), 1);
    }

    #[tokio::test]
    async fn direct_store_is_flushed_on_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(FlakyStore::failing_first(0));
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::DirectStore))
                .unwrap();

        bridge.shutdown().await;
        assert_eq!(store.flushes(), 1);
    }

    #[tokio::test]
    async fn failed_drain_is_counted_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(FlakyStore::always_failing());
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::QueuedStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("t/1", b"x");
        transport.deliver("t/2", b"y");
        let report = bridge.shutdown().await;

        assert_eq!(report.drained, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(store.attempts(), 6);
    }

    #[tokio::test]
    async fn overflow_is_reported_in_stats() {
        let transport = Arc::new(MockTransport::new());
        let mut opts = options(HandlerKind::QueuedStore);
        opts.pipeline.queue_capacity = 2;
        let bridge =
            Bridge::start(transport.clone(), Some(Arc::new(MemoryStore::new())), opts).unwrap();
        bridge.connect(&settings()).await.unwrap();

        for topic in ["A", "B", "C"] {
            transport.deliver(topic, b"");
        }
        assert_eq!(bridge.stats().dropped, 1);

        let report = bridge.shutdown().await;
        assert_eq!(report.drained, 2);
        assert_eq!(report.stats.dropped, 1);
    }

    #[tokio::test]
    async fn direct_store_writes_without_queue() {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let bridge =
            Bridge::start(transport.clone(), Some(store.clone()), options(HandlerKind::DirectStore))
                .unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("direct", b"1");
        wait_until(|| bridge.stats().processed == 1).await;
        assert_eq!(store.snapshot().len(), 1);

        let report = bridge.shutdown().await;
        assert_eq!(report.drained, 0);
        assert_eq!(report.stats.processed, 1);
    }

    #[tokio::test]
    async fn store_handlers_require_a_store() {
        let transport = Arc::new(MockTransport::new());
        for kind in [HandlerKind::QueuedStore, HandlerKind::DirectStore] {
            let err = Bridge::start(transport.clone(), None, options(kind))
                .err()
                .unwrap();
            assert!(matches!(err, BridgeError::MissingStore(k) if k == kind));
        }
    }

    #[tokio::test]
    async fn history_handler_keeps_messages() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::start(transport.clone(), None, options(HandlerKind::History)).unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("hist", b"1");

        let history = bridge.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload(), b"1");
        assert_eq!(bridge.shutdown().await.drained, 0);
    }

    #[tokio::test]
    async fn echo_handler_keeps_history() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::start(transport.clone(), None, options(HandlerKind::Echo)).unwrap();
        bridge.connect(&settings()).await.unwrap();

        transport.deliver("echo/1", b"{\"level\": 1}");

        let history = bridge.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].topic(), "echo/1");
    }

    #[tokio::test]
    async fn refused_connect_issues_no_subscribe() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::start(transport.clone(), None, options(HandlerKind::Echo)).unwrap();
        transport.script(&[ConnectBehavior::Refuse(4)]);

        let err = bridge.connect(&settings()).await.unwrap_err();

        assert!(matches!(err, ConnectionError::Refused(_)));
        assert!(!bridge.client().is_connected());
        assert!(transport.subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn subscriptions_are_replayed_after_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let bridge = Bridge::start(transport.clone(), None, options(HandlerKind::History)).unwrap();
        bridge.connect(&settings()).await.unwrap();
        bridge
            .subscribe_all(&[Subscription::new("sensors/#", 1), Subscription::new("alerts/+", 0)])
            .unwrap();

        for cycle in 2..=4 {
            transport.drop_connection(7);
            bridge.connect(&settings()).await.unwrap();
            assert_eq!(transport.subscribe_count("sensors/#"), cycle);
            assert_eq!(transport.subscribe_count("alerts/+"), cycle);
            assert_eq!(bridge.client().subscribed_topics().len(), 2);
        }
    }

    #[test]
    fn options_follow_config() {
        let mut config = BridgeConfig::default();
        config.handler.kind = HandlerKind::Echo;
        config.pipeline.queue_capacity = 7;
        config.storage.backend = StorageBackend::Memory;

        let options = BridgeOptions::from_config(&config);
        assert_eq!(options.handler, HandlerKind::Echo);
        assert_eq!(options.pipeline.queue_capacity, 7);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let err = Bridge::start(
            Arc::new(MockTransport::new()),
            None,
            options(HandlerKind::Echo),
        )
        .err()
        .unwrap();
        assert!(matches!(err, BridgeError::NoRuntime));
    }
}
