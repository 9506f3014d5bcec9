//! Test doubles shared by the unit tests.

use crate::mqtt::config::BrokerSettings;
use crate::mqtt::message::MessageRecord;
use crate::mqtt::transport::{Ack, BrokerTransport, TransportError, TransportEvents, ACK_SUCCESS};
use crate::persistence::memory_store::MemoryStore;
use crate::persistence::{check_record, MessageStore, MessageUpdate, StoreError, StoredMessage};
use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::subscriber::DefaultGuard;

pub(crate) fn record(topic: &str, payload: &str) -> MessageRecord {
    MessageRecord::new(topic, payload.as_bytes().to_vec(), QoS::AtLeastOnce)
}

pub(crate) fn settings() -> BrokerSettings {
    BrokerSettings {
        endpoint: "test.s1.eu.hivemq.cloud".to_string(),
        port: 8883,
        username: "user".to_string(),
        password: "password".to_string(),
        ca_cert: String::new(),
        client_id: "test_client".to_string(),
        keep_alive: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(10),
    }
}

/// Store that fails a scripted number of inserts before delegating to memory.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    flushes: AtomicU32,
}

impl FlakyStore {
    pub(crate) fn failing_first(failures: u32) -> Self {
        FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
            flushes: AtomicU32::new(0),
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        check_record(record)?;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("database unavailable".to_string()));
        }
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

    async fn flush(&self) -> Result<(), StoreError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store whose inserts take `delay` before reaching memory.
pub(crate) struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    started: AtomicU32,
}

impl SlowStore {
    pub(crate) fn new(delay: Duration) -> Self {
        SlowStore {
            inner: MemoryStore::new(),
            delay,
            started: AtomicU32::new(0),
        }
    }

    /// Inserts that have begun, finished or not.
    pub(crate) fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for SlowStore {
    async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
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

/// Transport event sink that writes down every callback.
#[derive(Default)]
pub(crate) struct RecordingEvents {
    seen: Mutex<Vec<String>>,
}

impl RecordingEvents {
    pub(crate) fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl TransportEvents for RecordingEvents {
    fn on_connect(&self, code: u8) {
        self.seen.lock().unwrap().push(format!("connect:{code}"));
    }

    fn on_disconnect(&self, code: u8) {
        self.seen.lock().unwrap().push(format!("disconnect:{code}"));
    }

    fn on_message(&self, topic: &str, _payload: &[u8], _qos: QoS, _retain: bool) {
        self.seen.lock().unwrap().push(format!("message:{topic}"));
    }
}

/// Log lines written while the returned guard is alive, on this thread.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub(crate) fn count(&self, needle: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    /// Report CONNACK code 0 right away.
    Accept,
    /// Report the given non-zero CONNACK code right away.
    Refuse(u8),
    /// Never report anything.
    Silent,
    /// Fail before the attempt starts.
    Fail,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ConnectBehavior>,
    events: Option<Arc<dyn TransportEvents>>,
    connect_calls: usize,
    disconnect_calls: usize,
    subscribe_calls: Vec<(String, QoS)>,
    publish_calls: Vec<(String, Vec<u8>, QoS)>,
    publish_code: u8,
    subscribe_code: u8,
}

/// Scripted transport. Connects succeed unless a behavior was queued.
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn script(&self, behaviors: &[ConnectBehavior]) {
        self.state().script.extend(behaviors.iter().copied());
    }

    pub(crate) fn set_publish_code(&self, code: u8) {
        self.state().publish_code = code;
    }

    pub(crate) fn set_subscribe_code(&self, code: u8) {
        self.state().subscribe_code = code;
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.state().disconnect_calls
    }

    pub(crate) fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.state().subscribe_calls.clone()
    }

    pub(crate) fn subscribe_count(&self, filter: &str) -> usize {
        self.state()
            .subscribe_calls
            .iter()
            .filter(|(f, _)| f == filter)
            .count()
    }

    pub(crate) fn publish_calls(&self) -> Vec<(String, Vec<u8>, QoS)> {
        self.state().publish_calls.clone()
    }

    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        self.state().events.clone()
    }

    /// Simulate the broker dropping the connection.
    pub(crate) fn drop_connection(&self, reason_code: u8) {
        if let Some(events) = self.events() {
            events.on_disconnect(reason_code);
        }
    }

    /// Simulate an inbound message.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) {
        if let Some(events) = self.events() {
            events.on_message(topic, payload, QoS::AtLeastOnce, false);
        }
    }
}

impl BrokerTransport for MockTransport {
    fn connect(
        &self,
        _settings: &BrokerSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<(), TransportError> {
        let behavior = {
            let mut state = self.state();
            state.connect_calls += 1;
            state.events = Some(events.clone());
            state.script.pop_front().unwrap_or(ConnectBehavior::Accept)
        };
        match behavior {
            ConnectBehavior::Accept => events.on_connect(0),
            ConnectBehavior::Refuse(code) => events.on_connect(code),
            ConnectBehavior::Silent => {}
            ConnectBehavior::Fail => {
                return Err(TransportError::Client("scripted connect failure".into()))
            }
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Ack {
        let mut state = self.state();
        state.publish_calls.push((topic.to_string(), payload.to_vec(), qos));
        Ack::new(state.publish_code)
    }

    fn subscribe(&self, topic_filter: &str, qos: QoS) -> Ack {
        let mut state = self.state();
        state.subscribe_calls.push((topic_filter.to_string(), qos));
        Ack::new(state.subscribe_code)
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let events = {
            let mut state = self.state();
            state.disconnect_calls += 1;
            state.events.take()
        };
        if let Some(events) = events {
            events.on_disconnect(0);
        }
        Ok(())
    }
}

#[test]
fn mock_defaults_to_success_codes() {
    let transport = MockTransport::new();
    assert_eq!(transport.publish("t", b"p", QoS::AtMostOnce).code, ACK_SUCCESS);
    assert_eq!(transport.subscribe("t", QoS::AtMostOnce).code, ACK_SUCCESS);
}
