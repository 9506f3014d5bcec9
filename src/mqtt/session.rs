use super::transport::ConnectRefusal;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Connection status plus the topic filters to replay after a reconnect.
///
/// Pure state: the supervisor decides when transitions happen, this type only
/// records them. Subscriptions are keyed by filter, so subscribing the same
/// filter twice keeps a single entry, and they survive disconnects.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    connection: ConnectionState,
    subscribed_topics: BTreeMap<String, QoS>,
    last_refusal: Option<ConnectRefusal>,
    messages_received: u64,
    last_activity: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn begin_connect(&mut self) {
        self.connection = ConnectionState::Connecting;
        self.last_refusal = None;
    }

    pub fn mark_connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.last_refusal = None;
        self.last_activity = Some(Utc::now());
    }

    pub fn mark_refused(&mut self, refusal: ConnectRefusal) {
        self.connection = ConnectionState::Disconnected;
        self.last_refusal = Some(refusal);
    }

    pub fn mark_disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
    }

    pub fn last_refusal(&self) -> Option<ConnectRefusal> {
        self.last_refusal
    }

    /// Returns `true` when the filter was not tracked before.
    pub fn add_subscription(&mut self, topic_filter: &str, qos: QoS) -> bool {
        self.subscribed_topics
            .insert(topic_filter.to_string(), qos)
            .is_none()
    }

    pub fn is_subscribed(&self, topic_filter: &str) -> bool {
        self.subscribed_topics.contains_key(topic_filter)
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscribed_topics
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed_topics.len()
    }

    pub fn note_message(&mut self) {
        self.messages_received += 1;
        self.last_activity = Some(Utc::now());
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }
}
