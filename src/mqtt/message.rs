use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::borrow::Cow;
use std::fmt;

const PREVIEW_CHARS: usize = 32;

/// Snapshot of one inbound message, taken the moment the transport delivers it.
///
/// Records are never mutated after construction. Ownership moves from the
/// network callback to the ingestion queue and from there to the storage
/// worker, which drops the record once it is persisted or discarded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    received_at: DateTime<Utc>,
    client_id: Option<String>,
}

impl MessageRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        MessageRecord {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            received_at: Utc::now(),
            client_id: None,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8, invalid sequences replaced.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn qos_level(&self) -> u8 {
        qos_level(self.qos)
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_text();
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        let ellipsis = if text.chars().count() > PREVIEW_CHARS {
            "..."
        } else {
            ""
        };
        write!(
            f,
            "{} - {}: {}{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

pub fn qos_from_level(level: u8) -> Option<QoS> {
    match level {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
