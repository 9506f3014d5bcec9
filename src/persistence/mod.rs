//! # Persistence Module
//!
//! ## Why This Module Exists
//! Inbound MQTT traffic arrives on the network task in bursts, while the store
//! behind it can be slow or briefly unavailable. This module decouples the two:
//! a bounded [`ingestion_queue`] absorbs bursts without ever blocking the
//! producer, and the [`persistence_worker`] drains it into a [`MessageStore`]
//! with bounded retries.
//!
//! ## Key Abstractions
//! - **[`MessageStore`]**: async, object-safe storage seam. The pipeline needs
//!   `insert` and `flush`; the read/update/delete operations serve inspection
//!   and tooling.
//! - **[`MessageUpdate`]**: partial edit of a stored row.
//! - **[`StoredMessage`]**: the persisted row shape, one row per message.
//! - **[`StoreError`]**: transient failures are retried by the worker,
//!   [`StoreError::Rejected`] is permanent and never retried.
//!
//! ## Backends
//! - [`memory_store::MemoryStore`] keeps rows in process, useful for tests and
//!   dry runs.
//! - [`sled_store::SledStore`] persists rows in an embedded `sled` database.

pub mod ingestion_queue;
pub mod memory_store;
pub mod persistence_worker;
pub mod sled_store;

use crate::mqtt::message::MessageRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest topic a row can hold.
pub const MAX_TOPIC_LEN: usize = 255;
/// Longest client identifier a row can hold.
pub const MAX_CLIENT_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure; may succeed on a later attempt.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The record can never be stored as is.
    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },
}

impl StoreError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::Rejected(_) | StoreError::Serialization(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// One persisted message row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: u64,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    pub timestamp: DateTime<Utc>,
    pub client_id: Option<String>,
}

impl StoredMessage {
    pub fn from_record(id: u64, record: &MessageRecord) -> Self {
        StoredMessage {
            id,
            topic: record.topic().to_string(),
            payload: record.payload_text().into_owned(),
            qos: record.qos_level(),
            retain: record.retain(),
            timestamp: record.received_at(),
            client_id: record.client_id().map(str::to_string),
        }
    }
}

/// Fields to overwrite on an existing row; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    pub payload: Option<String>,
    pub qos: Option<u8>,
    pub retain: Option<bool>,
}

impl MessageUpdate {
    pub fn is_empty(&self) -> bool {
        self.payload.is_none() && self.qos.is_none() && self.retain.is_none()
    }

    pub fn check(&self) -> Result<(), StoreError> {
        match self.qos {
            Some(qos) if qos > 2 => Err(StoreError::Rejected(format!("qos {qos} is not 0, 1 or 2"))),
            _ => Ok(()),
        }
    }

    pub fn apply_to(&self, row: &mut StoredMessage) {
        if let Some(payload) = &self.payload {
            row.payload.clone_from(payload);
        }
        if let Some(qos) = self.qos {
            row.qos = qos;
        }
        if let Some(retain) = self.retain {
            row.retain = retain;
        }
    }
}

/// Checks the row constraints shared by every backend.
pub fn check_record(record: &MessageRecord) -> Result<(), StoreError> {
    if record.topic().is_empty() {
        return Err(StoreError::Rejected("topic is empty".to_string()));
    }
    if record.topic().len() > MAX_TOPIC_LEN {
        return Err(StoreError::Rejected(format!(
            "topic is {} bytes, limit is {}",
            record.topic().len(),
            MAX_TOPIC_LEN
        )));
    }
    if let Some(client_id) = record.client_id() {
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(StoreError::Rejected(format!(
                "client id is {} bytes, limit is {}",
                client_id.len(),
                MAX_CLIENT_ID_LEN
            )));
        }
    }
    Ok(())
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist one record and return its row id.
    async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError>;

    async fn get(&self, id: u64) -> Result<Option<StoredMessage>, StoreError>;

    /// Rows for `topic`, newest first.
    async fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// Overwrite the fields set in `update`. Returns `false` when no row has
    /// that id or the update is empty.
    async fn update(&self, id: u64, update: MessageUpdate) -> Result<bool, StoreError>;

    async fn delete(&self, id: u64) -> Result<bool, StoreError>;

    /// Remove every row for `topic`, returning how many were removed.
    async fn delete_topic(&self, topic: &str) -> Result<usize, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    /// Make every accepted write durable. Called once at shutdown.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
