use super::{check_record, MessageStore, MessageUpdate, StoreError, StoredMessage};
use crate::mqtt::message::MessageRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Message store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<u64, StoredMessage>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<u64, StoredMessage>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// All rows in insertion order.
    pub fn snapshot(&self) -> Vec<StoredMessage> {
        self.rows()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError> {
        check_record(record)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows()?
            .insert(id, StoredMessage::from_record(id, record));
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.rows()?.get(&id).cloned())
    }

    async fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .rows()?
            .values()
            .rev()
            .filter(|row| row.topic == topic)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, id: u64, update: MessageUpdate) -> Result<bool, StoreError> {
        update.check()?;
        if update.is_empty() {
            return Ok(false);
        }
        match self.rows()?.get_mut(&id) {
            Some(row) => {
                update.apply_to(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.rows()?.remove(&id).is_some())
    }

    async fn delete_topic(&self, topic: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|_, row| row.topic != topic);
        Ok(before - rows.len())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows()?.len())
    }
}
