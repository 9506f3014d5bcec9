//! Message store backed by `sled`.
//!
//! Rows live in a single `messages` tree keyed by their big-endian id, so tree
//! order is insertion order and reverse iteration yields the newest rows
//! first. Ids come from sled's monotonic id generator and survive restarts.

use super::{check_record, MessageStore, MessageUpdate, StoreError, StoredMessage};
use crate::mqtt::message::MessageRecord;
use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

const MESSAGES_TREE: &str = "messages";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
}

impl SledStore {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!("Opened sled message store at {}", path.display());
        Self::with_db(db)
    }

    /// Database that is deleted when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StoreError> {
        let messages = db.open_tree(MESSAGES_TREE)?;
        Ok(Self { db, messages })
    }

    fn decode(value: &[u8]) -> Result<StoredMessage, StoreError> {
        Ok(serde_json::from_slice(value)?)
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn insert(&self, record: &MessageRecord) -> Result<u64, StoreError> {
        check_record(record)?;
        let id = self.db.generate_id()? + 1;
        let row = StoredMessage::from_record(id, record);
        let value = serde_json::to_vec(&row)?;
        self.messages.insert(id.to_be_bytes(), value)?;
        Ok(id)
    }

    async fn get(&self, id: u64) -> Result<Option<StoredMessage>, StoreError> {
        match self.messages.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn by_topic(&self, topic: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.messages.iter().rev() {
            if rows.len() == limit {
                break;
            }
            let (_, value) = entry?;
            let row = Self::decode(&value)?;
            if row.topic == topic {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn update(&self, id: u64, update: MessageUpdate) -> Result<bool, StoreError> {
        update.check()?;
        if update.is_empty() {
            return Ok(false);
        }
        let key = id.to_be_bytes();
        let Some(value) = self.messages.get(key)? else {
            return Ok(false);
        };
        let mut row = Self::decode(&value)?;
        update.apply_to(&mut row);
        self.messages.insert(key, serde_json::to_vec(&row)?)?;
        Ok(true)
    }

    async fn delete(&self, id: u64) -> Result<bool, StoreError> {
        Ok(self.messages.remove(id.to_be_bytes())?.is_some())
    }

    async fn delete_topic(&self, topic: &str) -> Result<usize, StoreError> {
        let mut keys = Vec::new();
        for entry in self.messages.iter() {
            let (key, value) = entry?;
            if Self::decode(&value)?.topic == topic {
                keys.push(key);
            }
        }
        for key in &keys {
            self.messages.remove(key)?;
        }
        Ok(keys.len())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.messages.len())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let bytes = self.db.flush_async().await?;
        debug!("Flushed {} bytes to disk", bytes);
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("rows", &self.messages.len())
            .finish()
    }
}
