//! The key-value store boundary.
//!
//! Documents are JSON values addressed by database, partition and key.
//! Keys are plain strings compared bytewise, so `range` returns the
//! documents of a key prefix in key order.

use crate::partition::PartitionRef;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{event, Level};

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    /// The store could not be reached. Retrying may succeed.
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    /// A write would replace a document produced by a later event.
    #[error("document {key} was already written at {stored}, refusing {attempted}")]
    Conflict {
        key: String,
        stored: String,
        attempted: String,
    },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, db: &str, partition: PartitionRef, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the whole document. Either the full document is written
    /// or nothing is.
    fn put(&self, db: &str, partition: PartitionRef, key: &str, doc: Value) -> Result<(), StoreError>;

    fn range(&self, db: &str, partition: PartitionRef, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

pub fn get_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    db: &str,
    partition: PartitionRef,
    key: &str,
) -> Result<Option<T>, StoreError> {
    store
        .get(db, partition, key)?
        .map(|value| {
            serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

pub fn put_doc<T: Serialize>(
    store: &dyn DocumentStore,
    db: &str,
    partition: PartitionRef,
    key: &str,
    doc: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(doc).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(db, partition, key, value)
}

type Address = (String, PartitionRef, String);

/// An in-process store. Replicas share the primary's data.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<Address, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a database, across partitions.
    pub fn count(&self, db: &str) -> usize {
        self.docs.read().keys().filter(|(d, _, _)| d == db).count()
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, db: &str, partition: PartitionRef, key: &str) -> Result<Option<Value>, StoreError> {
        let address = (db.to_string(), partition.primary(), key.to_string());
        Ok(self.docs.read().get(&address).cloned())
    }

    fn put(&self, db: &str, partition: PartitionRef, key: &str, doc: Value) -> Result<(), StoreError> {
        event!(Level::TRACE, "Writing {} to {} partition {}", key, db, partition);
        self.docs
            .write()
            .insert((db.to_string(), partition.primary(), key.to_string()), doc);
        Ok(())
    }

    fn range(&self, db: &str, partition: PartitionRef, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let primary = partition.primary();
        let docs = self.docs.read();
        Ok(docs
            .range((db.to_string(), primary, prefix.to_string())..)
            .take_while(|((d, p, k), _)| d == db && *p == primary && k.starts_with(prefix))
            .map(|((_, _, k), v)| (k.clone(), v.clone()))
            .collect())
    }
}
