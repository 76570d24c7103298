//! In-memory key-value storage owned by a node.
//!
//! The store holds no durable state. Every mutation a node accepts is first
//! written to its [`WriteAheadLog`](crate::wal::WriteAheadLog), and the store
//! can always be rebuilt by replaying that log.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Destination for replayed log records.
///
/// [`WriteAheadLog::replay`](crate::wal::WriteAheadLog::replay) drives any
/// implementation of this trait, applying records in file order.
pub trait ReplayTarget {
    fn put(&self, key: String, value: String);
    fn remove(&self, key: &str) -> bool;
}

/// Thread-safe key-value store.
///
/// Backed by a sharded [`DashMap`]: operations on keys in different shards
/// never contend, and each `put`, `get`, or `remove` is atomic with respect
/// to the others. There is no cross-key atomicity and no snapshot isolation
/// beyond what [`KvStore::snapshot`] copies out.
#[derive(Debug, Default)]
pub struct KvStore {
    data: DashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Returns a copy of the current value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Erases `key`. Returns `true` if a mapping existed.
    pub fn remove(&self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies all pairs into an ordered map.
    ///
    /// Shards are visited one at a time, so writes racing with the copy may
    /// or may not be included.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl ReplayTarget for KvStore {
    fn put(&self, key: String, value: String) {
        KvStore::put(self, key, value);
    }

    fn remove(&self, key: &str) -> bool {
        KvStore::remove(self, key)
    }
}
