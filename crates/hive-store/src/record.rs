//! Versioned records and the store contract.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use parking_lot::RwLock;

use crate::error::StoreError;

/// A record and the version it was read at.
///
/// Versions start at 1 on insert and grow by one on every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<V> {
    /// Write counter.
    pub version: u64,
    /// The record.
    pub record: V,
}

/// Keyed storage with conditional writes.
///
/// Implementations run `on_commit` after the write is decided but before it
/// becomes visible to the next writer of the same key, so anything published
/// from it is ordered with the record's versions.
pub trait RecordStore<K, V>: Send + Sync {
    /// Read one record.
    fn get(&self, key: &K) -> Option<Versioned<V>>;

    /// Read every record. Order is unspecified.
    fn list(&self) -> Vec<Versioned<V>>;

    /// Insert a record that must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the key is taken.
    fn insert(
        &self,
        key: K,
        record: V,
        on_commit: &dyn Fn(&Versioned<V>),
    ) -> Result<Versioned<V>, StoreError>;

    /// Replace a record if it is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent and `VersionMismatch` if
    /// another writer got there first.
    fn replace(
        &self,
        key: &K,
        expected_version: u64,
        record: V,
        on_commit: &dyn Fn(&Versioned<V>),
    ) -> Result<Versioned<V>, StoreError>;

    /// Number of records.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store backed by a `HashMap`.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    records: RwLock<HashMap<K, Versioned<V>>>,
}

impl<K, V> MemoryStore<K, V> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> RecordStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.records.read().get(key).cloned()
    }

    fn list(&self) -> Vec<Versioned<V>> {
        self.records.read().values().cloned().collect()
    }

    fn insert(
        &self,
        key: K,
        record: V,
        on_commit: &dyn Fn(&Versioned<V>),
    ) -> Result<Versioned<V>, StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        let stored = Versioned { version: 1, record };
        on_commit(&stored);
        records.insert(key, stored.clone());
        Ok(stored)
    }

    fn replace(
        &self,
        key: &K,
        expected_version: u64,
        record: V,
        on_commit: &dyn Fn(&Versioned<V>),
    ) -> Result<Versioned<V>, StoreError> {
        let mut records = self.records.write();
        let slot = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if slot.version != expected_version {
            return Err(StoreError::VersionMismatch {
                key: key.to_string(),
                expected: expected_version,
                actual: slot.version,
            });
        }
        let stored = Versioned {
            version: expected_version + 1,
            record,
        };
        on_commit(&stored);
        *slot = stored.clone();
        Ok(stored)
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}
