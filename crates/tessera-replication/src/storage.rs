//! Local storage collaborator.
//!
//! The replication core never touches pages or logs. It reads records, asks
//! for the next free position of a cluster, looks up unique index keys, and
//! applies batches of writes that must land atomically. [`MemoryStorage`] is
//! the in-process implementation used by tests and the simulator.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tessera_types::{ClusterId, IndexKey, RawRecord, RecordId};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Faults raised by the storage engine. All of them are fatal to the database.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StorageError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("storage corrupted: {0}")]
    Corrupted(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

/// One change in an atomic write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageWrite {
    /// Stores `value` at `record`, replacing any previous value.
    Put { record: RecordId, value: RawRecord },
    Remove { record: RecordId },
    IndexPut { key: IndexKey, record: RecordId },
    IndexRemove { key: IndexKey },
}

pub trait Storage: Send + Sync {
    fn read(&self, record: RecordId) -> StorageResult<Option<RawRecord>>;

    /// Position the next record created in `cluster` will occupy.
    fn next_position(&self, cluster: ClusterId) -> StorageResult<i64>;

    /// Highest position holding a record, if the cluster has any.
    fn highest_position(&self, cluster: ClusterId) -> StorageResult<Option<i64>>;

    fn index_lookup(&self, key: &IndexKey) -> StorageResult<Option<RecordId>>;

    /// Applies every write or none of them.
    fn apply(&self, writes: &[StorageWrite]) -> StorageResult<()>;
}

// ============================================================================
// In-memory Storage
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<RecordId, RawRecord>,
    next_positions: BTreeMap<ClusterId, i64>,
    indexes: BTreeMap<IndexKey, RecordId>,
}

/// Storage backed by ordered maps, with fault injection for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    injected_fault: Mutex<Option<StorageError>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record directly, bypassing replication. Used to seed replicas.
    pub fn insert(&self, record: RecordId, value: RawRecord) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::put(&mut state, record, value);
    }

    /// Removes a record directly, bypassing replication.
    pub fn remove(&self, record: RecordId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.records.remove(&record);
    }

    /// Every record, for comparing replicas.
    pub fn records(&self) -> BTreeMap<RecordId, RawRecord> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }

    /// The next `apply` fails with `fault` and changes nothing.
    pub fn fail_next_apply(&self, fault: StorageError) {
        *self
            .injected_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    fn put(state: &mut MemoryState, record: RecordId, value: RawRecord) {
        let next = state.next_positions.entry(record.cluster()).or_insert(0);
        if record.position() >= *next {
            *next = record.position() + 1;
        }
        state.records.insert(record, value);
    }
}

impl Storage for MemoryStorage {
    fn read(&self, record: RecordId) -> StorageResult<Option<RawRecord>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.records.get(&record).cloned())
    }

    fn next_position(&self, cluster: ClusterId) -> StorageResult<i64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.next_positions.get(&cluster).copied().unwrap_or(0))
    }

    fn highest_position(&self, cluster: ClusterId) -> StorageResult<Option<i64>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let range = RecordId::new(cluster, 0)..=RecordId::new(cluster, i64::MAX);
        Ok(state
            .records
            .range(range)
            .next_back()
            .map(|(rid, _)| rid.position()))
    }

    fn index_lookup(&self, key: &IndexKey) -> StorageResult<Option<RecordId>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.indexes.get(key).copied())
    }

    fn apply(&self, writes: &[StorageWrite]) -> StorageResult<()> {
        if let Some(fault) = self
            .injected_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(fault);
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for write in writes {
            match write {
                StorageWrite::Put { record, value } => Self::put(&mut state, *record, value.clone()),
                StorageWrite::Remove { record } => {
                    state.records.remove(record);
                }
                StorageWrite::IndexPut { key, record } => {
                    state.indexes.insert(key.clone(), *record);
                }
                StorageWrite::IndexRemove { key } => {
                    state.indexes.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::Version;

    fn rid(cluster: u32, position: i64) -> RecordId {
        RecordId::new(ClusterId::new(cluster), position)
    }

    #[test]
    fn put_advances_next_position() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.next_position(ClusterId::new(1)).unwrap(), 0);

        storage.insert(rid(1, 4), RawRecord::new("x", Version::INITIAL));
        assert_eq!(storage.next_position(ClusterId::new(1)).unwrap(), 5);
        assert_eq!(storage.next_position(ClusterId::new(2)).unwrap(), 0);
    }

    #[test]
    fn highest_position_ignores_other_clusters() {
        let storage = MemoryStorage::new();
        storage.insert(rid(1, 0), RawRecord::new("a", Version::INITIAL));
        storage.insert(rid(1, 3), RawRecord::new("b", Version::INITIAL));
        storage.insert(rid(2, 9), RawRecord::new("c", Version::INITIAL));

        assert_eq!(storage.highest_position(ClusterId::new(1)).unwrap(), Some(3));
        assert_eq!(storage.highest_position(ClusterId::new(3)).unwrap(), None);
    }

    #[test]
    fn deleting_keeps_position_allocated() {
        let storage = MemoryStorage::new();
        storage.insert(rid(1, 0), RawRecord::new("a", Version::INITIAL));
        storage
            .apply(&[StorageWrite::Remove { record: rid(1, 0) }])
            .unwrap();
        assert_eq!(storage.read(rid(1, 0)).unwrap(), None);
        assert_eq!(storage.next_position(ClusterId::new(1)).unwrap(), 1);
    }

    #[test]
    fn injected_fault_applies_nothing() {
        let storage = MemoryStorage::new();
        storage.fail_next_apply(StorageError::ResourceExhausted("disk full".into()));

        let writes = [
            StorageWrite::Put {
                record: rid(1, 0),
                value: RawRecord::new("a", Version::INITIAL),
            },
            StorageWrite::IndexPut {
                key: IndexKey::new("name", "a"),
                record: rid(1, 0),
            },
        ];
        assert!(storage.apply(&writes).is_err());
        assert!(storage.records().is_empty());

        // The fault is one-shot.
        storage.apply(&writes).unwrap();
        assert_eq!(
            storage.index_lookup(&IndexKey::new("name", "a")).unwrap(),
            Some(rid(1, 0))
        );
    }
}
