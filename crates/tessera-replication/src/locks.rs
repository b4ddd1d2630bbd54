//! Record and index-key lock table.
//!
//! Maps every locked [`LockKey`] to the [`RequestId`] that owns it. Batches
//! are taken in the canonical [`LockKey`] order and are all-or-nothing: on the
//! first conflict every lock taken by the attempt is released before backing
//! off, so a waiting transaction never sits on a partial set.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessera_types::{LockKey, NodeId, RequestId};

use crate::error::{ReplicationError, Result};
use crate::retry::BoundedRetry;

/// Result of a single non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLock {
    Acquired,
    /// The caller already owned the key.
    Reentrant,
    Held(RequestId),
}

#[derive(Debug)]
pub struct LockTable {
    entries: DashMap<LockKey, RequestId>,
    retry: BoundedRetry,
    conflicts: AtomicU64,
}

impl LockTable {
    pub fn new(retry: BoundedRetry) -> Self {
        Self {
            entries: DashMap::new(),
            retry,
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn try_lock(&self, key: &LockKey, owner: RequestId) -> TryLock {
        match self.entries.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(owner);
                TryLock::Acquired
            }
            Entry::Occupied(occupied) if *occupied.get() == owner => TryLock::Reentrant,
            Entry::Occupied(occupied) => TryLock::Held(*occupied.get()),
        }
    }

    /// Releases `key` if `owner` holds it. Returns whether anything was released.
    pub fn unlock(&self, key: &LockKey, owner: RequestId) -> bool {
        self.entries
            .remove_if(key, |_, holder| *holder == owner)
            .is_some()
    }

    /// Acquires every key for `owner`, retrying the whole batch with backoff.
    ///
    /// Returns the keys in acquisition order. On failure nothing taken by this
    /// call is held, and the error names the owner of the contended key.
    pub fn acquire_all(&self, keys: &[LockKey], owner: RequestId) -> Result<Vec<LockKey>> {
        let mut ordered = keys.to_vec();
        ordered.sort();
        ordered.dedup();

        self.retry.run(
            |attempt| self.try_acquire_batch(&ordered, owner, attempt),
            ReplicationError::is_retryable,
        )?;
        Ok(ordered)
    }

    fn try_acquire_batch(&self, ordered: &[LockKey], owner: RequestId, attempt: u32) -> Result<()> {
        let mut acquired = Vec::with_capacity(ordered.len());
        for key in ordered {
            match self.try_lock(key, owner) {
                TryLock::Acquired => acquired.push(key),
                TryLock::Reentrant => {}
                TryLock::Held(holder) => {
                    for taken in acquired {
                        self.unlock(taken, owner);
                    }
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        key = %key,
                        owner = %owner,
                        holder = %holder,
                        attempt,
                        "lock conflict"
                    );
                    return Err(locked(key, holder));
                }
            }
        }
        Ok(())
    }

    /// Releases the keys `owner` actually holds. Safe to call more than once.
    pub fn release_all(&self, keys: &[LockKey], owner: RequestId) -> usize {
        keys.iter().filter(|key| self.unlock(key, owner)).count()
    }

    /// Drops every lock held on behalf of requests started by `node`.
    pub fn release_owned_by(&self, node: NodeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, owner| owner.origin() != node);
        before.saturating_sub(self.entries.len())
    }

    pub fn owner(&self, key: &LockKey) -> Option<RequestId> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of batch attempts that hit a held key.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

fn locked(key: &LockKey, owner: RequestId) -> ReplicationError {
    match key {
        LockKey::Record(record) => ReplicationError::RecordLocked {
            record: *record,
            owner,
        },
        LockKey::Key(key) => ReplicationError::KeyLocked {
            key: key.clone(),
            owner,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tessera_types::{ClusterId, IndexKey, RecordId};

    fn record(position: i64) -> LockKey {
        LockKey::Record(RecordId::new(ClusterId::new(3), position))
    }

    fn request(node: u32, seq: u64) -> RequestId {
        RequestId::new(NodeId::new(node), seq)
    }

    fn table(attempts: u32) -> LockTable {
        LockTable::new(BoundedRetry::immediate(attempts))
    }

    #[test]
    fn reentrant_for_same_owner() {
        let locks = table(1);
        assert_eq!(locks.try_lock(&record(1), request(0, 1)), TryLock::Acquired);
        assert_eq!(locks.try_lock(&record(1), request(0, 1)), TryLock::Reentrant);
        assert_eq!(
            locks.try_lock(&record(1), request(0, 2)),
            TryLock::Held(request(0, 1))
        );
    }

    #[test]
    fn unlock_only_by_owner() {
        let locks = table(1);
        locks.try_lock(&record(1), request(0, 1));
        assert!(!locks.unlock(&record(1), request(0, 2)));
        assert_eq!(locks.owner(&record(1)), Some(request(0, 1)));
        assert!(locks.unlock(&record(1), request(0, 1)));
        assert!(!locks.unlock(&record(1), request(0, 1)));
    }

    #[test]
    fn batch_is_sorted_and_deduplicated() {
        let locks = table(1);
        let key = LockKey::Key(IndexKey::new("name", "alice"));
        let acquired = locks
            .acquire_all(&[key.clone(), record(2), record(1), record(2)], request(0, 1))
            .unwrap();
        assert_eq!(acquired, vec![record(1), record(2), key]);
        assert_eq!(locks.len(), 3);
    }

    #[test]
    fn failed_batch_holds_nothing_new() {
        let locks = table(3);
        locks.try_lock(&record(2), request(1, 7));
        locks.try_lock(&record(0), request(0, 1));

        let err = locks
            .acquire_all(&[record(0), record(1), record(2), record(3)], request(0, 1))
            .unwrap_err();
        match err {
            ReplicationError::RecordLocked { owner, .. } => assert_eq!(owner, request(1, 7)),
            other => panic!("unexpected {other:?}"),
        }
        // The pre-existing lock survives; the ones taken by the batch do not.
        assert_eq!(locks.owner(&record(0)), Some(request(0, 1)));
        assert_eq!(locks.owner(&record(1)), None);
        assert_eq!(locks.owner(&record(3)), None);
        assert_eq!(locks.conflicts(), 3);
    }

    #[test]
    fn key_conflicts_report_key_locked() {
        let locks = table(1);
        let key = LockKey::Key(IndexKey::new("email", "a@b"));
        locks.try_lock(&key, request(2, 1));
        assert!(matches!(
            locks.acquire_all(&[key], request(0, 1)),
            Err(ReplicationError::KeyLocked { .. })
        ));
    }

    #[test]
    fn release_all_is_idempotent() {
        let locks = table(1);
        let keys = locks.acquire_all(&[record(1), record(2)], request(0, 1)).unwrap();
        assert_eq!(locks.release_all(&keys, request(0, 1)), 2);
        assert_eq!(locks.release_all(&keys, request(0, 1)), 0);
        assert!(locks.is_empty());
    }

    #[test]
    fn node_failure_releases_its_locks() {
        let locks = table(1);
        locks.try_lock(&record(1), request(4, 1));
        locks.try_lock(&record(2), request(4, 2));
        locks.try_lock(&record(3), request(1, 1));
        assert_eq!(locks.release_owned_by(NodeId::new(4)), 2);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn overlapping_batches_never_deadlock() {
        let locks = Arc::new(LockTable::new(BoundedRetry::new(
            200,
            Duration::from_micros(50),
            Duration::from_millis(2),
        )));
        let start = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [vec![record(1), record(2), record(3)], vec![record(3), record(2), record(1)]]
            .into_iter()
            .enumerate()
            .map(|(i, keys)| {
                let locks = Arc::clone(&locks);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let mut committed = 0;
                    for seq in 0..50 {
                        let owner = request(u32::try_from(i).unwrap(), seq);
                        if let Ok(held) = locks.acquire_all(&keys, owner) {
                            for key in &held {
                                assert_eq!(locks.owner(key), Some(owner));
                            }
                            locks.release_all(&held, owner);
                            committed += 1;
                        }
                    }
                    committed
                })
            })
            .collect();

        let committed: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(committed > 0);
        assert!(locks.is_empty());
    }
}
