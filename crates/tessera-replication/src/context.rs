//! Participant-side transaction contexts.
//!
//! A [`TxContext`] is created when phase 1 starts on a node and is removed
//! exactly once: by phase 2, by expiry, or because the coordinating node went
//! away. Removal from the table is the single point where locks and the
//! sequence promise are given back, so whoever wins the removal finalizes.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tessera_types::{LockKey, NodeId, RequestId, TransactionId};

use crate::locks::LockTable;
use crate::sequence::TransactionSequence;
use crate::task::{Transaction, TxOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Begun,
    Success,
    Failed,
    TimedOut,
    Committing,
    Committed,
    RolledBack,
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Begun => "BEGUN",
            TxStatus::Success => "SUCCESS",
            TxStatus::Failed => "FAILED",
            TxStatus::TimedOut => "TIMEDOUT",
            TxStatus::Committing => "COMMITTING",
            TxStatus::Committed => "COMMITTED",
            TxStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TxContext {
    pub request_id: RequestId,
    pub tx_id: TransactionId,
    pub transaction: Transaction,
    pub status: TxStatus,
    /// What phase 1 answered; replayed on duplicate delivery.
    pub outcome: TxOutcome,
    /// Record and index-key locks held for this transaction.
    pub locks: Vec<LockKey>,
    pub started: Instant,
}

impl TxContext {
    pub fn begin(
        request_id: RequestId,
        tx_id: TransactionId,
        transaction: Transaction,
        locks: Vec<LockKey>,
    ) -> Self {
        Self {
            request_id,
            tx_id,
            transaction,
            status: TxStatus::Begun,
            outcome: TxOutcome::Success,
            locks,
            started: Instant::now(),
        }
    }
}

/// Open contexts of one database, keyed by the phase 1 request.
#[derive(Debug)]
pub struct ContextTable {
    contexts: DashMap<RequestId, TxContext>,
    locks: Arc<LockTable>,
    sequence: Arc<TransactionSequence>,
}

impl ContextTable {
    pub fn new(locks: Arc<LockTable>, sequence: Arc<TransactionSequence>) -> Self {
        Self {
            contexts: DashMap::new(),
            locks,
            sequence,
        }
    }

    /// Registers a new context. Hands it back if the request already has one.
    pub fn insert(&self, context: TxContext) -> Result<(), TxContext> {
        match self.contexts.entry(context.request_id) {
            Entry::Occupied(_) => Err(context),
            Entry::Vacant(vacant) => {
                vacant.insert(context);
                Ok(())
            }
        }
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.contexts.contains_key(&request_id)
    }

    pub fn outcome(&self, request_id: RequestId) -> Option<TxOutcome> {
        self.contexts
            .get(&request_id)
            .map(|context| context.outcome.clone())
    }

    pub fn status(&self, request_id: RequestId) -> Option<TxStatus> {
        self.contexts.get(&request_id).map(|context| context.status)
    }

    /// Records the phase 1 result. The status follows from the outcome.
    pub fn record_outcome(&self, request_id: RequestId, outcome: TxOutcome) -> bool {
        let Some(mut context) = self.contexts.get_mut(&request_id) else {
            return false;
        };
        context.status = if outcome.is_success() {
            TxStatus::Success
        } else if outcome.is_lock_timeout() {
            TxStatus::TimedOut
        } else {
            TxStatus::Failed
        };
        context.outcome = outcome;
        true
    }

    pub fn set_status(&self, request_id: RequestId, status: TxStatus) -> bool {
        self.contexts
            .get_mut(&request_id)
            .map(|mut context| context.status = status)
            .is_some()
    }

    /// Removes the context without finalizing it. The caller must pass it to
    /// [`ContextTable::finish`].
    pub fn take(&self, request_id: RequestId) -> Option<TxContext> {
        self.contexts.remove(&request_id).map(|(_, context)| context)
    }

    /// Gives back the locks and sequence promise of a removed context.
    pub fn finish(&self, context: &TxContext, committed: bool) {
        self.locks.release_all(&context.locks, context.request_id);
        if committed {
            self.sequence.notify_success(context.tx_id, context.request_id);
        } else {
            self.sequence.notify_failure(context.tx_id, context.request_id);
        }
    }

    /// Removes and rolls back a context.
    pub fn destroy(&self, request_id: RequestId) -> Option<TxContext> {
        let mut context = self.take(request_id)?;
        self.finish(&context, false);
        context.status = TxStatus::RolledBack;
        Some(context)
    }

    /// Rolls back every context whose phase 1 came from `node`.
    pub fn destroy_owned_by(&self, node: NodeId) -> usize {
        self.destroy_matching(|context| context.request_id.origin() == node)
    }

    /// Rolls back contexts older than `timeout`; their coordinator never sent phase 2.
    pub fn expire(&self, timeout: Duration, now: Instant) -> usize {
        self.destroy_matching(|context| now.saturating_duration_since(context.started) >= timeout)
    }

    fn destroy_matching(&self, predicate: impl Fn(&TxContext) -> bool) -> usize {
        let doomed: Vec<RequestId> = self
            .contexts
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();
        doomed
            .into_iter()
            .filter_map(|request_id| self.destroy(request_id))
            .inspect(|context| {
                tracing::warn!(
                    request = %context.request_id,
                    tx = %context.tx_id,
                    locks = context.locks.len(),
                    "destroyed transaction context"
                );
            })
            .count()
    }

    pub fn clear(&self) -> usize {
        self.destroy_matching(|_| true)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BoundedRetry;
    use tessera_types::{ClusterId, RecordId};

    struct Fixture {
        locks: Arc<LockTable>,
        sequence: Arc<TransactionSequence>,
        contexts: ContextTable,
    }

    fn fixture() -> Fixture {
        let locks = Arc::new(LockTable::new(BoundedRetry::immediate(1)));
        let sequence = Arc::new(TransactionSequence::new(4, 0));
        let contexts = ContextTable::new(Arc::clone(&locks), Arc::clone(&sequence));
        Fixture {
            locks,
            sequence,
            contexts,
        }
    }

    fn open(f: &Fixture, node: u32, seq: u64) -> RequestId {
        let request_id = RequestId::new(NodeId::new(node), seq);
        let tx_id = TransactionId::new(u32::try_from(seq).unwrap(), 1);
        f.sequence.validate(tx_id, request_id).unwrap();
        let key = LockKey::Record(RecordId::new(ClusterId::new(1), i64::try_from(seq).unwrap()));
        let locks = f.locks.acquire_all(&[key], request_id).unwrap();
        f.contexts
            .insert(TxContext::begin(request_id, tx_id, Transaction::new(), locks))
            .unwrap();
        request_id
    }

    #[test]
    fn one_context_per_request() {
        let f = fixture();
        let request_id = open(&f, 0, 1);
        let duplicate = TxContext::begin(
            request_id,
            TransactionId::new(1, 1),
            Transaction::new(),
            Vec::new(),
        );
        assert!(f.contexts.insert(duplicate).is_err());
        assert_eq!(f.contexts.len(), 1);
    }

    #[test]
    fn outcome_drives_status() {
        let f = fixture();
        let request_id = open(&f, 0, 1);
        assert_eq!(f.contexts.status(request_id), Some(TxStatus::Begun));
        f.contexts
            .record_outcome(request_id, TxOutcome::Failed("disk".into()));
        assert_eq!(f.contexts.status(request_id), Some(TxStatus::Failed));
        assert_eq!(
            f.contexts.outcome(request_id),
            Some(TxOutcome::Failed("disk".into()))
        );
    }

    #[test]
    fn destroy_releases_locks_and_promise_once() {
        let f = fixture();
        let request_id = open(&f, 0, 1);
        assert_eq!(f.locks.len(), 1);
        assert_eq!(f.sequence.promised(), 1);

        let destroyed = f.contexts.destroy(request_id).unwrap();
        assert_eq!(destroyed.status, TxStatus::RolledBack);
        assert!(f.locks.is_empty());
        assert_eq!(f.sequence.promised(), 0);
        assert!(f.contexts.destroy(request_id).is_none());
    }

    #[test]
    fn finish_committed_advances_sequence() {
        let f = fixture();
        let request_id = open(&f, 0, 2);
        let context = f.contexts.take(request_id).unwrap();
        f.contexts.finish(&context, true);
        assert_eq!(f.sequence.committed(2), Some(1));
        assert!(f.locks.is_empty());
    }

    #[test]
    fn node_loss_destroys_its_contexts() {
        let f = fixture();
        open(&f, 3, 1);
        open(&f, 3, 2);
        let survivor = open(&f, 1, 3);
        assert_eq!(f.contexts.destroy_owned_by(NodeId::new(3)), 2);
        assert!(f.contexts.contains(survivor));
        assert_eq!(f.locks.len(), 1);
    }

    #[test]
    fn expiry_only_hits_old_contexts() {
        let f = fixture();
        open(&f, 0, 1);
        assert_eq!(f.contexts.expire(Duration::from_secs(60), Instant::now()), 0);
        assert_eq!(
            f.contexts
                .expire(Duration::from_secs(60), Instant::now() + Duration::from_secs(61)),
            1
        );
        assert!(f.contexts.is_empty());
    }
}
