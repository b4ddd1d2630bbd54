//! Executing inbound tasks against local storage.

use std::collections::{BTreeMap, BTreeSet};

use tessera_types::{ClusterId, IndexKey, LockKey, RawRecord, RecordId, RequestId};

use crate::context::{TxContext, TxStatus};
use crate::error::{ReplicationError, Result};
use crate::sequence::SequenceStatus;
use crate::task::{
    IndexOp, Phase1Task, Phase2Task, RecordOperation, RecordWrite, RepairClusterTask,
    RequestEnvelope, Task, TaskResponse, Transaction, TxOutcome,
};

use super::DatabaseCore;

impl DatabaseCore {
    pub(crate) fn execute_task(&self, request: &RequestEnvelope) -> Result<TaskResponse> {
        let request_id = request.request_id;
        match &request.task {
            Task::Write(write) => {
                self.apply_fixes(request_id, std::slice::from_ref(write))?;
                Ok(TaskResponse::Ack)
            }
            Task::Read(read) => self.read_records(&read.records).map(TaskResponse::Records),
            Task::Phase1(phase1) => self.phase1(request_id, phase1).map(TaskResponse::Phase1),
            Task::Phase2(phase2) => self
                .phase2(phase2)
                .map(|applied| TaskResponse::Phase2 { applied }),
            Task::ClusterRepairInfo(cluster) => self
                .storage_call(|storage| storage.highest_position(*cluster))
                .map(TaskResponse::ClusterTail),
            Task::RepairCluster(repair) => self
                .repair_cluster_locally(request_id, repair)
                .map(|applied| TaskResponse::Fixed { applied }),
            Task::RepairRecord(fix) => self
                .apply_fixes(request_id, &fix.operations)
                .map(|applied| TaskResponse::Fixed { applied }),
            Task::Heartbeat => Ok(TaskResponse::Ack),
        }
    }

    // ========================================================================
    // Phase 1
    // ========================================================================

    /// Validates and locks a transaction, leaving a context behind for phase 2.
    ///
    /// Redelivery of the same request answers with the stored outcome and
    /// changes nothing. Once that request has committed here it answers
    /// success without locking or validating again. When the locks cannot be
    /// taken no context is created and the sequence promise is given back.
    pub(crate) fn phase1(&self, request_id: RequestId, task: &Phase1Task) -> Result<TxOutcome> {
        if let Some(outcome) = self.contexts.outcome(request_id) {
            tracing::debug!(request = %request_id, tx = %task.tx_id, "replaying phase 1 outcome");
            return Ok(outcome);
        }

        match self.sequence.validate(task.tx_id, request_id) {
            Ok(()) => {}
            Err(SequenceStatus::AlreadyPresent)
                if self.sequence.committed_by(task.tx_id) == Some(request_id) =>
            {
                tracing::debug!(request = %request_id, tx = %task.tx_id, "phase 1 of a committed transaction");
                return Ok(TxOutcome::Success);
            }
            Err(status) => {
                tracing::debug!(
                    request = %request_id,
                    tx = %task.tx_id,
                    status = ?status,
                    "transaction out of sequence"
                );
                return Ok(TxOutcome::InvalidSequential { tx: task.tx_id });
            }
        }

        let keys = task.transaction.lock_keys();
        let locked = match self.locks.acquire_all(&keys, request_id) {
            Ok(locked) => locked,
            Err(err) => {
                self.sequence.notify_failure(task.tx_id, request_id);
                return match err {
                    ReplicationError::RecordLocked { record, owner } => {
                        Ok(TxOutcome::RecordLocked { record, owner })
                    }
                    ReplicationError::KeyLocked { key, owner } => Ok(TxOutcome::KeyLocked { key, owner }),
                    other => Err(other),
                };
            }
        };

        let context = TxContext::begin(request_id, task.tx_id, task.transaction.clone(), locked);
        if self.contexts.insert(context).is_err() {
            return Ok(self.contexts.outcome(request_id).unwrap_or(TxOutcome::Success));
        }

        let outcome = match self.validate(&task.transaction) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.contexts.destroy(request_id);
                return Err(err);
            }
        };
        if !outcome.is_success() {
            tracing::debug!(request = %request_id, tx = %task.tx_id, outcome = %outcome, "phase 1 rejected");
        }
        self.contexts.record_outcome(request_id, outcome.clone());
        Ok(outcome)
    }

    /// Checks a locked transaction against local storage.
    fn validate(&self, transaction: &Transaction) -> Result<TxOutcome> {
        let mut offsets: BTreeMap<ClusterId, i64> = BTreeMap::new();
        for operation in &transaction.operations {
            match operation {
                RecordOperation::Create { record, .. } => {
                    let cluster = record.cluster();
                    let next = self.storage_call(|storage| storage.next_position(cluster))?;
                    let offset = offsets.entry(cluster).or_insert(0);
                    let expected = RecordId::new(cluster, next + *offset);
                    *offset += 1;
                    let occupied = self.storage_call(|storage| storage.read(*record))?.is_some();
                    if *record != expected || occupied {
                        return Ok(TxOutcome::ConcurrentCreate {
                            expected: *record,
                            actual: expected,
                        });
                    }
                }
                RecordOperation::Update { record, version, .. }
                | RecordOperation::Delete { record, version } => {
                    let actual = self
                        .storage_call(|storage| storage.read(*record))?
                        .map(|current| current.version)
                        .unwrap_or_default();
                    if actual != *version {
                        return Ok(TxOutcome::ConcurrentModification {
                            record: *record,
                            expected: *version,
                            actual,
                        });
                    }
                }
            }
        }

        let released: BTreeSet<&IndexKey> = transaction
            .index_changes
            .iter()
            .filter(|change| change.op == IndexOp::Remove)
            .map(|change| &change.key)
            .collect();
        let mut claimed: BTreeMap<&IndexKey, RecordId> = BTreeMap::new();
        for change in transaction.index_changes.iter().filter(|c| c.op == IndexOp::Put) {
            if let Some(previous) = claimed.insert(&change.key, change.record)
                && previous != change.record
            {
                return Ok(TxOutcome::UniqueIndex {
                    key: change.key.clone(),
                    existing: previous,
                    record: change.record,
                });
            }
            if released.contains(&change.key) {
                continue;
            }
            if let Some(existing) = self.storage_call(|storage| storage.index_lookup(&change.key))?
                && existing != change.record
            {
                return Ok(TxOutcome::UniqueIndex {
                    key: change.key.clone(),
                    existing,
                    record: change.record,
                });
            }
        }
        Ok(TxOutcome::Success)
    }

    // ========================================================================
    // Phase 2
    // ========================================================================

    /// Confirms or cancels the context of a phase 1 request. Returns whether
    /// writes were applied here.
    ///
    /// A confirm for a context that failed phase 1 here still advances the
    /// sequence; this replica stays behind until repair catches it up. A
    /// confirm without any context means phase 1 never arrived.
    pub(crate) fn phase2(&self, task: &Phase2Task) -> Result<bool> {
        let Some(mut context) = self.contexts.take(task.phase1_request) else {
            if task.success {
                self.sequence.force_commit(task.tx_id, task.phase1_request);
                tracing::debug!(
                    request = %task.phase1_request,
                    tx = %task.tx_id,
                    "confirmed transaction never reached phase 1 here"
                );
            }
            return Ok(false);
        };

        if !task.success {
            self.contexts.finish(&context, false);
            tracing::debug!(request = %context.request_id, tx = %context.tx_id, "transaction rolled back");
            return Ok(false);
        }

        if !context.outcome.is_success() {
            self.contexts.finish(&context, true);
            tracing::info!(
                request = %context.request_id,
                tx = %context.tx_id,
                outcome = %context.outcome,
                "transaction committed elsewhere but failed here"
            );
            return Ok(false);
        }

        let writes = context.transaction.writes();
        if let Err(err) = self.storage_call(|storage| storage.apply(&writes)) {
            self.contexts.finish(&context, false);
            return Err(err);
        }
        context.status = TxStatus::Committed;
        self.contexts.finish(&context, true);
        tracing::trace!(request = %context.request_id, tx = %context.tx_id, status = %context.status, "transaction applied");
        Ok(true)
    }

    // ========================================================================
    // Reads and corrective writes
    // ========================================================================

    pub(crate) fn read_records(&self, records: &[RecordId]) -> Result<Vec<Option<RawRecord>>> {
        records
            .iter()
            .map(|record| self.storage_call(|storage| storage.read(*record)))
            .collect()
    }

    /// Applies corrective writes under locks owned by `owner`.
    pub(crate) fn apply_fixes(&self, owner: RequestId, writes: &[RecordWrite]) -> Result<usize> {
        let keys: Vec<LockKey> = writes.iter().map(|w| LockKey::from(w.record())).collect();
        let locked = self.locks.acquire_all(&keys, owner)?;
        let applied = self.apply_writes(writes);
        self.locks.release_all(&locked, owner);
        applied
    }

    /// Applies writes one by one. If one fails, the ones already applied are
    /// undone in reverse order.
    pub(crate) fn apply_writes(&self, writes: &[RecordWrite]) -> Result<usize> {
        let mut undo: Vec<RecordWrite> = Vec::with_capacity(writes.len());
        for write in writes {
            let step = self
                .storage_call(|storage| storage.read(write.record()))
                .and_then(|prior| {
                    self.storage_call(|storage| storage.apply(&[write.storage_write()]))?;
                    Ok(prior)
                });
            match step {
                Ok(prior) => undo.extend(write.compute_undo(prior)),
                Err(err) => {
                    for reverse in undo.iter().rev() {
                        tracing::warn!(record = %reverse.record(), undo = ?reverse, "undoing corrective write");
                        if let Err(fault) = self.storage.apply(&[reverse.storage_write()]) {
                            tracing::error!(record = %reverse.record(), error = %fault, "undo failed");
                            break;
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(writes.len())
    }

    /// Creates the records of a cluster-repair chunk that are missing here.
    /// Records already present are left alone.
    fn repair_cluster_locally(&self, owner: RequestId, task: &RepairClusterTask) -> Result<usize> {
        let mut missing = Vec::new();
        for (record, value) in &task.records {
            if record.cluster() != task.cluster {
                continue;
            }
            if self.storage_call(|storage| storage.read(*record))?.is_none() {
                missing.push(RecordWrite::Create {
                    record: *record,
                    value: value.clone(),
                });
            }
        }
        if missing.is_empty() {
            return Ok(0);
        }
        self.apply_fixes(owner, &missing)
    }
}
