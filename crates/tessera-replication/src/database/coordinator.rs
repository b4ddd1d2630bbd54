//! Two-phase commit driver.
//!
//! ```text
//! coordinator                         replicas
//!   next_id, assign positions
//!   phase 1 locally ──────────────┐
//!   Phase1 ─────────────────────► validate + lock, keep context
//!           ◄──────────────────── outcome
//!   quorum group?
//!     success  ── Phase2(confirm) ─► apply, release
//!     failure  ── Phase2(cancel)  ─► release
//!     none     ── Phase2(cancel)  ─► release, retry if contention
//! ```

use std::collections::BTreeSet;
use std::time::Instant;

use tessera_types::{ClusterId, NodeName, RecordId, RequestId, TransactionId};

use crate::context::TxStatus;
use crate::error::{ReplicationError, Result};
use crate::task::{Phase1Task, Phase2Task, Task, TaskResponse, Transaction, TxOutcome};

use super::DatabaseCore;

/// What a successful commit reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx_id: TransactionId,
    /// Phase 1 request of the attempt that committed.
    pub request_id: RequestId,
    /// Persistent ids of the records the transaction created, in operation order.
    pub created: Vec<RecordId>,
    pub attempts: u32,
    /// Replicas that did not confirm; their records were queued for repair.
    pub lagging: BTreeSet<NodeName>,
}

impl DatabaseCore {
    pub(crate) fn commit(&self, transaction: Transaction) -> Result<CommitReceipt> {
        self.ensure_online()?;
        let started = Instant::now();
        let mut attempts = 0;
        let result = self.tx_retry.run(
            |attempt| {
                attempts = attempt + 1;
                self.attempt_commit(&transaction)
            },
            ReplicationError::is_retryable,
        );
        if attempts > 1 {
            self.metrics.add_retries(u64::from(attempts - 1));
        }

        match result {
            Ok(mut receipt) => {
                receipt.attempts = attempts;
                self.metrics.increment_committed();
                self.metrics.record_commit_latency(started.elapsed());
                Ok(receipt)
            }
            Err(err) => {
                self.metrics.increment_rolled_back();
                if err.is_quorum_failure() {
                    self.metrics.increment_quorum_failures();
                }
                tracing::debug!(database = %self.name, attempts, error = %err, "transaction failed");
                Err(err)
            }
        }
    }

    fn attempt_commit(&self, transaction: &Transaction) -> Result<CommitReceipt> {
        let request_id = self.next_request_id();
        let tx_id = self
            .sequence
            .next_id(request_id)
            .ok_or(ReplicationError::SequenceExhausted)?;

        let assigned = transaction
            .assign_positions(|cluster| self.storage_call(|storage| storage.next_position(cluster)));
        let (transaction, created) = match assigned {
            Ok(assigned) => assigned,
            Err(err) => {
                self.sequence.notify_failure(tx_id, request_id);
                return Err(err);
            }
        };
        let clusters = transaction.clusters();
        let records = transaction.records();
        let task = Phase1Task { tx_id, transaction };

        let outcome = match self.phase1(request_id, &task) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.sequence.notify_failure(tx_id, request_id);
                return Err(err);
            }
        };
        // Neither of these leaves a context behind.
        if outcome.is_lock_timeout() || matches!(outcome, TxOutcome::InvalidSequential { .. }) {
            return Err(outcome.into_error(request_id, &self.local));
        }

        let replicas: Vec<NodeName> = self
            .replicas_for(&clusters)
            .into_iter()
            .filter(|node| *node != self.local)
            .collect();
        let mut receipt = CommitReceipt {
            tx_id,
            request_id,
            created,
            attempts: 1,
            lagging: BTreeSet::new(),
        };

        if replicas.is_empty() {
            let success = outcome.is_success();
            self.phase2(&phase2_task(tx_id, request_id, success, &clusters))?;
            return if success {
                Ok(receipt)
            } else {
                Err(outcome.into_error(request_id, &self.local))
            };
        }

        self.contexts.set_status(request_id, TxStatus::Committing);
        let dispatched = match self.send_and_collect(
            replicas.iter().cloned(),
            Task::Phase1(task),
            request_id,
            Some(TaskResponse::Phase1(outcome)),
        ) {
            Ok(dispatched) => dispatched,
            Err(err) => {
                self.phase2(&phase2_task(tx_id, request_id, false, &clusters))?;
                return Err(err);
            }
        };
        let snapshot = dispatched.collector.snapshot();

        match snapshot.quorum_group {
            Some(group) if group.response.is_positive() => {
                let failed = self.finish_remote(&replicas, tx_id, request_id, true, &clusters);
                self.phase2(&phase2_task(tx_id, request_id, true, &clusters))?;

                receipt.lagging = replicas
                    .iter()
                    .filter(|node| !group.nodes.contains(*node))
                    .cloned()
                    .chain(failed)
                    .chain(dispatched.unreachable)
                    .collect();
                if !receipt.lagging.is_empty() {
                    let queued = self.repair.enqueue_records(records);
                    tracing::info!(
                        tx = %tx_id,
                        request = %request_id,
                        lagging = ?receipt.lagging,
                        queued,
                        "committed with lagging replicas"
                    );
                }
                Ok(receipt)
            }
            Some(group) => {
                self.abort(&replicas, tx_id, request_id, &clusters)?;
                let node = group.nodes.iter().next().cloned().unwrap_or_else(|| self.local.clone());
                Err(match group.response {
                    TaskResponse::Phase1(outcome) => outcome.into_error(request_id, &node),
                    other => ReplicationError::Remote {
                        request: request_id,
                        node,
                        message: other.to_string(),
                    },
                })
            }
            None => {
                self.abort(&replicas, tx_id, request_id, &clusters)?;
                let contention = snapshot
                    .responses
                    .iter()
                    .filter_map(|(node, response)| match response {
                        TaskResponse::Phase1(outcome) => Some((retry_priority(outcome)?, node, outcome)),
                        _ => None,
                    })
                    .min_by_key(|(priority, _, _)| *priority);
                if let Some((_, node, outcome)) = contention {
                    return Err(outcome.clone().into_error(request_id, node));
                }
                self.repair.enqueue_records(records);
                Err(ReplicationError::QuorumNotReached {
                    request: request_id,
                    quorum: snapshot.quorum,
                    responses: snapshot.describe(),
                })
            }
        }
    }

    /// Cancels the transaction on every replica and locally.
    fn abort(
        &self,
        replicas: &[NodeName],
        tx_id: TransactionId,
        request_id: RequestId,
        clusters: &[ClusterId],
    ) -> Result<()> {
        self.finish_remote(replicas, tx_id, request_id, false, clusters);
        self.phase2(&phase2_task(tx_id, request_id, false, clusters))?;
        Ok(())
    }

    /// Sends phase 2 to the replicas. Returns the ones it could not reach.
    fn finish_remote(
        &self,
        replicas: &[NodeName],
        tx_id: TransactionId,
        request_id: RequestId,
        success: bool,
        clusters: &[ClusterId],
    ) -> Vec<NodeName> {
        let task = Task::Phase2(phase2_task(tx_id, request_id, success, clusters));
        self.send_oneway(replicas.iter().cloned(), &task, self.next_request_id())
    }
}

fn phase2_task(
    tx_id: TransactionId,
    phase1_request: RequestId,
    success: bool,
    clusters: &[ClusterId],
) -> Phase2Task {
    Phase2Task {
        tx_id,
        phase1_request,
        success,
        clusters: clusters.to_vec(),
    }
}

/// Which failed-quorum outcome to surface, lowest first. `None` for outcomes
/// a retry cannot change.
fn retry_priority(outcome: &TxOutcome) -> Option<u8> {
    match outcome {
        TxOutcome::RecordLocked { .. } | TxOutcome::KeyLocked { .. } => Some(0),
        TxOutcome::ConcurrentCreate { .. } => Some(1),
        TxOutcome::InvalidSequential { .. } => Some(2),
        TxOutcome::ConcurrentModification { .. } => Some(3),
        TxOutcome::Success | TxOutcome::UniqueIndex { .. } | TxOutcome::Failed(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{ClusterId, IndexKey, NodeId, Version};

    fn rid(position: i64) -> RecordId {
        RecordId::new(ClusterId::new(1), position)
    }

    #[test]
    fn contention_outranks_conflicts() {
        let owner = RequestId::new(NodeId::new(1), 1);
        let locked = TxOutcome::RecordLocked { record: rid(0), owner };
        let created = TxOutcome::ConcurrentCreate {
            expected: rid(1),
            actual: rid(2),
        };
        let modified = TxOutcome::ConcurrentModification {
            record: rid(0),
            expected: Version::new(1),
            actual: Version::new(2),
        };
        assert!(retry_priority(&locked) < retry_priority(&created));
        assert!(retry_priority(&created) < retry_priority(&modified));
    }

    #[test]
    fn unique_violations_are_not_retried() {
        let outcome = TxOutcome::UniqueIndex {
            key: IndexKey::new("email", "a@b"),
            existing: rid(0),
            record: rid(1),
        };
        assert_eq!(retry_priority(&outcome), None);
        assert_eq!(retry_priority(&TxOutcome::Success), None);
    }
}
