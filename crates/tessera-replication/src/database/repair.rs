//! Repair cycles.
//!
//! A cycle first checks the queued clusters this node owns, or stands in for
//! while their owner is unreachable, copying records missing at the tail of
//! lagging replicas. It then takes a batch of queued records, reads every
//! replica, lets the resolver chain pick the winning value and sends
//! corrective writes to the replicas that disagree. Anything that could not
//! be settled goes back on the queue for the next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tessera_types::{ClusterId, LockKey, NodeName, RawRecord, RecordId};

use crate::error::Result;
use crate::locks::TryLock;
use crate::repair::{Candidate, ResolveContext};
use crate::task::{FixTask, ReadRecords, RecordWrite, RepairClusterTask, Task, TaskResponse};

use super::DatabaseCore;

/// Summary of one repair cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub clusters_checked: usize,
    pub clusters_repaired: usize,
    pub records_checked: usize,
    pub records_repaired: usize,
    /// Records put back on the queue.
    pub records_pending: usize,
}

/// Result of repairing the records that share one replica set.
#[derive(Debug, Default)]
struct GroupOutcome {
    repaired: usize,
    pending: Vec<RecordId>,
}

impl DatabaseCore {
    pub(crate) fn run_repair_cycle(&self) -> Result<RepairReport> {
        self.ensure_online()?;
        let started = Instant::now();
        let batch = self.config.repair.batch_size.max(1);
        let mut report = RepairReport::default();

        for cluster in self.repair.take_clusters(batch) {
            report.clusters_checked += 1;
            match self.repair_cluster(cluster) {
                Ok(true) => {
                    report.clusters_repaired += 1;
                    self.metrics.increment_clusters_repaired();
                }
                Ok(false) => {}
                Err(err) => {
                    self.repair.enqueue_cluster(cluster);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    tracing::warn!(cluster = %cluster, error = %err, "cluster repair failed");
                }
            }
        }

        let records = self.repair.take_records(batch);
        if !records.is_empty() {
            report.records_checked = records.len();
            let outcome = self.repair_records(&records)?;
            report.records_repaired = outcome.repaired;
            report.records_pending = outcome.pending.len();
        }

        self.metrics.record_repair_cycle(started.elapsed());
        if report.clusters_checked > 0 || report.records_checked > 0 {
            tracing::info!(
                database = %self.name,
                clusters = report.clusters_checked,
                records = report.records_checked,
                repaired = report.records_repaired,
                pending = report.records_pending,
                "repair cycle finished"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Cluster repair
    // ========================================================================

    /// First server of `cluster` reachable from here. Stands in for the
    /// configured owner while that node is away.
    fn acting_owner(&self, cluster: ClusterId) -> Option<NodeName> {
        self.membership
            .servers(cluster)
            .into_iter()
            .find(|node| *node == self.local || self.is_reachable(node))
    }

    /// Copies the tail of `cluster` to replicas whose highest position is
    /// behind ours. Only the acting owner does this. Returns whether any
    /// replica received records.
    fn repair_cluster(&self, cluster: ClusterId) -> Result<bool> {
        if self.acting_owner(cluster).as_ref() != Some(&self.local) {
            tracing::debug!(cluster = %cluster, "not the owner, skipping cluster repair");
            return Ok(false);
        }
        let Some(local_tail) = self.storage_call(|storage| storage.highest_position(cluster))? else {
            return Ok(false);
        };
        let replicas: Vec<NodeName> = self
            .membership
            .servers(cluster)
            .into_iter()
            .filter(|node| *node != self.local)
            .collect();
        if replicas.is_empty() {
            return Ok(false);
        }

        let info = self.send_and_collect(
            replicas,
            Task::ClusterRepairInfo(cluster),
            self.next_request_id(),
            None,
        )?;
        let snapshot = info.collector.snapshot();
        let mut incomplete = !info.unreachable.is_empty() || !snapshot.missing.is_empty();
        let mut repaired = false;

        for (node, response) in snapshot.responses {
            let TaskResponse::ClusterTail(tail) = response else {
                incomplete = true;
                continue;
            };
            let from = tail.map_or(0, |position| position + 1);
            if from > local_tail {
                continue;
            }
            match self.stream_tail(cluster, &node, from, local_tail)? {
                Some(copied) => {
                    repaired = true;
                    tracing::info!(cluster = %cluster, node = %node, copied, "copied cluster tail");
                }
                None => incomplete = true,
            }
        }

        if incomplete {
            self.repair.enqueue_cluster(cluster);
        }
        Ok(repaired)
    }

    /// Sends positions `from..=to` to `node` in batches, each one locked here
    /// while in flight. Returns how many records the replica created, or
    /// `None` if a batch failed.
    fn stream_tail(
        &self,
        cluster: ClusterId,
        node: &NodeName,
        from: i64,
        to: i64,
    ) -> Result<Option<usize>> {
        let chunk = i64::try_from(self.config.repair.batch_size).unwrap_or(i64::MAX).max(1);
        let mut copied = 0;
        let mut position = from;
        while position <= to {
            let end = position.saturating_add(chunk - 1).min(to);
            let ids: Vec<RecordId> = (position..=end).map(|p| RecordId::new(cluster, p)).collect();
            let keys: Vec<LockKey> = ids.iter().copied().map(LockKey::from).collect();
            let request_id = self.next_request_id();
            let locked = match self.locks.acquire_all(&keys, request_id) {
                Ok(locked) => locked,
                Err(err) if err.is_retryable() => {
                    tracing::debug!(cluster = %cluster, error = %err, "cluster tail busy");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };

            let sent = self.read_records(&ids).and_then(|values| {
                let records: Vec<(RecordId, RawRecord)> = ids
                    .iter()
                    .zip(values)
                    .filter_map(|(id, value)| value.map(|value| (*id, value)))
                    .collect();
                self.send_and_collect(
                    [node.clone()],
                    Task::RepairCluster(RepairClusterTask { cluster, records }),
                    request_id,
                    None,
                )
            });
            self.locks.release_all(&locked, request_id);

            let response = sent?.collector.snapshot().responses.remove(node);
            match response {
                Some(TaskResponse::Fixed { applied }) => copied += applied,
                other => {
                    tracing::warn!(cluster = %cluster, node = %node, response = ?other, "cluster repair batch failed");
                    return Ok(None);
                }
            }
            position = end + 1;
        }
        Ok(Some(copied))
    }

    // ========================================================================
    // Record repair
    // ========================================================================

    /// Repairs a batch of records. Busy, unresolved or unreachable records
    /// are re-queued.
    fn repair_records(&self, records: &[RecordId]) -> Result<GroupOutcome> {
        let owner = self.next_request_id();
        let mut outcome = GroupOutcome::default();
        let mut groups: BTreeMap<Vec<NodeName>, Vec<RecordId>> = BTreeMap::new();
        let mut locked: Vec<LockKey> = Vec::new();

        for record in records {
            let key = LockKey::from(*record);
            match self.locks.try_lock(&key, owner) {
                TryLock::Acquired | TryLock::Reentrant => {
                    locked.push(key);
                    let mut servers = self.membership.servers(record.cluster());
                    servers.sort();
                    groups.entry(servers).or_default().push(*record);
                }
                TryLock::Held(holder) => {
                    tracing::debug!(record = %record, holder = %holder, "record busy, repair postponed");
                    outcome.pending.push(*record);
                }
            }
        }

        let mut failure = None;
        for (servers, group) in groups {
            match self.repair_group(&servers, &group) {
                Ok(result) => {
                    outcome.repaired += result.repaired;
                    outcome.pending.extend(result.pending);
                }
                Err(err) => {
                    outcome.pending.extend(group);
                    if err.is_fatal() {
                        failure = Some(err);
                        break;
                    }
                    tracing::warn!(error = %err, "record repair failed");
                }
            }
        }
        self.locks.release_all(&locked, owner);

        self.metrics
            .add_records_repaired(u64::try_from(outcome.repaired).unwrap_or(u64::MAX));
        self.repair.enqueue_records(outcome.pending.iter().copied());
        match failure {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn repair_group(&self, servers: &[NodeName], records: &[RecordId]) -> Result<GroupOutcome> {
        let includes_local = servers.contains(&self.local);
        let local = if includes_local {
            Some(TaskResponse::Records(self.read_records(records)?))
        } else {
            None
        };

        let read = self.send_and_collect(
            servers.iter().cloned(),
            Task::Read(ReadRecords {
                records: records.to_vec(),
            }),
            self.next_request_id(),
            local,
        );
        let dispatched = match read {
            Ok(dispatched) => dispatched,
            Err(err) if !err.is_fatal() => {
                tracing::debug!(error = %err, "replicas unavailable for repair read");
                return Ok(GroupOutcome {
                    repaired: 0,
                    pending: records.to_vec(),
                });
            }
            Err(err) => return Err(err),
        };

        let snapshot = dispatched.collector.snapshot();
        let replies: BTreeMap<NodeName, Vec<Option<RawRecord>>> = snapshot
            .responses
            .into_iter()
            .filter_map(|(node, response)| match response {
                TaskResponse::Records(values) if values.len() == records.len() => Some((node, values)),
                _ => None,
            })
            .collect();
        if replies.len() < servers.len() {
            tracing::debug!(
                replies = replies.len(),
                servers = servers.len(),
                "incomplete repair read, postponing"
            );
            return Ok(GroupOutcome {
                repaired: 0,
                pending: records.to_vec(),
            });
        }

        let mut pending: BTreeSet<RecordId> = BTreeSet::new();
        let mut touched: BTreeSet<RecordId> = BTreeSet::new();
        let mut fixes: BTreeMap<NodeName, Vec<RecordWrite>> = BTreeMap::new();

        for (index, record) in records.iter().enumerate() {
            let candidates =
                Candidate::group(replies.iter().map(|(node, values)| (node.clone(), values[index].clone())));
            let owner = self.membership.cluster_owner(record.cluster());
            let context = ResolveContext {
                record: *record,
                owner: owner.as_ref(),
            };
            let Some(decision) = self.resolvers.resolve(&context, candidates) else {
                pending.insert(*record);
                continue;
            };

            for (node, values) in &replies {
                let current = &values[index];
                if *current == decision.value {
                    continue;
                }
                let fix = match (&decision.value, current) {
                    (None, _) => RecordWrite::Delete { record: *record },
                    (Some(value), Some(_)) => RecordWrite::Update {
                        record: *record,
                        value: value.clone(),
                    },
                    (Some(value), None) => RecordWrite::Create {
                        record: *record,
                        value: value.clone(),
                    },
                };
                fixes.entry(node.clone()).or_default().push(fix);
                touched.insert(*record);
            }
            if touched.contains(record) {
                tracing::info!(
                    record = %record,
                    resolver = decision.resolver,
                    "resolved diverged record"
                );
            }
        }

        for (node, operations) in fixes {
            let affected: Vec<RecordId> = operations.iter().map(RecordWrite::record).collect();
            let applied = if node == self.local {
                self.apply_writes(&operations).map(|_| true)?
            } else {
                self.send_fix(&node, operations)
            };
            if !applied {
                pending.extend(affected);
            }
        }

        Ok(GroupOutcome {
            repaired: touched.difference(&pending).count(),
            pending: pending.into_iter().collect(),
        })
    }

    /// Sends corrective writes to one replica and waits for its answer.
    fn send_fix(&self, node: &NodeName, mut operations: Vec<RecordWrite>) -> bool {
        let task = if operations.len() == 1 {
            operations.pop().map_or(Task::Heartbeat, Task::Write)
        } else {
            Task::RepairRecord(FixTask { operations })
        };
        match self.send_and_collect([node.clone()], task, self.next_request_id(), None) {
            Ok(dispatched) => dispatched
                .collector
                .snapshot()
                .responses
                .get(node)
                .is_some_and(|response| {
                    matches!(response, TaskResponse::Ack | TaskResponse::Fixed { .. })
                }),
            Err(err) => {
                tracing::debug!(node = %node, error = %err, "corrective write not sent");
                false
            }
        }
    }
}
