//! Fan-out of requests to peers and quorum computation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tessera_types::{ClusterId, NodeName, RequestId};

use crate::collector::{CollectorPhase, CollectorSpec, ResponseCollector};
use crate::error::{ReplicationError, Result};
use crate::task::{QuorumType, RequestEnvelope, ResultStrategy, Task, TaskResponse};

use super::DatabaseCore;

/// A request that went out, and what came back within the synchronous timeout.
pub(crate) struct Dispatched {
    pub collector: Arc<ResponseCollector>,
    /// Targets that were offline or could not be reached.
    pub unreachable: Vec<NodeName>,
}

impl DatabaseCore {
    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId::new(
            self.local_id,
            self.next_request.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Sends `task` to every target and blocks until the quorum is reached,
    /// cannot be reached any more, or the synchronous timeout passes.
    ///
    /// `local` is this node's own result, counted like any other reply.
    /// The collector is released here once resolved; otherwise it stays
    /// registered until the purge tick times it out.
    pub(crate) fn send_and_collect(
        &self,
        targets: impl IntoIterator<Item = NodeName>,
        task: Task,
        request_id: RequestId,
        local: Option<TaskResponse>,
    ) -> Result<Dispatched> {
        let traits = task.traits();
        let remote: BTreeSet<NodeName> = targets
            .into_iter()
            .filter(|node| *node != self.local)
            .collect();
        let (online, unreachable): (BTreeSet<NodeName>, BTreeSet<NodeName>) =
            remote.iter().cloned().partition(|node| self.is_reachable(node));

        let mut expected = online.clone();
        if local.is_some() {
            expected.insert(self.local.clone());
        }
        let concur: BTreeSet<NodeName> = expected
            .iter()
            .filter(|node| self.membership.concurs(node, traits.quorum_type))
            .cloned()
            .collect();
        let quorum = self.quorum_for(&task, concur.len())?;

        let collector = Arc::new(ResponseCollector::open(CollectorSpec {
            request_id,
            kind: task.kind(),
            expected,
            concur,
            quorum,
            strategy: traits.result_strategy,
            synchronous_timeout: self.config.replication.synchronous_timeout(),
            total_timeout: self.config.replication.total_timeout(),
            records: task.records(),
        }));
        if let Some(response) = local {
            collector.collect(&self.local, response);
        }
        self.registry.register(Arc::clone(&collector));

        let mut unreachable: Vec<NodeName> = unreachable.into_iter().collect();
        let mut sent = 0;
        for target in online {
            let envelope = RequestEnvelope {
                request_id,
                database: self.name.clone(),
                sender: self.local.clone(),
                task: task.clone(),
            };
            match self.transport.send_request(&target, envelope) {
                Ok(()) => sent += 1,
                Err(err) => {
                    self.metrics.increment_send_failures();
                    tracing::warn!(
                        request = %request_id,
                        target = %target,
                        error = %err,
                        "failed to send request"
                    );
                    collector.remove_node(&target);
                    unreachable.push(target);
                }
            }
        }
        self.metrics.add_requests_sent(sent);

        collector.await_sync();
        if collector.phase() == CollectorPhase::Resolved {
            self.registry.release(request_id);
        }
        Ok(Dispatched {
            collector,
            unreachable,
        })
    }

    /// Sends `task` without waiting for replies. Returns the targets it could
    /// not be delivered to.
    pub(crate) fn send_oneway(
        &self,
        targets: impl IntoIterator<Item = NodeName>,
        task: &Task,
        request_id: RequestId,
    ) -> Vec<NodeName> {
        let mut failed = Vec::new();
        let mut sent = 0;
        for target in targets.into_iter().filter(|node| *node != self.local) {
            if !self.is_reachable(&target) {
                failed.push(target);
                continue;
            }
            let envelope = RequestEnvelope {
                request_id,
                database: self.name.clone(),
                sender: self.local.clone(),
                task: task.clone(),
            };
            match self.transport.send_request(&target, envelope) {
                Ok(()) => sent += 1,
                Err(err) => {
                    self.metrics.increment_send_failures();
                    tracing::debug!(request = %request_id, target = %target, error = %err, "one-way send failed");
                    failed.push(target);
                }
            }
        }
        self.metrics.add_requests_sent(sent);
        failed
    }

    pub(crate) fn is_reachable(&self, node: &NodeName) -> bool {
        self.transport.is_node_online(node) && self.membership.is_node_available(node)
    }

    /// Replies a request needs before its sender can decide.
    ///
    /// `available` counts the reachable servers whose reply concurs; servers
    /// that are down do not raise the quorum. Union tasks wait for every
    /// available node. Equality tasks use the strictest configured quorum of
    /// the clusters involved, clamped to what is available unless
    /// `check_nodes_online` is set, in which case a fixed quorum larger than
    /// the available set fails before anything is sent.
    pub(crate) fn quorum_for(&self, task: &Task, available: usize) -> Result<usize> {
        let traits = task.traits();
        if traits.quorum_type == QuorumType::None {
            return Ok(0);
        }
        if available == 0 {
            return Err(ReplicationError::QuorumUnavailable {
                quorum: 1,
                available,
            });
        }
        if traits.result_strategy == ResultStrategy::Union {
            return Ok(available);
        }

        let clusters = task.clusters();
        let configured = clusters
            .iter()
            .map(|cluster| self.membership.quorum(*cluster, traits.quorum_type, available))
            .max()
            .unwrap_or_else(|| {
                self.membership
                    .quorum(ClusterId::default(), traits.quorum_type, available)
            });

        if self.config.replication.check_nodes_online && configured > available {
            return Err(ReplicationError::QuorumUnavailable {
                quorum: configured,
                available,
            });
        }
        Ok(configured.clamp(1, available))
    }
}
