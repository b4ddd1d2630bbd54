//! Quorum response collection.
//!
//! Every request that expects replies opens a [`ResponseCollector`] and
//! registers it in the database's [`ResponseRegistry`] before anything goes on
//! the wire. Replies are folded into the collector as they arrive. The sender
//! blocks in [`ResponseCollector::await_sync`] for at most the synchronous
//! timeout. If the quorum is still missing by then, the collector stays
//! registered and keeps accepting replies until the total timeout, when the
//! purge tick force-resolves it and treats silent nodes as failed.
//!
//! # Grouping
//!
//! Under [`ResultStrategy::Equality`] replies are grouped with
//! [`TaskResponse::same_group`]. A group counts toward the quorum with the
//! nodes that concur to it, so replica-role nodes are heard but never decide
//! a write. A group of contention replies (lock timeouts, concurrent creates)
//! never counts as the quorum group. When both a positive and a negative
//! group reach the quorum, the positive one wins.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tessera_types::{NodeName, RecordId, RequestId};

use crate::error::{ReplicationError, Result};
use crate::task::{ResponseEnvelope, ResultStrategy, TaskKind, TaskResponse};

/// Longest single wait on the condition variable; the loop re-checks state
/// after every slice.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(10);

// ============================================================================
// Collector
// ============================================================================

/// Parameters for opening a collector.
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    pub request_id: RequestId,
    pub kind: TaskKind,
    /// Nodes a reply is expected from, the local node included when it
    /// contributes a result.
    pub expected: BTreeSet<NodeName>,
    /// Subset of `expected` whose replies count toward the quorum.
    pub concur: BTreeSet<NodeName>,
    pub quorum: usize,
    pub strategy: ResultStrategy,
    pub synchronous_timeout: Duration,
    pub total_timeout: Duration,
    /// Records touched by the request, reported if it times out.
    pub records: Vec<RecordId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    /// Still waiting for the quorum.
    Open,
    /// Quorum reached or every expected node answered.
    Resolved,
    /// The total timeout expired first.
    TimedOut,
    Cancelled,
}

/// What a single reply did to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collected {
    /// Unexpected node, duplicate reply, or closed collector.
    Ignored,
    Pending,
    QuorumReached,
    /// Every expected node has answered.
    Complete,
}

/// Nodes that returned equal responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseGroup {
    pub response: TaskResponse,
    pub nodes: BTreeSet<NodeName>,
}

/// Point-in-time view of a collector.
#[derive(Debug, Clone)]
pub struct CollectorSnapshot {
    pub request_id: RequestId,
    pub quorum: usize,
    pub phase: CollectorPhase,
    pub responses: BTreeMap<NodeName, TaskResponse>,
    /// Expected nodes that have not answered.
    pub missing: BTreeSet<NodeName>,
    pub groups: Vec<ResponseGroup>,
    pub quorum_group: Option<ResponseGroup>,
}

impl CollectorSnapshot {
    /// `node: outcome` for every reply, then `node: no response` for the silent ones.
    pub fn describe(&self) -> String {
        self.responses
            .iter()
            .map(|(node, response)| format!("{node}: {response}"))
            .chain(self.missing.iter().map(|node| format!("{node}: no response")))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Combined result under the task's strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalResult {
    Agreed(ResponseGroup),
    All(Vec<(NodeName, TaskResponse)>),
}

#[derive(Debug)]
struct CollectorState {
    expected: BTreeSet<NodeName>,
    concur: BTreeSet<NodeName>,
    responses: BTreeMap<NodeName, TaskResponse>,
    groups: Vec<ResponseGroup>,
    phase: CollectorPhase,
}

impl CollectorState {
    fn concurring(&self, group: &ResponseGroup) -> usize {
        group.nodes.intersection(&self.concur).count()
    }

    fn quorum_group(&self, quorum: usize) -> Option<&ResponseGroup> {
        let mut eligible = self
            .groups
            .iter()
            .filter(|g| !g.response.is_contention() && self.concurring(g) >= quorum.max(1));
        let first = eligible.next()?;
        if first.response.is_positive() {
            return Some(first);
        }
        eligible
            .find(|g| g.response.is_positive())
            .or(Some(first))
    }

    fn quorum_reached(&self, quorum: usize, strategy: ResultStrategy) -> bool {
        match strategy {
            ResultStrategy::Equality => quorum == 0 || self.quorum_group(quorum).is_some(),
            ResultStrategy::Union => {
                self.responses
                    .keys()
                    .filter(|node| self.concur.contains(*node))
                    .count()
                    >= quorum
            }
        }
    }

    /// False once no arrangement of outstanding replies can reach the quorum.
    fn quorum_possible(&self, quorum: usize, strategy: ResultStrategy) -> bool {
        let outstanding = self
            .concur
            .iter()
            .filter(|node| !self.responses.contains_key(*node))
            .count();
        match strategy {
            ResultStrategy::Union => {
                self.responses.len().min(self.concur.len()) + outstanding >= quorum
            }
            ResultStrategy::Equality => {
                let best = self
                    .groups
                    .iter()
                    .filter(|g| !g.response.is_contention())
                    .map(|g| self.concurring(g))
                    .max()
                    .unwrap_or(0);
                best + outstanding >= quorum
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.expected.iter().all(|node| self.responses.contains_key(node))
    }

    fn missing(&self) -> BTreeSet<NodeName> {
        self.expected
            .iter()
            .filter(|node| !self.responses.contains_key(*node))
            .cloned()
            .collect()
    }

    fn add(&mut self, node: NodeName, response: TaskResponse) {
        match self.groups.iter_mut().find(|g| g.response.same_group(&response)) {
            Some(group) => {
                group.nodes.insert(node.clone());
            }
            None => self.groups.push(ResponseGroup {
                response: response.clone(),
                nodes: BTreeSet::from([node.clone()]),
            }),
        }
        self.responses.insert(node, response);
    }
}

/// Aggregates the replies to one request.
#[derive(Debug)]
pub struct ResponseCollector {
    request_id: RequestId,
    kind: TaskKind,
    quorum: usize,
    strategy: ResultStrategy,
    synchronous_deadline: Instant,
    total_deadline: Instant,
    records: Vec<RecordId>,
    state: Mutex<CollectorState>,
    changed: Condvar,
}

impl ResponseCollector {
    pub fn open(spec: CollectorSpec) -> Self {
        let now = Instant::now();
        let concur = spec.concur.intersection(&spec.expected).cloned().collect();
        Self {
            request_id: spec.request_id,
            kind: spec.kind,
            quorum: spec.quorum,
            strategy: spec.strategy,
            synchronous_deadline: now + spec.synchronous_timeout,
            total_deadline: now + spec.total_timeout.max(spec.synchronous_timeout),
            records: spec.records,
            state: Mutex::new(CollectorState {
                expected: spec.expected,
                concur,
                responses: BTreeMap::new(),
                groups: Vec::new(),
                phase: CollectorPhase::Open,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn records(&self) -> &[RecordId] {
        &self.records
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-evaluates after a change and wakes the waiter.
    fn settle(&self, state: &mut CollectorState) -> Collected {
        let reached = state.quorum_reached(self.quorum, self.strategy);
        let complete = state.is_complete();
        if (reached || complete) && state.phase == CollectorPhase::Open {
            state.phase = CollectorPhase::Resolved;
        }
        self.changed.notify_all();
        if complete {
            Collected::Complete
        } else if reached {
            Collected::QuorumReached
        } else {
            Collected::Pending
        }
    }

    /// Records `node`'s reply.
    pub fn collect(&self, node: &NodeName, response: TaskResponse) -> Collected {
        let mut state = self.lock();
        if matches!(state.phase, CollectorPhase::TimedOut | CollectorPhase::Cancelled)
            || !state.expected.contains(node)
            || state.responses.contains_key(node)
        {
            return Collected::Ignored;
        }
        state.add(node.clone(), response);
        self.settle(&mut state)
    }

    /// Stops waiting for a node that became unreachable.
    pub fn remove_node(&self, node: &NodeName) -> Collected {
        let mut state = self.lock();
        if state.responses.contains_key(node) || !state.expected.remove(node) {
            return Collected::Ignored;
        }
        state.concur.remove(node);
        self.settle(&mut state)
    }

    /// Blocks until the quorum is reached, it becomes unreachable, every node
    /// has answered, or the synchronous timeout passes. Returns whether the
    /// quorum was reached.
    pub fn await_sync(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.quorum_reached(self.quorum, self.strategy) {
                return true;
            }
            if matches!(state.phase, CollectorPhase::TimedOut | CollectorPhase::Cancelled)
                || state.is_complete()
                || !state.quorum_possible(self.quorum, self.strategy)
            {
                return false;
            }
            let now = Instant::now();
            if now >= self.synchronous_deadline {
                return false;
            }
            let slice = (self.synchronous_deadline - now).min(MAX_WAIT_SLICE);
            state = self
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn phase(&self) -> CollectorPhase {
        self.lock().phase
    }

    pub fn is_quorum_reached(&self) -> bool {
        self.lock().quorum_reached(self.quorum, self.strategy)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.total_deadline
    }

    /// Force-resolves the collector; silent nodes count as failed.
    /// Returns the nodes that never answered.
    pub fn time_out(&self) -> BTreeSet<NodeName> {
        let mut state = self.lock();
        if state.phase == CollectorPhase::Open {
            state.phase = CollectorPhase::TimedOut;
        }
        self.changed.notify_all();
        state.missing()
    }

    pub fn cancel(&self) {
        let mut state = self.lock();
        state.phase = CollectorPhase::Cancelled;
        self.changed.notify_all();
    }

    pub fn snapshot(&self) -> CollectorSnapshot {
        let state = self.lock();
        CollectorSnapshot {
            request_id: self.request_id,
            quorum: self.quorum,
            phase: state.phase,
            responses: state.responses.clone(),
            missing: state.missing(),
            groups: state.groups.clone(),
            quorum_group: state.quorum_group(self.quorum).cloned(),
        }
    }

    /// Under [`ResultStrategy::Equality`] the group that met the quorum, or an
    /// aggregated failure. Under [`ResultStrategy::Union`] every reply.
    pub fn final_result(&self) -> Result<FinalResult> {
        let snapshot = self.snapshot();
        match self.strategy {
            ResultStrategy::Union => Ok(FinalResult::All(snapshot.responses.into_iter().collect())),
            ResultStrategy::Equality => match snapshot.quorum_group.clone() {
                Some(group) => Ok(FinalResult::Agreed(group)),
                None => Err(ReplicationError::QuorumNotReached {
                    request: self.request_id,
                    quorum: self.quorum,
                    responses: snapshot.describe(),
                }),
            },
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Lifecycle notifications, consumed by the owning database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorEvent {
    Completed {
        request_id: RequestId,
        kind: TaskKind,
    },
    TimedOut {
        request_id: RequestId,
        kind: TaskKind,
        missing: BTreeSet<NodeName>,
        records: Vec<RecordId>,
    },
}

/// Open collectors of one database, keyed by request.
#[derive(Debug)]
pub struct ResponseRegistry {
    collectors: DashMap<RequestId, Arc<ResponseCollector>>,
    events: Sender<CollectorEvent>,
}

impl ResponseRegistry {
    pub fn new() -> (Self, Receiver<CollectorEvent>) {
        let (events, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                collectors: DashMap::new(),
                events,
            },
            receiver,
        )
    }

    pub fn register(&self, collector: Arc<ResponseCollector>) {
        self.collectors.insert(collector.request_id(), collector);
    }

    pub fn get(&self, request_id: RequestId) -> Option<Arc<ResponseCollector>> {
        self.collectors
            .get(&request_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Drops a collector once its sender is done with it.
    pub fn release(&self, request_id: RequestId) {
        if let Some((_, collector)) = self.collectors.remove(&request_id) {
            let _ = self.events.send(CollectorEvent::Completed {
                request_id,
                kind: collector.kind(),
            });
        }
    }

    /// Routes a reply to its collector. The collector is dropped from the
    /// registry as soon as it resolves; later replies are ignored.
    pub fn on_response(&self, envelope: ResponseEnvelope) -> Collected {
        let Some(collector) = self.get(envelope.request_id) else {
            tracing::debug!(
                request = %envelope.request_id,
                node = %envelope.executor,
                "response for unknown or finished request"
            );
            return Collected::Ignored;
        };
        let collected = collector.collect(&envelope.executor, envelope.payload);
        if matches!(collected, Collected::QuorumReached | Collected::Complete) {
            self.release(envelope.request_id);
        }
        collected
    }

    /// Stops every open collector from waiting on `node`.
    pub fn remove_unreachable(&self, node: &NodeName) -> usize {
        let open: Vec<Arc<ResponseCollector>> = self
            .collectors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut affected = 0;
        for collector in open {
            match collector.remove_node(node) {
                Collected::Ignored => {}
                Collected::Pending => affected += 1,
                Collected::QuorumReached | Collected::Complete => {
                    affected += 1;
                    self.release(collector.request_id());
                }
            }
        }
        affected
    }

    /// Force-resolves collectors past their total timeout. Returns how many expired.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let expired: Vec<RequestId> = self
            .collectors
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut purged = 0;
        for request_id in expired {
            let Some((_, collector)) = self.collectors.remove(&request_id) else {
                continue;
            };
            let missing = collector.time_out();
            tracing::warn!(
                request = %request_id,
                task = %collector.kind(),
                missing = missing.len(),
                "request timed out before all responses arrived"
            );
            let _ = self.events.send(CollectorEvent::TimedOut {
                request_id,
                kind: collector.kind(),
                missing,
                records: collector.records().to_vec(),
            });
            purged += 1;
        }
        purged
    }

    pub fn cancel_all(&self) {
        let open: Vec<RequestId> = self.collectors.iter().map(|entry| *entry.key()).collect();
        for request_id in open {
            if let Some((_, collector)) = self.collectors.remove(&request_id) {
                collector.cancel();
            }
        }
    }
}
