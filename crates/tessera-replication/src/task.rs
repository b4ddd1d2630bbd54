//! Replicated tasks and their responses.
//!
//! Every message a node can ask a peer to execute is one [`Task`] variant.
//! Instead of a class per task, each variant maps to a [`TaskKind`] and the
//! kind's row in the behaviour table ([`TaskKind::traits`]) says how the
//! sender should gather replies: which quorum applies, whether replies are
//! grouped by equality or simply collected, and whether a replay is harmless.
//!
//! Execution lives with the participant; this module only describes data.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::{
    ClusterId, IndexKey, LockKey, NodeName, RawRecord, RecordId, RequestId, TransactionId, Version,
};

use crate::error::ReplicationError;
use crate::storage::StorageWrite;

// ============================================================================
// Behaviour Table
// ============================================================================

/// Which configured quorum a task must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuorumType {
    /// Fire and forget; nobody waits for replies.
    None,
    Read,
    Write,
    /// Every concurring replica must answer.
    All,
}

/// How replies are combined into one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStrategy {
    /// Every reply is returned as is.
    Union,
    /// Replies are grouped by value; the group reaching the quorum wins.
    Equality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Create,
    Update,
    Delete,
    Read,
    Phase1,
    Phase2,
    ClusterRepairInfo,
    RepairCluster,
    RepairRecord,
    Heartbeat,
}

/// One row of the behaviour table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTraits {
    pub quorum_type: QuorumType,
    pub result_strategy: ResultStrategy,
    pub idempotent: bool,
}

impl TaskTraits {
    const fn new(quorum_type: QuorumType, result_strategy: ResultStrategy, idempotent: bool) -> Self {
        Self {
            quorum_type,
            result_strategy,
            idempotent,
        }
    }
}

impl TaskKind {
    pub const fn traits(self) -> TaskTraits {
        use QuorumType as Q;
        use ResultStrategy as S;
        match self {
            // Forced corrective writes: replaying one leaves the same state.
            TaskKind::Create | TaskKind::Update | TaskKind::Delete => {
                TaskTraits::new(Q::All, S::Union, true)
            }
            TaskKind::Read | TaskKind::ClusterRepairInfo => TaskTraits::new(Q::Read, S::Union, true),
            // Duplicate delivery is detected through the context table and sequencer.
            TaskKind::Phase1 => TaskTraits::new(Q::Write, S::Equality, false),
            TaskKind::Phase2 => TaskTraits::new(Q::None, S::Equality, true),
            TaskKind::RepairCluster | TaskKind::RepairRecord => {
                TaskTraits::new(Q::All, S::Union, true)
            }
            TaskKind::Heartbeat => TaskTraits::new(Q::None, S::Union, true),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::Create => "create",
            TaskKind::Update => "update",
            TaskKind::Delete => "delete",
            TaskKind::Read => "read",
            TaskKind::Phase1 => "tx-phase1",
            TaskKind::Phase2 => "tx-phase2",
            TaskKind::ClusterRepairInfo => "cluster-repair-info",
            TaskKind::RepairCluster => "repair-cluster",
            TaskKind::RepairRecord => "repair-record",
            TaskKind::Heartbeat => "heartbeat",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the dispatcher runs a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// One cluster; runs on worker `cluster mod N`.
    Cluster(u32),
    /// Several clusters; runs behind a barrier on all of their workers.
    Clusters(Vec<u32>),
    /// No ordering requirement; runs on the least loaded worker.
    Any,
    /// Runs behind a barrier on every worker.
    Broadcast,
}

impl Partition {
    fn of_clusters(mut clusters: Vec<ClusterId>) -> Self {
        clusters.sort_unstable();
        clusters.dedup();
        match clusters.as_slice() {
            [] => Partition::Broadcast,
            [single] => Partition::Cluster(single.as_u32()),
            many => Partition::Clusters(many.iter().map(|c| c.as_u32()).collect()),
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// One record change inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOperation {
    Create { record: RecordId, content: Bytes },
    /// `version` is the version the writer read and expects to replace.
    Update {
        record: RecordId,
        content: Bytes,
        version: Version,
    },
    Delete { record: RecordId, version: Version },
}

impl RecordOperation {
    pub fn record(&self) -> RecordId {
        match self {
            RecordOperation::Create { record, .. }
            | RecordOperation::Update { record, .. }
            | RecordOperation::Delete { record, .. } => *record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOp {
    Put,
    Remove,
}

/// A change to a unique index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub key: IndexKey,
    pub record: RecordId,
    pub op: IndexOp,
}

/// The payload of a two-phase commit: record changes plus unique index changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub operations: Vec<RecordOperation>,
    pub index_changes: Vec<IndexChange>,
    next_temporary: i64,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record creation. The returned id is temporary; the coordinator
    /// assigns the real cluster position before phase 1.
    pub fn create(&mut self, cluster: ClusterId, content: impl Into<Bytes>) -> RecordId {
        self.next_temporary -= 1;
        let record = RecordId::new(cluster, self.next_temporary - 1);
        self.operations.push(RecordOperation::Create {
            record,
            content: content.into(),
        });
        record
    }

    pub fn update(&mut self, record: RecordId, content: impl Into<Bytes>, version: Version) {
        self.operations.push(RecordOperation::Update {
            record,
            content: content.into(),
            version,
        });
    }

    pub fn delete(&mut self, record: RecordId, version: Version) {
        self.operations
            .push(RecordOperation::Delete { record, version });
    }

    pub fn put_index(&mut self, key: IndexKey, record: RecordId) {
        self.index_changes.push(IndexChange {
            key,
            record,
            op: IndexOp::Put,
        });
    }

    pub fn remove_index(&mut self, key: IndexKey, record: RecordId) {
        self.index_changes.push(IndexChange {
            key,
            record,
            op: IndexOp::Remove,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.index_changes.is_empty()
    }

    /// Sorted, deduplicated clusters touched by the transaction.
    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut clusters: Vec<ClusterId> = self
            .operations
            .iter()
            .map(|op| op.record().cluster())
            .chain(self.index_changes.iter().map(|c| c.record.cluster()))
            .collect();
        clusters.sort_unstable();
        clusters.dedup();
        clusters
    }

    pub fn records(&self) -> Vec<RecordId> {
        let mut records: Vec<RecordId> = self.operations.iter().map(RecordOperation::record).collect();
        records.sort_unstable();
        records.dedup();
        records
    }

    /// Every record and unique index key phase 1 must lock, in canonical order.
    pub fn lock_keys(&self) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = self
            .operations
            .iter()
            .map(|op| LockKey::Record(op.record()))
            .chain(self.index_changes.iter().map(|c| LockKey::Key(c.key.clone())))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Returns a copy whose creations have real positions, plus the assigned ids.
    ///
    /// Positions are handed out per cluster starting at `next_position(cluster)`,
    /// in operation order. Index changes that pointed at a temporary id are
    /// rewritten to the assigned one. Creations that already carry a real
    /// position are left alone, so calling this again on a retry re-allocates
    /// only from the original transaction.
    pub fn assign_positions<E>(
        &self,
        mut next_position: impl FnMut(ClusterId) -> Result<i64, E>,
    ) -> Result<(Transaction, Vec<RecordId>), E> {
        let mut cursors: BTreeMap<ClusterId, i64> = BTreeMap::new();
        let mut remapped: BTreeMap<RecordId, RecordId> = BTreeMap::new();
        let mut assigned = self.clone();
        let mut created = Vec::new();

        for op in &mut assigned.operations {
            if let RecordOperation::Create { record, .. } = op {
                if !record.is_persistent() {
                    let cluster = record.cluster();
                    let position = match cursors.entry(cluster) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => entry.insert(next_position(cluster)?),
                    };
                    let new_id = RecordId::new(cluster, *position);
                    *position += 1;
                    remapped.insert(*record, new_id);
                    *record = new_id;
                }
                created.push(*record);
            }
        }

        for change in &mut assigned.index_changes {
            if let Some(new_id) = remapped.get(&change.record) {
                change.record = *new_id;
            }
        }

        Ok((assigned, created))
    }

    /// Storage writes that apply a validated transaction.
    pub fn writes(&self) -> Vec<StorageWrite> {
        let records = self.operations.iter().map(|op| match op {
            RecordOperation::Create { record, content } => StorageWrite::Put {
                record: *record,
                value: RawRecord::new(content.clone(), Version::INITIAL),
            },
            RecordOperation::Update {
                record,
                content,
                version,
            } => StorageWrite::Put {
                record: *record,
                value: RawRecord::new(content.clone(), version.next()),
            },
            RecordOperation::Delete { record, .. } => StorageWrite::Remove { record: *record },
        });
        let indexes = self.index_changes.iter().map(|change| match change.op {
            IndexOp::Put => StorageWrite::IndexPut {
                key: change.key.clone(),
                record: change.record,
            },
            IndexOp::Remove => StorageWrite::IndexRemove {
                key: change.key.clone(),
            },
        });
        records.chain(indexes).collect()
    }
}

// ============================================================================
// Corrective Writes
// ============================================================================

/// A write that replaces whatever a replica holds, bypassing version checks.
/// Used by repair to copy the winning value onto diverged replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordWrite {
    Create { record: RecordId, value: RawRecord },
    Update { record: RecordId, value: RawRecord },
    Delete { record: RecordId },
}

impl RecordWrite {
    pub fn kind(&self) -> TaskKind {
        match self {
            RecordWrite::Create { .. } => TaskKind::Create,
            RecordWrite::Update { .. } => TaskKind::Update,
            RecordWrite::Delete { .. } => TaskKind::Delete,
        }
    }

    pub fn record(&self) -> RecordId {
        match self {
            RecordWrite::Create { record, .. }
            | RecordWrite::Update { record, .. }
            | RecordWrite::Delete { record } => *record,
        }
    }

    pub fn storage_write(&self) -> StorageWrite {
        match self {
            RecordWrite::Create { record, value } | RecordWrite::Update { record, value } => {
                StorageWrite::Put {
                    record: *record,
                    value: value.clone(),
                }
            }
            RecordWrite::Delete { record } => StorageWrite::Remove { record: *record },
        }
    }

    /// The write that restores `prior`, the value held before this write ran.
    pub fn compute_undo(&self, prior: Option<RawRecord>) -> Option<RecordWrite> {
        let record = self.record();
        match (self, prior) {
            (RecordWrite::Delete { .. }, None) => None,
            (RecordWrite::Delete { .. }, Some(value)) => Some(RecordWrite::Create { record, value }),
            (_, Some(value)) => Some(RecordWrite::Update { record, value }),
            (_, None) => Some(RecordWrite::Delete { record }),
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Phase 1: validate and lock, answering with a [`TxOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase1Task {
    pub tx_id: TransactionId,
    pub transaction: Transaction,
}

/// Phase 2: confirm or cancel the context created by `phase1_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase2Task {
    pub tx_id: TransactionId,
    pub phase1_request: RequestId,
    pub success: bool,
    /// Same partition as phase 1, so phase 2 queues behind it.
    pub clusters: Vec<ClusterId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecords {
    pub records: Vec<RecordId>,
}

/// Records a lagging replica is missing at the tail of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairClusterTask {
    pub cluster: ClusterId,
    pub records: Vec<(RecordId, RawRecord)>,
}

/// Ordered corrective writes for one target node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixTask {
    pub operations: Vec<RecordWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Write(RecordWrite),
    Read(ReadRecords),
    Phase1(Phase1Task),
    Phase2(Phase2Task),
    ClusterRepairInfo(ClusterId),
    RepairCluster(RepairClusterTask),
    RepairRecord(FixTask),
    Heartbeat,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Write(write) => write.kind(),
            Task::Read(_) => TaskKind::Read,
            Task::Phase1(_) => TaskKind::Phase1,
            Task::Phase2(_) => TaskKind::Phase2,
            Task::ClusterRepairInfo(_) => TaskKind::ClusterRepairInfo,
            Task::RepairCluster(_) => TaskKind::RepairCluster,
            Task::RepairRecord(_) => TaskKind::RepairRecord,
            Task::Heartbeat => TaskKind::Heartbeat,
        }
    }

    pub fn traits(&self) -> TaskTraits {
        self.kind().traits()
    }

    /// Clusters whose replicas and quorums govern this task.
    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut clusters = match self {
            Task::Write(write) => vec![write.record().cluster()],
            Task::Read(read) => read.records.iter().map(|r| r.cluster()).collect(),
            Task::Phase1(phase1) => phase1.transaction.clusters(),
            Task::Phase2(phase2) => phase2.clusters.clone(),
            Task::ClusterRepairInfo(cluster) => vec![*cluster],
            Task::RepairCluster(repair) => vec![repair.cluster],
            Task::RepairRecord(fix) => fix.operations.iter().map(|w| w.record().cluster()).collect(),
            Task::Heartbeat => Vec::new(),
        };
        clusters.sort_unstable();
        clusters.dedup();
        clusters
    }

    /// Records that need repair if this task cannot be confirmed everywhere.
    pub fn records(&self) -> Vec<RecordId> {
        match self {
            Task::Write(write) => vec![write.record()],
            Task::Phase1(phase1) => phase1.transaction.records(),
            Task::RepairRecord(fix) => fix.operations.iter().map(RecordWrite::record).collect(),
            _ => Vec::new(),
        }
    }

    pub fn partition(&self) -> Partition {
        match self {
            Task::Heartbeat => Partition::Any,
            _ => Partition::of_clusters(self.clusters()),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Result of phase 1 on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    Success,
    /// `actual` is [`Version::default`] when the record no longer exists.
    ConcurrentModification {
        record: RecordId,
        expected: Version,
        actual: Version,
    },
    ConcurrentCreate {
        expected: RecordId,
        actual: RecordId,
    },
    UniqueIndex {
        key: IndexKey,
        existing: RecordId,
        record: RecordId,
    },
    RecordLocked {
        record: RecordId,
        owner: RequestId,
    },
    KeyLocked {
        key: IndexKey,
        owner: RequestId,
    },
    InvalidSequential {
        tx: TransactionId,
    },
    Failed(String),
}

impl TxOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TxOutcome::Success)
    }

    /// Lock timeouts: the transaction may succeed if retried later.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, TxOutcome::RecordLocked { .. } | TxOutcome::KeyLocked { .. })
    }

    /// Outcomes that keep a response group from counting as a quorum.
    pub fn is_contention(&self) -> bool {
        self.is_lock_timeout() || matches!(self, TxOutcome::ConcurrentCreate { .. })
    }

    pub fn into_error(self, request: RequestId, node: &NodeName) -> ReplicationError {
        match self {
            TxOutcome::Success => ReplicationError::Remote {
                request,
                node: node.clone(),
                message: "unexpected success".to_string(),
            },
            TxOutcome::ConcurrentModification {
                record,
                expected,
                actual,
            } => ReplicationError::ConcurrentModification {
                record,
                expected,
                actual,
            },
            TxOutcome::ConcurrentCreate { expected, actual } => {
                ReplicationError::ConcurrentCreate { expected, actual }
            }
            TxOutcome::UniqueIndex {
                key,
                existing,
                record,
            } => ReplicationError::UniqueIndexViolation {
                key,
                existing,
                record,
            },
            TxOutcome::RecordLocked { record, owner } => {
                ReplicationError::RecordLocked { record, owner }
            }
            TxOutcome::KeyLocked { key, owner } => ReplicationError::KeyLocked { key, owner },
            TxOutcome::InvalidSequential { tx } => ReplicationError::InvalidSequential { tx },
            TxOutcome::Failed(message) => ReplicationError::Remote {
                request,
                node: node.clone(),
                message,
            },
        }
    }
}

impl Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOutcome::Success => f.write_str("success"),
            TxOutcome::ConcurrentModification {
                record,
                expected,
                actual,
            } => write!(f, "concurrent modification of {record} ({expected} != {actual})"),
            TxOutcome::ConcurrentCreate { expected, actual } => {
                write!(f, "concurrent create ({expected} != {actual})")
            }
            TxOutcome::UniqueIndex { key, existing, .. } => {
                write!(f, "duplicate key {key} on {existing}")
            }
            TxOutcome::RecordLocked { record, owner } => {
                write!(f, "record {record} locked by {owner}")
            }
            TxOutcome::KeyLocked { key, owner } => write!(f, "key {key} locked by {owner}"),
            TxOutcome::InvalidSequential { tx } => write!(f, "invalid sequential {tx}"),
            TxOutcome::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// Payload a node sends back for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResponse {
    Ack,
    Phase1(TxOutcome),
    Phase2 { applied: bool },
    Records(Vec<Option<RawRecord>>),
    ClusterTail(Option<i64>),
    Fixed { applied: usize },
    /// A failure raised while executing the task, wrapped instead of dropped.
    Error(String),
}

impl TaskResponse {
    /// Whether two responses belong to the same equality group.
    ///
    /// Phase 1 outcomes group by outcome kind, so two nodes that both report a
    /// concurrent modification agree even if they saw different versions.
    pub fn same_group(&self, other: &TaskResponse) -> bool {
        match (self, other) {
            (TaskResponse::Phase1(a), TaskResponse::Phase1(b)) => {
                std::mem::discriminant(a) == std::mem::discriminant(b)
            }
            (TaskResponse::Error(_), TaskResponse::Error(_)) => true,
            _ => self == other,
        }
    }

    /// Responses that confirm the operation.
    pub fn is_positive(&self) -> bool {
        match self {
            TaskResponse::Phase1(outcome) => outcome.is_success(),
            TaskResponse::Error(_) => false,
            _ => true,
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, TaskResponse::Phase1(outcome) if outcome.is_contention())
    }
}

impl Display for TaskResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskResponse::Ack => f.write_str("ok"),
            TaskResponse::Phase1(outcome) => write!(f, "{outcome}"),
            TaskResponse::Phase2 { applied } => write!(f, "phase2 applied={applied}"),
            TaskResponse::Records(records) => write!(f, "{} records", records.len()),
            TaskResponse::ClusterTail(tail) => match tail {
                Some(position) => write!(f, "tail {position}"),
                None => f.write_str("empty cluster"),
            },
            TaskResponse::Fixed { applied } => write!(f, "fixed {applied}"),
            TaskResponse::Error(message) => write!(f, "error: {message}"),
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// A task addressed to one database on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub database: String,
    pub sender: NodeName,
    pub task: Task,
}

/// A node's reply to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    pub database: String,
    pub executor: NodeName,
    pub payload: TaskResponse,
}
