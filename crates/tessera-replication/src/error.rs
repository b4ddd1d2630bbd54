//! Error types for the replication layer.
//!
//! Errors fall into five families, and callers react differently to each:
//!
//! - **Contention** ([`ReplicationError::is_retryable`]): a lock or slot was
//!   busy. The coordinator retries the whole transaction with backoff.
//! - **Deterministic conflict** ([`ReplicationError::is_deterministic_conflict`]):
//!   the transaction can never succeed as written and is reported.
//! - **Partial failure**: no group of replicas agreed. The affected records
//!   are queued for repair.
//! - **Node failure**: a peer went away mid-request.
//! - **Fatal** ([`ReplicationError::is_fatal`]): local storage failed and the
//!   database was taken offline.

use tessera_types::{IndexKey, NodeName, RecordId, RequestId, TransactionId, Version};
use thiserror::Error;

use crate::storage::StorageError;
use crate::transport::TransportError;

pub type Result<T, E = ReplicationError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ReplicationError {
    // === Contention ===
    #[error("record {record} is locked by request {owner}")]
    RecordLocked { record: RecordId, owner: RequestId },

    #[error("index key {key} is locked by request {owner}")]
    KeyLocked { key: IndexKey, owner: RequestId },

    #[error("concurrent create: expected {expected} but the cluster is at {actual}")]
    ConcurrentCreate { expected: RecordId, actual: RecordId },

    #[error("transaction {tx} is out of sequence")]
    InvalidSequential { tx: TransactionId },

    #[error("every transaction sequence slot is promised")]
    SequenceExhausted,

    // === Deterministic conflicts ===
    #[error("record {record} was modified concurrently: expected {expected}, found {actual}")]
    ConcurrentModification {
        record: RecordId,
        expected: Version,
        actual: Version,
    },

    #[error("unique index key {key} already references {existing}, cannot index {record}")]
    UniqueIndexViolation {
        key: IndexKey,
        existing: RecordId,
        record: RecordId,
    },

    #[error("request {request} failed on node {node}: {message}")]
    Remote {
        request: RequestId,
        node: NodeName,
        message: String,
    },

    // === Partial failure ===
    #[error("request {request} didn't reach the quorum of {quorum}, responses: [{responses}]")]
    QuorumNotReached {
        request: RequestId,
        quorum: usize,
        responses: String,
    },

    #[error("quorum of {quorum} cannot be reached with {available} available nodes")]
    QuorumUnavailable { quorum: usize, available: usize },

    // === Node failure ===
    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeName),

    #[error(transparent)]
    Transport(#[from] TransportError),

    // === Fatal ===
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("database {0} is offline")]
    DatabaseOffline(String),

    // === Lifecycle ===
    #[error("database is shutting down")]
    Shutdown,

    #[error("worker queue for partition {partition} is full")]
    Overloaded { partition: usize },

    #[error("failed to start thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ReplicationError {
    /// Errors caused by transient contention; retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::RecordLocked { .. }
                | ReplicationError::KeyLocked { .. }
                | ReplicationError::ConcurrentCreate { .. }
                | ReplicationError::InvalidSequential { .. }
                | ReplicationError::SequenceExhausted
        )
    }

    /// Errors that will recur if the same transaction is submitted again.
    pub fn is_deterministic_conflict(&self) -> bool {
        matches!(
            self,
            ReplicationError::ConcurrentModification { .. }
                | ReplicationError::UniqueIndexViolation { .. }
                | ReplicationError::Remote { .. }
        )
    }

    /// Errors that take the local database offline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::Storage(_) | ReplicationError::DatabaseOffline(_)
        )
    }

    pub fn is_quorum_failure(&self) -> bool {
        matches!(
            self,
            ReplicationError::QuorumNotReached { .. } | ReplicationError::QuorumUnavailable { .. }
        )
    }
}
