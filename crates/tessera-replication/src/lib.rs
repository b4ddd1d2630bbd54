//! Replication consistency core for Tessera.
//!
//! Keeps the replicas of a multi-master document database in agreement:
//! - Quorum collection of replies to fanned-out requests
//! - Record and unique-key locking with deadlock-free batch acquisition
//! - Partitioned request execution, ordered per cluster
//! - Two-phase transaction commit with a per-database sequencer
//! - Conflict resolution and repair of diverged or lagging replicas
//!
//! Storage, messaging and membership are collaborators behind the
//! [`Storage`], [`Transport`] and [`Membership`] traits. [`MemoryStorage`],
//! [`LocalNetwork`] and [`StaticMembership`] implement them in-process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera_config::TesseraConfig;
//! use tessera_replication::{
//!     Collaborators, DistributedDatabase, LocalNetwork, MemoryStorage, StaticMembership,
//!     Transaction,
//! };
//! use tessera_types::{ClusterId, NodeId};
//!
//! let config = TesseraConfig::testing();
//! let network = LocalNetwork::new();
//! let collaborators = Collaborators {
//!     transport: network.transport("node-0", NodeId::new(0)),
//!     membership: Arc::new(StaticMembership::new(config.layout.clone(), &config.replication)),
//!     storage: Arc::new(MemoryStorage::new()),
//! };
//! let database = Arc::new(DistributedDatabase::open(config, collaborators)?);
//! network.attach(&database);
//!
//! let mut tx = Transaction::new();
//! tx.create(ClusterId::new(1), "hello");
//! let receipt = database.commit(tx)?;
//! assert_eq!(receipt.created.len(), 1);
//! # Ok::<(), tessera_replication::ReplicationError>(())
//! ```

mod collector;
mod context;
mod database;
mod dispatch;
mod error;
pub mod instrumentation;
mod local;
mod locks;
mod membership;
pub mod repair;
mod retry;
mod sequence;
mod storage;
pub mod task;
mod transport;

pub use collector::{
    Collected, CollectorEvent, CollectorPhase, CollectorSnapshot, CollectorSpec, FinalResult,
    ResponseCollector, ResponseGroup, ResponseRegistry,
};
pub use context::{ContextTable, TxContext, TxStatus};
pub use database::{Collaborators, CommitReceipt, DatabaseStatus, DistributedDatabase, RepairReport};
pub use dispatch::{BoundedQueue, Dispatcher, DispatcherConfig, PartitionRouter, PushResult, RequestHandler};
pub use error::{ReplicationError, Result};
pub use instrumentation::{Metrics, MetricsSnapshot};
pub use local::{LocalNetwork, LocalTransport};
pub use locks::{LockTable, TryLock};
pub use membership::{Membership, StaticMembership};
pub use repair::{RepairQueue, ResolverChain};
pub use retry::BoundedRetry;
pub use sequence::{SequenceStatus, TransactionSequence};
pub use storage::{MemoryStorage, Storage, StorageError, StorageResult, StorageWrite};
pub use task::{
    QuorumType, RecordWrite, RequestEnvelope, ResponseEnvelope, ResultStrategy, Task, TaskKind,
    TaskResponse, Transaction, TxOutcome,
};
pub use transport::{Transport, TransportError};
