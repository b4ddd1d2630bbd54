//! Per-database replication session.
//!
//! A [`DistributedDatabase`] is opened once per database on each node and
//! owns everything replication needs for it: the lock table, transaction
//! contexts, sequencer, open collectors, repair queue, worker pool and
//! metrics. Nothing is shared between databases and nothing is global, so
//! several databases (or several simulated nodes) coexist in one process.
//!
//! # Threads
//!
//! ```text
//! caller ──commit()──► coordinator ──Phase1/Phase2──► peers
//!
//! peer ──on_request()──► dispatcher ──► worker N ──respond──► peer
//! peer ──on_response()──► registry ──► waiting collector
//!
//! maintenance ── purge tick ──► collector timeouts, context expiry
//!             ◄─ collector events ── registry
//! repairer    ── check tick ──► cluster repair, record repair
//! ```
//!
//! The handlers themselves are split by concern:
//! - `messenger`: request ids, fan-out and quorum computation
//! - `participant`: executing inbound tasks against local storage
//! - `coordinator`: the two-phase commit driver
//! - `repair`: cluster and record repair cycles

mod coordinator;
mod messenger;
mod participant;
mod repair;

pub use coordinator::CommitReceipt;
pub use repair::RepairReport;

use std::fmt::{self, Display};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, select};
use tessera_config::TesseraConfig;
use tessera_types::{ClusterId, NodeId, NodeName, RecordId, RequestId};

use crate::collector::{CollectorEvent, ResponseRegistry};
use crate::context::ContextTable;
use crate::dispatch::{Dispatcher, DispatcherConfig, RequestHandler};
use crate::error::{ReplicationError, Result};
use crate::instrumentation::{Metrics, MetricsSnapshot};
use crate::locks::LockTable;
use crate::membership::Membership;
use crate::repair::{RepairQueue, ResolverChain};
use crate::retry::BoundedRetry;
use crate::sequence::TransactionSequence;
use crate::storage::{Storage, StorageError, StorageResult};
use crate::task::{QuorumType, RequestEnvelope, ResponseEnvelope, Task, TaskResponse, Transaction};
use crate::transport::Transport;

/// The services a database session runs on top of.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub membership: Arc<dyn Membership>,
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    Online,
    /// A storage fault was raised; every new operation is refused.
    Offline,
    Closed,
}

impl Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseStatus::Online => f.write_str("ONLINE"),
            DatabaseStatus::Offline => f.write_str("OFFLINE"),
            DatabaseStatus::Closed => f.write_str("CLOSED"),
        }
    }
}

// ============================================================================
// Core
// ============================================================================

/// State shared by the caller threads, the workers and the background threads.
pub(crate) struct DatabaseCore {
    name: String,
    local: NodeName,
    local_id: NodeId,
    config: TesseraConfig,

    transport: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
    storage: Arc<dyn Storage>,

    locks: Arc<LockTable>,
    sequence: Arc<TransactionSequence>,
    contexts: ContextTable,
    registry: ResponseRegistry,
    repair: RepairQueue,
    resolvers: ResolverChain,
    metrics: Metrics,

    tx_retry: BoundedRetry,
    status: Mutex<DatabaseStatus>,
    next_request: AtomicU64,
}

impl DatabaseCore {
    fn status(&self) -> DatabaseStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<()> {
        match self.status() {
            DatabaseStatus::Online => Ok(()),
            DatabaseStatus::Offline => Err(ReplicationError::DatabaseOffline(self.name.clone())),
            DatabaseStatus::Closed => Err(ReplicationError::Shutdown),
        }
    }

    /// Runs a storage operation. A fault takes the database offline.
    fn storage_call<T>(&self, op: impl FnOnce(&dyn Storage) -> StorageResult<T>) -> Result<T> {
        op(self.storage.as_ref()).map_err(|fault| {
            self.go_offline(&fault);
            ReplicationError::Storage(fault)
        })
    }

    fn go_offline(&self, fault: &StorageError) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == DatabaseStatus::Online {
            *status = DatabaseStatus::Offline;
            tracing::error!(
                database = %self.name,
                node = %self.local,
                error = %fault,
                "storage fault, database is now offline"
            );
        }
    }

    /// Every server of the given clusters, the local node included.
    fn replicas_for(&self, clusters: &[ClusterId]) -> Vec<NodeName> {
        let mut servers: Vec<NodeName> = clusters
            .iter()
            .flat_map(|cluster| self.membership.servers(*cluster))
            .collect();
        servers.sort();
        servers.dedup();
        servers
    }

    /// Periodic housekeeping: collector timeouts and abandoned contexts.
    fn purge(&self) {
        let now = Instant::now();
        let collectors = self.registry.purge_expired(now);
        let contexts = self
            .contexts
            .expire(self.config.transactions.context_timeout(), now);
        self.metrics.set_lock_conflicts(self.locks.conflicts());
        if collectors > 0 || contexts > 0 {
            tracing::debug!(
                database = %self.name,
                collectors,
                contexts,
                "purged expired requests"
            );
        }
    }

    fn on_collector_event(&self, event: CollectorEvent) {
        match event {
            CollectorEvent::Completed { request_id, kind } => {
                tracing::trace!(request = %request_id, task = %kind, "request completed");
            }
            CollectorEvent::TimedOut {
                request_id,
                kind,
                missing,
                records,
            } => {
                self.metrics.increment_collectors_timed_out();
                if !missing.is_empty() {
                    let queued = self.repair.enqueue_records(records);
                    if queued > 0 {
                        tracing::info!(
                            request = %request_id,
                            task = %kind,
                            queued,
                            "queued records of timed out request for repair"
                        );
                    }
                }
            }
        }
    }

    /// Forgets everything tied to a node that left the cluster.
    fn handle_unreachable(&self, node: &NodeName) {
        let collectors = self.registry.remove_unreachable(node);
        let (contexts, locks) = self.transport.node_id(node).map_or((0, 0), |id| {
            (
                self.contexts.destroy_owned_by(id),
                self.locks.release_owned_by(id),
            )
        });
        let orphaned = self.membership.owned_clusters(node);
        for cluster in &orphaned {
            self.repair.enqueue_cluster(*cluster);
        }
        tracing::warn!(
            database = %self.name,
            node = %node,
            collectors,
            contexts,
            locks,
            orphaned = orphaned.len(),
            "node unreachable"
        );
    }

    fn reply_error(&self, request_id: RequestId, sender: &NodeName, task: &Task, message: String) {
        if task.traits().quorum_type == QuorumType::None {
            return;
        }
        self.send_response(
            sender,
            ResponseEnvelope {
                request_id,
                database: self.name.clone(),
                executor: self.local.clone(),
                payload: TaskResponse::Error(message),
            },
        );
    }

    fn send_response(&self, target: &NodeName, envelope: ResponseEnvelope) {
        let request_id = envelope.request_id;
        if let Err(err) = self.transport.send_response(target, envelope) {
            self.metrics.increment_send_failures();
            tracing::warn!(
                request = %request_id,
                target = %target,
                error = %err,
                "failed to send response"
            );
        }
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.set_lock_conflicts(self.locks.conflicts());
        let mut snapshot = self.metrics.snapshot();
        snapshot.pending_repairs = self.repair.pending_records() as u64;
        snapshot.open_contexts = self.contexts.len() as u64;
        snapshot.held_locks = self.locks.len() as u64;
        snapshot
    }
}

impl RequestHandler for DatabaseCore {
    fn execute(&self, request: &RequestEnvelope) -> Result<TaskResponse> {
        self.metrics.increment_requests_executed();
        self.ensure_online()?;
        self.execute_task(request)
    }

    fn respond(&self, request: &RequestEnvelope, response: TaskResponse) {
        if request.task.traits().quorum_type == QuorumType::None {
            return;
        }
        self.send_response(
            &request.sender,
            ResponseEnvelope {
                request_id: request.request_id,
                database: self.name.clone(),
                executor: self.local.clone(),
                payload: response,
            },
        );
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct Background {
    /// Dropping the sender stops the background threads.
    stop: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

/// One open database on this node.
pub struct DistributedDatabase {
    core: Arc<DatabaseCore>,
    dispatcher: Dispatcher,
    background: Mutex<Background>,
}

impl DistributedDatabase {
    /// Opens the session: validates the configuration, starts the worker
    /// pool, the maintenance thread and, if enabled, the repair thread.
    pub fn open(config: TesseraConfig, collaborators: Collaborators) -> Result<Self> {
        config
            .validate()
            .map_err(|err| ReplicationError::Configuration(err.to_string()))?;
        let resolvers = ResolverChain::from_names(&config.repair.resolver_chain)?;

        let name = config.database.name.clone();
        let local = collaborators.transport.local_node().clone();
        let local_id = NodeId::new(config.node.id);
        let slots = config.transactions.sequence_slots;
        let start = usize::try_from(config.node.id).unwrap_or(0);

        let locks = Arc::new(LockTable::new(BoundedRetry::for_locks(&config.locks)));
        let sequence = Arc::new(TransactionSequence::new(slots, start));
        let (registry, events) = ResponseRegistry::new();

        let core = Arc::new(DatabaseCore {
            contexts: ContextTable::new(Arc::clone(&locks), Arc::clone(&sequence)),
            tx_retry: BoundedRetry::for_transactions(&config.transactions),
            name,
            local,
            local_id,
            transport: collaborators.transport,
            membership: collaborators.membership,
            storage: collaborators.storage,
            locks,
            sequence,
            registry,
            repair: RepairQueue::new(),
            resolvers,
            metrics: Metrics::new(),
            status: Mutex::new(DatabaseStatus::Online),
            next_request: AtomicU64::new(1),
            config,
        });

        let dispatcher = Dispatcher::start(
            DispatcherConfig::from_replication(&core.config.replication, &core.name),
            Arc::clone(&core),
        )?;

        let database = Self {
            core,
            dispatcher,
            background: Mutex::new(Background::default()),
        };
        database.start_background(events)?;

        tracing::info!(
            database = %database.core.name,
            node = %database.core.local,
            resolvers = ?database.core.resolvers.names(),
            "database opened"
        );
        Ok(database)
    }

    fn start_background(&self, events: Receiver<CollectorEvent>) -> Result<()> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        background.stop = Some(stop);

        let core = Arc::clone(&self.core);
        let ticker = crossbeam_channel::tick(core.config.replication.purge_interval());
        let stop_maintenance = stopped.clone();
        let handle = spawn(format!("tessera-{}-maintenance", core.name), move || {
            loop {
                select! {
                    recv(stop_maintenance) -> _ => break,
                    recv(ticker) -> _ => core.purge(),
                    recv(events) -> event => match event {
                        Ok(event) => core.on_collector_event(event),
                        Err(_) => break,
                    },
                }
            }
        })?;
        background.handles.push(handle);

        if let Some(interval) = self.core.config.repair.check_interval() {
            let core = Arc::clone(&self.core);
            let ticker = crossbeam_channel::tick(interval);
            let handle = spawn(format!("tessera-{}-repair", core.name), move || {
                loop {
                    select! {
                        recv(stopped) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(err) = core.run_repair_cycle() {
                                tracing::warn!(database = %core.name, error = %err, "repair cycle failed");
                            }
                        }
                    }
                }
            })?;
            background.handles.push(handle);
        }
        Ok(())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Commits `transaction` across the replicas of every cluster it touches.
    ///
    /// Lock contention, concurrent creates and sequencing conflicts are retried
    /// with a fresh transaction id up to `transactions.max_autoretry` times.
    /// Conflicts that a retry cannot fix are returned at once.
    pub fn commit(&self, transaction: Transaction) -> Result<CommitReceipt> {
        self.core.commit(transaction)
    }

    /// Entry point for a request from a peer. Never blocks on execution; a
    /// refused request is answered with an error payload.
    pub fn on_request(&self, envelope: RequestEnvelope) {
        self.core.metrics.increment_requests_received();
        let request_id = envelope.request_id;
        let sender = envelope.sender.clone();
        let task = envelope.task.clone();

        let accepted = self
            .core
            .ensure_online()
            .and_then(|()| self.dispatcher.submit(envelope));
        if let Err(err) = accepted {
            tracing::debug!(
                request = %request_id,
                sender = %sender,
                error = %err,
                "refused request"
            );
            self.core.reply_error(request_id, &sender, &task, err.to_string());
        }
    }

    /// Entry point for a peer's reply to one of our requests.
    pub fn on_response(&self, envelope: ResponseEnvelope) {
        self.core.registry.on_response(envelope);
    }

    /// Called by the membership layer when `node` leaves.
    pub fn on_node_unreachable(&self, node: &NodeName) {
        self.core.handle_unreachable(node);
    }

    /// Queues a record for repair. Temporary ids are ignored.
    pub fn enqueue_repair_record(&self, record: RecordId) -> bool {
        self.core.repair.enqueue_record(record)
    }

    pub fn enqueue_repair_cluster(&self, cluster: ClusterId) {
        self.core.repair.enqueue_cluster(cluster);
    }

    pub fn cancel_repair_record(&self, record: RecordId) -> bool {
        let canceled = self.core.repair.cancel_record(record);
        if canceled {
            self.core.metrics.increment_records_canceled();
        }
        canceled
    }

    /// Runs one repair cycle on the calling thread.
    pub fn repair_now(&self) -> Result<RepairReport> {
        self.core.run_repair_cycle()
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn local_node(&self) -> &NodeName {
        &self.core.local
    }

    pub fn status(&self) -> DatabaseStatus {
        self.core.status()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics_snapshot()
    }

    pub fn export_prometheus(&self) -> String {
        self.core.metrics.set_lock_conflicts(self.core.locks.conflicts());
        self.core.metrics.export_prometheus(&self.core.name)
    }

    pub fn pending_repairs(&self) -> usize {
        self.core.repair.pending_records()
    }

    pub fn pending_cluster_repairs(&self) -> usize {
        self.core.repair.pending_clusters()
    }

    pub fn held_locks(&self) -> usize {
        self.core.locks.len()
    }

    pub fn open_contexts(&self) -> usize {
        self.core.contexts.len()
    }

    /// Stops the workers and background threads and drops every open
    /// context, lock and collector. Idempotent.
    pub fn close(&self) {
        {
            let mut status = self.core.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status == DatabaseStatus::Closed {
                return;
            }
            *status = DatabaseStatus::Closed;
        }

        self.dispatcher.shutdown();

        let handles = {
            let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
            background.stop = None;
            std::mem::take(&mut background.handles)
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(database = %self.core.name, "background thread panicked");
            }
        }

        self.core.registry.cancel_all();
        let contexts = self.core.contexts.clear();
        self.core.locks.clear();
        tracing::info!(
            database = %self.core.name,
            node = %self.core.local,
            contexts,
            "database closed"
        );
    }
}

impl Drop for DistributedDatabase {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DistributedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedDatabase")
            .field("name", &self.core.name)
            .field("node", &self.core.local)
            .field("status", &self.core.status())
            .finish_non_exhaustive()
    }
}

fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| ReplicationError::ThreadSpawn { name, source })
}
