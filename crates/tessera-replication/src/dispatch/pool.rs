//! Partitioned worker pool.
//!
//! Routes every inbound request to one of N single-threaded workers by
//! `cluster mod N`. Each worker owns a bounded inbox and executes strictly in
//! arrival order, so requests for one cluster never run concurrently and never
//! overtake each other.
//!
//! # Barriers
//!
//! Requests that span clusters on several workers, or that belong to no
//! cluster at all, go through a barrier. A marker is injected into every
//! target worker's inbox under one lock, so concurrent barriers are seen in
//! the same order by every worker. Idle workers get a marker too: without one,
//! work submitted after the request could start on them before it ran.
//! The dispatcher waits until each target has parked on its marker, then
//! hands the request to the first target. The others stay parked until it
//! finishes, which linearizes the request between everything queued before it
//! and everything queued after. Only the dispatcher thread blocks until the
//! markers arrive; the parked workers are what holds later work back while
//! the request runs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tessera_config::ReplicationConfig;

use super::queue::{BoundedQueue, PushResult};
use crate::error::{ReplicationError, Result};
use crate::task::{Partition, RequestEnvelope, TaskResponse};

/// How long an idle worker or a parked barrier waits before re-checking for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// How long `submit` blocks on a full inbox before reporting overload.
    pub push_timeout: Duration,
    /// How long shutdown lets workers drain before force-closing.
    pub shutdown_timeout: Duration,
    pub thread_prefix: String,
}

impl DispatcherConfig {
    pub fn from_replication(config: &ReplicationConfig, database: &str) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            push_timeout: config.synchronous_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            thread_prefix: format!("tessera-{database}"),
        }
    }
}

/// Maps a cluster to its worker.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRouter {
    worker_count: usize,
}

impl PartitionRouter {
    /// # Panics
    ///
    /// Panics if `worker_count` is 0.
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be positive");
        Self { worker_count }
    }

    pub fn route(&self, cluster: u32) -> usize {
        cluster as usize % self.worker_count
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

/// Executes requests on the worker threads.
pub trait RequestHandler: Send + Sync + 'static {
    fn execute(&self, request: &RequestEnvelope) -> Result<TaskResponse>;

    /// Delivers the result of `execute`, including wrapped failures.
    fn respond(&self, request: &RequestEnvelope, response: TaskResponse);
}

enum WorkItem {
    Request(RequestEnvelope),
    Barrier(BarrierMarker),
}

struct BarrierMarker {
    arrived: Sender<usize>,
    role: BarrierRole,
}

enum BarrierRole {
    /// Runs the request once every target has parked; dropping `release`
    /// frees the others.
    Execute {
        request: Receiver<RequestEnvelope>,
        release: Sender<()>,
    },
    Wait {
        release: Receiver<()>,
    },
}

impl BarrierMarker {
    fn pass<H: RequestHandler + ?Sized>(self, worker: usize, handler: &H, shared: &Shared) {
        let _ = self.arrived.send(worker);
        match self.role {
            BarrierRole::Execute { request, release } => {
                if let Ok(request) = request.recv() {
                    execute(handler, &request);
                }
                drop(release);
            }
            BarrierRole::Wait { release } => loop {
                match release.recv_timeout(IDLE_POLL) {
                    Err(RecvTimeoutError::Timeout) if !shared.force_stop.load(Ordering::Acquire) => {}
                    _ => break,
                }
            },
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    closing: AtomicBool,
    force_stop: AtomicBool,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    router: PartitionRouter,
    queues: Vec<Arc<BoundedQueue<WorkItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    barrier_lock: Mutex<()>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawns one named thread per worker.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` or `queue_capacity` is 0.
    pub fn start<H: RequestHandler>(config: DispatcherConfig, handler: Arc<H>) -> Result<Self> {
        let router = PartitionRouter::new(config.worker_count);
        let queues: Vec<_> = (0..config.worker_count)
            .map(|_| Arc::new(BoundedQueue::new(config.queue_capacity)))
            .collect();
        let shared = Arc::new(Shared::default());

        let mut handles = Vec::with_capacity(config.worker_count);
        for (worker, queue) in queues.iter().enumerate() {
            let name = format!("{}-worker-{worker}", config.thread_prefix);
            let queue = Arc::clone(queue);
            let handler = Arc::clone(&handler);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker, &queue, handler.as_ref(), &worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    shared.force_stop.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(ReplicationError::ThreadSpawn { name, source });
                }
            }
        }

        tracing::info!(
            workers = config.worker_count,
            capacity = config.queue_capacity,
            "dispatcher started"
        );
        Ok(Self {
            config,
            router,
            queues,
            handles: Mutex::new(handles),
            barrier_lock: Mutex::new(()),
            shared,
        })
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn worker_count(&self) -> usize {
        self.router.worker_count()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|queue| queue.len()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.closing.load(Ordering::Acquire)
    }

    /// Queues `request` on the worker(s) its partition maps to.
    pub fn submit(&self, request: RequestEnvelope) -> Result<()> {
        if !self.is_running() {
            return Err(ReplicationError::Shutdown);
        }
        match request.task.partition() {
            Partition::Cluster(cluster) => {
                self.push(self.router.route(cluster), WorkItem::Request(request))
            }
            Partition::Any => self.push(self.least_loaded(), WorkItem::Request(request)),
            Partition::Clusters(clusters) => {
                let mut targets: Vec<usize> =
                    clusters.iter().map(|cluster| self.router.route(*cluster)).collect();
                targets.sort_unstable();
                targets.dedup();
                self.barrier(&targets, request)
            }
            Partition::Broadcast => {
                let targets: Vec<usize> = (0..self.worker_count()).collect();
                self.barrier(&targets, request)
            }
        }
    }

    fn least_loaded(&self) -> usize {
        self.queues
            .iter()
            .enumerate()
            .min_by_key(|(_, queue)| queue.len())
            .map_or(0, |(worker, _)| worker)
    }

    fn push(&self, worker: usize, item: WorkItem) -> Result<()> {
        match self.queues[worker].push_timeout(item, self.config.push_timeout) {
            PushResult::Ok => Ok(()),
            PushResult::Backpressure(_) => {
                tracing::warn!(worker, "worker queue full");
                Err(ReplicationError::Overloaded { partition: worker })
            }
        }
    }

    fn barrier(&self, targets: &[usize], request: RequestEnvelope) -> Result<()> {
        let Some((executor, waiters)) = targets.split_first() else {
            return Ok(());
        };
        if waiters.is_empty() {
            return self.push(*executor, WorkItem::Request(request));
        }

        let (arrived_tx, arrived_rx) = crossbeam_channel::bounded(targets.len());
        let (request_tx, request_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        {
            let _ordered = self
                .barrier_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.push(
                *executor,
                WorkItem::Barrier(BarrierMarker {
                    arrived: arrived_tx.clone(),
                    role: BarrierRole::Execute {
                        request: request_rx,
                        release: release_tx,
                    },
                }),
            )?;
            for worker in waiters {
                self.push(
                    *worker,
                    WorkItem::Barrier(BarrierMarker {
                        arrived: arrived_tx.clone(),
                        role: BarrierRole::Wait {
                            release: release_rx.clone(),
                        },
                    }),
                )?;
            }
        }
        drop(arrived_tx);
        drop(release_rx);

        tracing::debug!(
            request = %request.request_id,
            workers = targets.len(),
            "waiting for barrier"
        );
        let mut pending = targets.len();
        while pending > 0 {
            match arrived_rx.recv_timeout(IDLE_POLL) {
                Ok(_) => pending -= 1,
                Err(RecvTimeoutError::Timeout) if !self.shared.force_stop.load(Ordering::Acquire) => {}
                Err(_) => return Err(ReplicationError::Shutdown),
            }
        }
        request_tx
            .send(request)
            .map_err(|_| ReplicationError::Shutdown)
    }

    /// Stops accepting work, lets workers drain up to the shutdown timeout,
    /// then force-closes and joins them. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.is_empty() {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while handles.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handles.iter().any(|handle| !handle.is_finished()) {
            let pending: usize = self.queue_depths().iter().sum();
            tracing::warn!(pending, "dispatcher did not drain in time, forcing shutdown");
            self.shared.force_stop.store(true, Ordering::Release);
        }
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<H: RequestHandler + ?Sized>(
    worker: usize,
    queue: &BoundedQueue<WorkItem>,
    handler: &H,
    shared: &Shared,
) {
    while !shared.force_stop.load(Ordering::Acquire) {
        match queue.pop_timeout(IDLE_POLL) {
            Some(WorkItem::Request(request)) => execute(handler, &request),
            Some(WorkItem::Barrier(marker)) => marker.pass(worker, handler, shared),
            None if shared.closing.load(Ordering::Acquire) => break,
            None => {}
        }
    }
    tracing::debug!(worker, "worker stopped");
}

/// Runs one request. Errors and panics become an error response; the worker
/// keeps going either way.
fn execute<H: RequestHandler + ?Sized>(handler: &H, request: &RequestEnvelope) {
    let response = match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(request))) {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::warn!(
                request = %request.request_id,
                task = %request.task.kind(),
                error = %err,
                "task failed"
            );
            TaskResponse::Error(err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                request = %request.request_id,
                task = %request.task.kind(),
                panic = %message,
                "task panicked"
            );
            TaskResponse::Error(message)
        }
    };
    if panic::catch_unwind(AssertUnwindSafe(|| handler.respond(request, response))).is_err() {
        tracing::error!(request = %request.request_id, "response delivery panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ReadRecords, RecordWrite, Task};
    use std::collections::HashSet;
    use tessera_types::{ClusterId, NodeId, NodeName, RecordId, RequestId};

    const FAIL: i64 = -100;
    const PANIC: i64 = -200;
    const GATED: i64 = -300;
    const SLOW: i64 = -400;

    struct Recorder {
        log: Mutex<Vec<u64>>,
        responses: Sender<(u64, TaskResponse)>,
        gate: Receiver<()>,
    }

    impl RequestHandler for Recorder {
        fn execute(&self, request: &RequestEnvelope) -> Result<TaskResponse> {
            if let Task::Write(write) = &request.task {
                match write.record().position() {
                    FAIL => return Err(ReplicationError::Configuration("bad task".into())),
                    PANIC => panic!("boom"),
                    GATED => {
                        let _ = self.gate.recv_timeout(Duration::from_secs(5));
                    }
                    SLOW => thread::sleep(Duration::from_millis(50)),
                    _ => {}
                }
            }
            self.log.lock().unwrap().push(request.request_id.sequence());
            Ok(TaskResponse::Ack)
        }

        fn respond(&self, request: &RequestEnvelope, response: TaskResponse) {
            let _ = self.responses.send((request.request_id.sequence(), response));
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        recorder: Arc<Recorder>,
        responses: Receiver<(u64, TaskResponse)>,
        gate: Sender<()>,
    }

    fn harness(workers: usize, capacity: usize) -> Harness {
        let (responses_tx, responses) = crossbeam_channel::unbounded();
        let (gate, gate_rx) = crossbeam_channel::unbounded();
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
            responses: responses_tx,
            gate: gate_rx,
        });
        let config = DispatcherConfig {
            worker_count: workers,
            queue_capacity: capacity,
            push_timeout: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            thread_prefix: "test".into(),
        };
        Harness {
            dispatcher: Dispatcher::start(config, Arc::clone(&recorder)).unwrap(),
            recorder,
            responses,
            gate,
        }
    }

    fn envelope(seq: u64, task: Task) -> RequestEnvelope {
        RequestEnvelope {
            request_id: RequestId::new(NodeId::new(1), seq),
            database: "db".into(),
            sender: NodeName::from("node-1"),
            task,
        }
    }

    fn on_cluster(seq: u64, cluster: u32, position: i64) -> RequestEnvelope {
        envelope(
            seq,
            Task::Write(RecordWrite::Delete {
                record: RecordId::new(ClusterId::new(cluster), position),
            }),
        )
    }

    fn broadcast(seq: u64) -> RequestEnvelope {
        envelope(seq, Task::Read(ReadRecords { records: Vec::new() }))
    }

    fn wait_for(h: &Harness, count: usize) -> Vec<(u64, TaskResponse)> {
        (0..count)
            .map(|_| h.responses.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect()
    }

    #[test]
    fn router_is_modular() {
        let router = PartitionRouter::new(4);
        assert_eq!(router.route(5), 1);
        assert_eq!(router.route(8), 0);
        let workers: HashSet<usize> = (0..100).map(|c| router.route(c)).collect();
        assert_eq!(workers.len(), 4);
    }

    #[test]
    #[should_panic(expected = "worker_count must be positive")]
    fn router_zero_workers_panics() {
        let _router = PartitionRouter::new(0);
    }

    #[test]
    fn same_partition_runs_in_submission_order() {
        let h = harness(4, 256);
        for seq in 0..100 {
            h.dispatcher.submit(on_cluster(seq, 6, 0)).unwrap();
        }
        wait_for(&h, 100);
        let log = h.recorder.log.lock().unwrap().clone();
        assert_eq!(log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn broadcast_is_linearized() {
        let h = harness(2, 16);
        h.dispatcher.submit(on_cluster(1, 0, SLOW)).unwrap();
        h.dispatcher.submit(broadcast(2)).unwrap();
        h.dispatcher.submit(on_cluster(3, 1, 0)).unwrap();
        wait_for(&h, 3);
        assert_eq!(*h.recorder.log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn idle_worker_holds_later_work_behind_broadcast() {
        let h = harness(2, 16);
        h.dispatcher.submit(on_cluster(1, 0, GATED)).unwrap();

        let dispatcher = &h.dispatcher;
        thread::scope(|scope| {
            let barrier = scope.spawn(move || dispatcher.submit(broadcast(2)));
            thread::sleep(Duration::from_millis(50));

            // Worker 1 had nothing queued, yet it is parked on the broadcast.
            dispatcher.submit(on_cluster(3, 1, 0)).unwrap();
            thread::sleep(Duration::from_millis(50));
            assert!(h.recorder.log.lock().unwrap().is_empty());

            h.gate.send(()).unwrap();
            barrier.join().unwrap().unwrap();
        });

        wait_for(&h, 3);
        assert_eq!(*h.recorder.log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failures_become_error_responses() {
        let h = harness(1, 16);
        h.dispatcher.submit(on_cluster(1, 0, FAIL)).unwrap();
        h.dispatcher.submit(on_cluster(2, 0, PANIC)).unwrap();
        h.dispatcher.submit(on_cluster(3, 0, 0)).unwrap();

        let responses = wait_for(&h, 3);
        assert!(matches!(&responses[0], (1, TaskResponse::Error(m)) if m.contains("bad task")));
        assert!(matches!(&responses[1], (2, TaskResponse::Error(m)) if m == "boom"));
        assert_eq!(responses[2], (3, TaskResponse::Ack));
    }

    #[test]
    fn full_queue_reports_overload() {
        let h = harness(1, 1);
        h.dispatcher.submit(on_cluster(1, 0, GATED)).unwrap();
        // Give the worker time to pick up the gated task so the inbox is empty.
        thread::sleep(Duration::from_millis(50));
        h.dispatcher.submit(on_cluster(2, 0, 0)).unwrap();
        assert!(matches!(
            h.dispatcher.submit(on_cluster(3, 0, 0)),
            Err(ReplicationError::Overloaded { partition: 0 })
        ));
        h.gate.send(()).unwrap();
        wait_for(&h, 2);
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_work() {
        let h = harness(2, 8);
        h.dispatcher.submit(on_cluster(1, 0, 0)).unwrap();
        h.dispatcher.shutdown();
        h.dispatcher.shutdown();
        assert!(!h.dispatcher.is_running());
        assert!(matches!(
            h.dispatcher.submit(on_cluster(2, 0, 0)),
            Err(ReplicationError::Shutdown)
        ));
        // Work queued before shutdown was drained.
        assert_eq!(*h.recorder.log.lock().unwrap(), vec![1]);
    }
}
