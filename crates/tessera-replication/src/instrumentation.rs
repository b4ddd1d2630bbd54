//! Replication metrics.
//!
//! Each open database owns one [`Metrics`] instance; nothing is global.
//! Counters are relaxed atomics and the commit latency histogram has fixed
//! buckets, so recording never blocks a worker.
//!
//! [`Metrics::snapshot`] is the status dump returned by
//! [`DistributedDatabase::metrics`](crate::DistributedDatabase::metrics);
//! [`Metrics::export_prometheus`] renders the same counters in exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bounds (ms) of the commit latency buckets.
const LATENCY_BOUNDS_MS: [f64; 9] = [1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

#[derive(Debug, Default)]
pub struct Metrics {
    // === Messaging ===
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    requests_executed: AtomicU64,
    send_failures: AtomicU64,

    // === Transactions ===
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    transactions_retried: AtomicU64,
    lock_conflicts: AtomicU64,
    quorum_failures: AtomicU64,
    collectors_timed_out: AtomicU64,

    commit_latency_buckets: [AtomicU64; 9],
    commit_latency_sum_ns: AtomicU64,
    commit_latency_count: AtomicU64,

    // === Repair ===
    records_repaired: AtomicU64,
    records_canceled: AtomicU64,
    clusters_repaired: AtomicU64,
    repair_cycles: AtomicU64,
    repair_time_ns: AtomicU64,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    pub fn add_requests_sent(&self, count: u64) {
        self.requests_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_requests_executed(&self) {
        self.requests_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn increment_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rolled_back(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retries(&self, retries: u64) {
        self.transactions_retried.fetch_add(retries, Ordering::Relaxed);
    }

    /// Lock conflicts are counted by the lock table; the database copies the
    /// running total here when a snapshot is taken.
    pub fn set_lock_conflicts(&self, conflicts: u64) {
        self.lock_conflicts.store(conflicts, Ordering::Relaxed);
    }

    pub fn increment_quorum_failures(&self) {
        self.quorum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_collectors_timed_out(&self) {
        self.collectors_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the wall time of one `commit` call.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_commit_latency(&self, latency: Duration) {
        let ns = nanos(latency);
        self.commit_latency_sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.commit_latency_count.fetch_add(1, Ordering::Relaxed);
        let ms = ns as f64 / 1_000_000.0;
        if let Some(bucket) = LATENCY_BOUNDS_MS.iter().position(|bound| ms <= *bound) {
            self.commit_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Repair
    // ========================================================================

    pub fn add_records_repaired(&self, count: u64) {
        self.records_repaired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_records_canceled(&self) {
        self.records_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_clusters_repaired(&self) {
        self.clusters_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repair_cycle(&self, elapsed: Duration) {
        self.repair_cycles.fetch_add(1, Ordering::Relaxed);
        self.repair_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    // ========================================================================
    // Export
    // ========================================================================

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_sent: load(&self.requests_sent),
            requests_received: load(&self.requests_received),
            requests_executed: load(&self.requests_executed),
            send_failures: load(&self.send_failures),
            transactions_committed: load(&self.transactions_committed),
            transactions_rolled_back: load(&self.transactions_rolled_back),
            transactions_retried: load(&self.transactions_retried),
            lock_conflicts: load(&self.lock_conflicts),
            quorum_failures: load(&self.quorum_failures),
            collectors_timed_out: load(&self.collectors_timed_out),
            commit_latency_count: load(&self.commit_latency_count),
            commit_latency_sum_ms: load(&self.commit_latency_sum_ns) / 1_000_000,
            records_repaired: load(&self.records_repaired),
            records_canceled: load(&self.records_canceled),
            clusters_repaired: load(&self.clusters_repaired),
            repair_cycles: load(&self.repair_cycles),
            repair_time_ms: load(&self.repair_time_ns) / 1_000_000,
            pending_repairs: 0,
            open_contexts: 0,
            held_locks: 0,
        }
    }

    /// Exports the counters and the commit latency histogram in Prometheus
    /// exposition format, labelled with the database name.
    #[allow(clippy::cast_precision_loss)]
    pub fn export_prometheus(&self, database: &str) -> String {
        use std::fmt::Write;
        let mut output = String::new();
        let snapshot = self.snapshot();

        let counters = [
            ("tessera_requests_sent_total", "Requests sent to replicas", snapshot.requests_sent),
            ("tessera_requests_executed_total", "Requests executed locally", snapshot.requests_executed),
            ("tessera_transactions_committed_total", "Transactions committed", snapshot.transactions_committed),
            ("tessera_transactions_rolled_back_total", "Transactions rolled back", snapshot.transactions_rolled_back),
            ("tessera_quorum_failures_total", "Requests that missed their quorum", snapshot.quorum_failures),
            ("tessera_records_repaired_total", "Records fixed by repair", snapshot.records_repaired),
        ];
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n\
                 # TYPE {name} counter\n\
                 {name}{{database=\"{database}\"}} {value}\n"
            );
        }

        output.push_str(
            "# HELP tessera_commit_latency_ms Commit latency histogram\n\
             # TYPE tessera_commit_latency_ms histogram\n",
        );
        let mut cumulative = 0u64;
        for (bucket, bound) in self.commit_latency_buckets.iter().zip(LATENCY_BOUNDS_MS) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "tessera_commit_latency_ms_bucket{{database=\"{database}\",le=\"{bound}\"}} {cumulative}",
            );
        }
        let count = self.commit_latency_count.load(Ordering::Relaxed);
        let _ = write!(
            output,
            "tessera_commit_latency_ms_bucket{{database=\"{database}\",le=\"+Inf\"}} {count}\n\
             tessera_commit_latency_ms_sum{{database=\"{database}\"}} {}\n\
             tessera_commit_latency_ms_count{{database=\"{database}\"}} {count}\n",
            self.commit_latency_sum_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        );
        output
    }
}

/// Point-in-time view of one database's replication activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub requests_executed: u64,
    pub send_failures: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_retried: u64,
    pub lock_conflicts: u64,
    pub quorum_failures: u64,
    pub collectors_timed_out: u64,
    pub commit_latency_count: u64,
    pub commit_latency_sum_ms: u64,
    pub records_repaired: u64,
    pub records_canceled: u64,
    pub clusters_repaired: u64,
    pub repair_cycles: u64,
    pub repair_time_ms: u64,
    // Gauges filled in by the database.
    pub pending_repairs: u64,
    pub open_contexts: u64,
    pub held_locks: u64,
}
