//! Workload driver for an in-process cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tessera_config::TesseraConfig;
use tessera_replication::{
    Collaborators, DistributedDatabase, LocalNetwork, MemoryStorage, MetricsSnapshot,
    StaticMembership, Storage, Transaction,
};
use tessera_types::{ClusterId, NodeId, NodeName, RecordId};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REPAIR_ROUNDS: usize = 10;

pub struct SimulationOptions {
    pub nodes: usize,
    pub transactions: usize,
    pub seed: u64,
    pub drop_rate: f64,
    pub clusters: u32,
}

struct SimNode {
    name: NodeName,
    database: Arc<DistributedDatabase>,
    storage: Arc<MemoryStorage>,
}

pub struct Simulation {
    network: Arc<LocalNetwork>,
    nodes: Vec<SimNode>,
    rng: StdRng,
}

/// What happened during a run.
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub nodes: usize,
    pub transactions: usize,
    pub committed: usize,
    /// Commits that left at least one replica behind.
    pub lagging_commits: usize,
    pub conflicts: usize,
    pub contention: usize,
    pub quorum_failures: usize,
    pub other_failures: usize,
    pub repair_rounds: usize,
    pub records_repaired: usize,
    /// Records fixed by the final full check rather than the repair queue.
    pub audit_repaired: usize,
    pub records: usize,
    pub converged: bool,
    pub elapsed_ms: u128,
    pub metrics: BTreeMap<String, MetricsSnapshot>,
}

impl SimulationReport {
    pub fn print(&self) {
        println!("seed {}: {} nodes, {} transactions", self.seed, self.nodes, self.transactions);
        println!(
            "  committed {} ({} with lagging replicas)",
            self.committed, self.lagging_commits
        );
        println!(
            "  failed: {} conflicts, {} contention, {} quorum, {} other",
            self.conflicts, self.contention, self.quorum_failures, self.other_failures
        );
        println!(
            "  repair: {} rounds, {} records, {} found by audit",
            self.repair_rounds, self.records_repaired, self.audit_repaired
        );
        println!(
            "  {} records, {} after {} ms",
            self.records,
            if self.converged { "converged" } else { "DIVERGED" },
            self.elapsed_ms
        );
    }
}

impl Simulation {
    pub fn start(base: TesseraConfig, options: &SimulationOptions) -> Result<Self> {
        let network = LocalNetwork::new();
        let names: Vec<String> = (0..options.nodes).map(|i| format!("node-{i}")).collect();

        let mut nodes = Vec::with_capacity(options.nodes);
        for (index, name) in names.iter().enumerate() {
            let id = u32::try_from(index).context("too many nodes")?;
            let mut config = base.clone();
            config.node.name.clone_from(name);
            config.node.id = id;
            config.layout.nodes.clone_from(&names);

            let storage = Arc::new(MemoryStorage::new());
            let membership = Arc::new(StaticMembership::new(config.layout.clone(), &config.replication));
            let collaborators = Collaborators {
                transport: network.transport(name.as_str(), NodeId::new(id)),
                membership,
                storage: Arc::<MemoryStorage>::clone(&storage),
            };
            let database = Arc::new(
                DistributedDatabase::open(config, collaborators)
                    .with_context(|| format!("opening database on {name}"))?,
            );
            network.attach(&database);
            nodes.push(SimNode {
                name: NodeName::from(name.as_str()),
                database,
                storage,
            });
        }

        Ok(Self {
            network,
            nodes,
            rng: StdRng::seed_from_u64(options.seed),
        })
    }

    pub fn run(mut self, options: &SimulationOptions) -> Result<SimulationReport> {
        let started = Instant::now();
        let mut report = SimulationReport {
            seed: options.seed,
            nodes: options.nodes,
            transactions: options.transactions,
            ..SimulationReport::default()
        };
        let mut known: Vec<RecordId> = Vec::new();

        for step in 0..options.transactions {
            let coordinator = self.rng.gen_range(0..self.nodes.len());
            let unreliable = self.pick_unreliable(coordinator, options.drop_rate);
            for node in &unreliable {
                self.network.drop_requests_to(node, true);
            }

            let tx = self.next_transaction(step, coordinator, &known, options.clusters)?;
            match self.nodes[coordinator].database.commit(tx) {
                Ok(receipt) => {
                    report.committed += 1;
                    if !receipt.lagging.is_empty() {
                        report.lagging_commits += 1;
                    }
                    known.extend(receipt.created);
                }
                Err(err) => {
                    tracing::debug!(step, error = %err, "transaction failed");
                    if err.is_fatal() {
                        return Err(err).context("database went offline");
                    } else if err.is_deterministic_conflict() {
                        report.conflicts += 1;
                    } else if err.is_retryable() {
                        report.contention += 1;
                    } else if err.is_quorum_failure() {
                        report.quorum_failures += 1;
                    } else {
                        report.other_failures += 1;
                    }
                }
            }

            for node in &unreliable {
                self.network.drop_requests_to(node, false);
            }
        }

        self.settle()?;
        for round in 1..=MAX_REPAIR_ROUNDS {
            report.repair_rounds = round;
            for node in &self.nodes {
                report.records_repaired += node.database.repair_now()?.records_repaired;
            }
            self.settle()?;
            if self.nodes.iter().all(|node| node.database.pending_repairs() == 0) {
                break;
            }
        }

        // Full check: every known record, through the first node.
        let auditor = &self.nodes[0].database;
        for record in &known {
            auditor.enqueue_repair_record(*record);
        }
        while auditor.pending_repairs() > 0 && report.audit_repaired < known.len() {
            let cycle = auditor.repair_now()?;
            report.audit_repaired += cycle.records_repaired;
            if cycle.records_checked == cycle.records_pending {
                break;
            }
        }

        report.records = self.nodes[0].storage.records().len();
        report.converged = self.converged();
        report.elapsed_ms = started.elapsed().as_millis();
        report.metrics = self
            .nodes
            .iter()
            .map(|node| (node.name.to_string(), node.database.metrics()))
            .collect();
        Ok(report)
    }

    fn pick_unreliable(&mut self, coordinator: usize, drop_rate: f64) -> Vec<NodeName> {
        let mut unreliable = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if index != coordinator && self.rng.gen_bool(drop_rate) {
                unreliable.push(node.name.clone());
            }
        }
        unreliable
    }

    /// Creates a record, or updates one the coordinator already knows about.
    fn next_transaction(
        &mut self,
        step: usize,
        coordinator: usize,
        known: &[RecordId],
        clusters: u32,
    ) -> Result<Transaction> {
        let content = Bytes::from(format!("step-{step}"));
        let mut tx = Transaction::new();

        if !known.is_empty() && self.rng.gen_bool(0.5) {
            let record = known[self.rng.gen_range(0..known.len())];
            if let Some(current) = self.nodes[coordinator].storage.read(record)? {
                tx.update(record, content, current.version);
                return Ok(tx);
            }
        }
        let cluster = ClusterId::new(self.rng.gen_range(1..=clusters));
        tx.create(cluster, content);
        Ok(tx)
    }

    /// Waits until no node holds a lock or an open transaction.
    fn settle(&self) -> Result<()> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while self
            .nodes
            .iter()
            .any(|node| node.database.held_locks() > 0 || node.database.open_contexts() > 0)
        {
            anyhow::ensure!(Instant::now() < deadline, "cluster did not settle");
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn converged(&self) -> bool {
        let snapshots: Vec<_> = self.nodes.iter().map(|node| node.storage.records()).collect();
        snapshots.windows(2).all(|pair| pair[0] == pair[1])
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.database.close();
        }
    }
}
