//! Shared harness: N in-process nodes wired through a [`LocalNetwork`].

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tessera_config::TesseraConfig;
use tessera_replication::{
    Collaborators, DistributedDatabase, LocalNetwork, LocalTransport, MemoryStorage,
    RequestEnvelope, ResponseEnvelope, StaticMembership, Transaction, Transport, TransportError,
};
use tessera_types::{ClusterId, NodeId, NodeName, RawRecord, RecordId, Version};

pub const DATABASE: &str = "demo";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn node_name(index: usize) -> NodeName {
    NodeName::new(format!("node-{index}"))
}

pub fn rid(cluster: u32, position: i64) -> RecordId {
    RecordId::new(ClusterId::new(cluster), position)
}

pub fn value(content: &'static str, version: u32) -> RawRecord {
    RawRecord::new(content, Version::new(version))
}

/// A node's transport that keeps a copy of every response it sends.
pub struct ResponseTap {
    inner: Arc<LocalTransport>,
    sent: Mutex<Vec<ResponseEnvelope>>,
}

impl ResponseTap {
    pub fn new(inner: Arc<LocalTransport>) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn responses(&self) -> Vec<ResponseEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for ResponseTap {
    fn local_node(&self) -> &NodeName {
        self.inner.local_node()
    }

    fn send_request(&self, target: &NodeName, envelope: RequestEnvelope) -> Result<(), TransportError> {
        self.inner.send_request(target, envelope)
    }

    fn send_response(&self, target: &NodeName, envelope: ResponseEnvelope) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(envelope.clone());
        self.inner.send_response(target, envelope)
    }

    fn is_node_online(&self, node: &NodeName) -> bool {
        self.inner.is_node_online(node)
    }

    fn available_nodes(&self) -> BTreeSet<NodeName> {
        self.inner.available_nodes()
    }

    fn node_name(&self, id: NodeId) -> Option<NodeName> {
        self.inner.node_name(id)
    }

    fn node_id(&self, name: &NodeName) -> Option<NodeId> {
        self.inner.node_id(name)
    }
}

pub struct TestNode {
    pub name: NodeName,
    pub database: Arc<DistributedDatabase>,
    pub storage: Arc<MemoryStorage>,
    pub membership: Arc<StaticMembership>,
    pub tap: Arc<ResponseTap>,
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn start(size: usize) -> Self {
        Self::with_config(size, |_| {})
    }

    /// Starts `size` nodes; `tweak` adjusts each node's configuration.
    pub fn with_config(size: usize, tweak: impl Fn(&mut TesseraConfig)) -> Self {
        init_tracing();
        let network = LocalNetwork::new();
        let names: Vec<String> = (0..size).map(|i| node_name(i).to_string()).collect();

        let mut nodes = Vec::with_capacity(size);
        for index in 0..size {
            let id = u32::try_from(index).unwrap();
            let mut config = TesseraConfig::testing();
            config.node.name = names[index].clone();
            config.node.id = id;
            config.database.name = DATABASE.to_string();
            config.layout.nodes = names.clone();
            tweak(&mut config);

            let storage = Arc::new(MemoryStorage::new());
            let membership = Arc::new(StaticMembership::new(
                config.layout.clone(),
                &config.replication,
            ));
            let tap = Arc::new(ResponseTap::new(
                network.transport(node_name(index), NodeId::new(id)),
            ));
            let collaborators = Collaborators {
                transport: Arc::clone(&tap) as Arc<dyn Transport>,
                membership: Arc::<StaticMembership>::clone(&membership),
                storage: Arc::<MemoryStorage>::clone(&storage),
            };
            let database = Arc::new(DistributedDatabase::open(config, collaborators).unwrap());
            network.attach(&database);
            nodes.push(TestNode {
                name: node_name(index),
                database,
                storage,
                membership,
                tap,
            });
        }
        Self { network, nodes }
    }

    pub fn db(&self, index: usize) -> &DistributedDatabase {
        &self.nodes[index].database
    }

    pub fn storage(&self, index: usize) -> &MemoryStorage {
        &self.nodes[index].storage
    }

    /// Stores the same record on every node, bypassing replication.
    pub fn seed(&self, record: RecordId, value: &RawRecord) {
        for node in &self.nodes {
            node.storage.insert(record, value.clone());
        }
    }

    /// Takes a node off the network and tells every other node about it.
    pub fn take_offline(&self, index: usize) {
        let name = &self.nodes[index].name;
        self.network.set_online(name, false);
        for (i, node) in self.nodes.iter().enumerate() {
            node.membership.set_online(name, false);
            if i != index {
                node.database.on_node_unreachable(name);
            }
        }
    }

    pub fn read(&self, index: usize, record: RecordId) -> Option<RawRecord> {
        self.storage(index).records().get(&record).cloned()
    }

    pub fn snapshots(&self) -> Vec<BTreeMap<RecordId, RawRecord>> {
        self.nodes.iter().map(|node| node.storage.records()).collect()
    }

    pub fn converged(&self) -> bool {
        let snapshots = self.snapshots();
        snapshots.windows(2).all(|pair| pair[0] == pair[1])
    }

    /// Waits until no node holds a lock or an open transaction context.
    pub fn quiesce(&self) -> bool {
        wait_until(Duration::from_secs(5), || {
            self.nodes
                .iter()
                .all(|node| node.database.held_locks() == 0 && node.database.open_contexts() == 0)
        })
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.database.close();
        }
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn create_one(cluster: u32, content: &'static str) -> Transaction {
    let mut tx = Transaction::new();
    tx.create(ClusterId::new(cluster), content);
    tx
}
