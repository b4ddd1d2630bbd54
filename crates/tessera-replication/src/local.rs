//! In-process transport.
//!
//! [`LocalNetwork`] connects several [`DistributedDatabase`] sessions living
//! in one process, one per simulated node. Every envelope is encoded with
//! postcard and decoded on the receiving side, so nothing is shared between
//! nodes by reference. Nodes can be taken offline, and a node can be made to
//! silently drop the requests addressed to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_types::{NodeId, NodeName};

use crate::database::DistributedDatabase;
use crate::task::{RequestEnvelope, ResponseEnvelope};
use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct NetworkState {
    nodes: BTreeMap<NodeName, NodeId>,
    /// Keyed by node, then database name.
    databases: BTreeMap<(NodeName, String), Weak<DistributedDatabase>>,
    offline: BTreeSet<NodeName>,
    dropping: BTreeSet<NodeName>,
}

#[derive(Default)]
pub struct LocalNetwork {
    state: RwLock<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, NetworkState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NetworkState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a node and returns its transport.
    pub fn transport(self: &Arc<Self>, node: impl Into<NodeName>, id: NodeId) -> Arc<LocalTransport> {
        let node = node.into();
        self.write().nodes.insert(node.clone(), id);
        Arc::new(LocalTransport {
            network: Arc::clone(self),
            local: node,
        })
    }

    /// Makes `database` reachable under its node and name.
    pub fn attach(&self, database: &Arc<DistributedDatabase>) {
        let key = (database.local_node().clone(), database.name().to_string());
        self.write().databases.insert(key, Arc::downgrade(database));
    }

    pub fn set_online(&self, node: &NodeName, online: bool) {
        let mut state = self.write();
        if online {
            state.offline.remove(node);
        } else {
            state.offline.insert(node.clone());
        }
    }

    /// While set, requests to `node` are accepted by the sender and then lost.
    pub fn drop_requests_to(&self, node: &NodeName, dropping: bool) {
        let mut state = self.write();
        if dropping {
            state.dropping.insert(node.clone());
        } else {
            state.dropping.remove(node);
        }
    }

    fn resolve(&self, target: &NodeName, database: &str) -> Result<Arc<DistributedDatabase>, TransportError> {
        let state = self.read();
        if !state.nodes.contains_key(target) || state.offline.contains(target) {
            return Err(TransportError::NotConnected(target.clone()));
        }
        state
            .databases
            .get(&(target.clone(), database.to_string()))
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::UnknownDatabase {
                node: target.clone(),
                database: database.to_string(),
            })
    }

    fn is_dropping(&self, node: &NodeName) -> bool {
        self.read().dropping.contains(node)
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    local: NodeName,
}

impl LocalTransport {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

fn round_trip<T: Serialize + DeserializeOwned>(message: &T) -> Result<T, TransportError> {
    let bytes = postcard::to_allocvec(message).map_err(|err| TransportError::Encode(err.to_string()))?;
    postcard::from_bytes(&bytes).map_err(|err| TransportError::Encode(err.to_string()))
}

impl Transport for LocalTransport {
    fn local_node(&self) -> &NodeName {
        &self.local
    }

    fn send_request(&self, target: &NodeName, envelope: RequestEnvelope) -> Result<(), TransportError> {
        let database = self.network.resolve(target, &envelope.database)?;
        if self.network.is_dropping(target) {
            tracing::trace!(request = %envelope.request_id, target = %target, "request dropped");
            return Ok(());
        }
        database.on_request(round_trip(&envelope)?);
        Ok(())
    }

    fn send_response(&self, target: &NodeName, envelope: ResponseEnvelope) -> Result<(), TransportError> {
        let database = self.network.resolve(target, &envelope.database)?;
        database.on_response(round_trip(&envelope)?);
        Ok(())
    }

    fn is_node_online(&self, node: &NodeName) -> bool {
        let state = self.network.read();
        state.nodes.contains_key(node) && !state.offline.contains(node)
    }

    fn available_nodes(&self) -> BTreeSet<NodeName> {
        let state = self.network.read();
        state
            .nodes
            .keys()
            .filter(|node| !state.offline.contains(*node))
            .cloned()
            .collect()
    }

    fn node_name(&self, id: NodeId) -> Option<NodeName> {
        self.network
            .read()
            .nodes
            .iter()
            .find(|(_, node_id)| **node_id == id)
            .map(|(name, _)| name.clone())
    }

    fn node_id(&self, name: &NodeName) -> Option<NodeId> {
        self.network.read().nodes.get(name).copied()
    }
}
