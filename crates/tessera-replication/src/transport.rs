//! Messaging collaborator.
//!
//! Delivery is asynchronous: `send_request` hands the envelope to the peer and
//! returns; the peer's reply arrives later through
//! [`DistributedDatabase::on_response`](crate::DistributedDatabase::on_response).
//! Encoding and connection management belong to the implementation.

use std::collections::BTreeSet;

use tessera_types::{NodeId, NodeName};
use thiserror::Error;

use crate::task::{RequestEnvelope, ResponseEnvelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {0} is not connected")]
    NotConnected(NodeName),

    #[error("database {database} is not open on node {node}")]
    UnknownDatabase { node: NodeName, database: String },

    #[error("failed to encode message: {0}")]
    Encode(String),
}

pub trait Transport: Send + Sync {
    fn local_node(&self) -> &NodeName;

    fn send_request(&self, target: &NodeName, envelope: RequestEnvelope) -> Result<(), TransportError>;

    fn send_response(&self, target: &NodeName, envelope: ResponseEnvelope) -> Result<(), TransportError>;

    fn is_node_online(&self, node: &NodeName) -> bool;

    /// Every node currently reachable, the local one included.
    fn available_nodes(&self) -> BTreeSet<NodeName>;

    fn node_name(&self, id: NodeId) -> Option<NodeName>;

    fn node_id(&self, name: &NodeName) -> Option<NodeId>;
}
