//! Membership and placement collaborator.
//!
//! Answers who holds a cluster, who owns it, how many of them must agree, and
//! whether a node is currently part of the cluster. [`StaticMembership`]
//! derives all of this from the `[layout]` and `[replication]` configuration.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use tessera_config::{LayoutConfig, NodeRole, QuorumSetting, ReplicationConfig};
use tessera_types::{ClusterId, NodeName};

use crate::task::QuorumType;

pub trait Membership: Send + Sync {
    /// Ordered server list of a cluster; the first entry owns it.
    fn servers(&self, cluster: ClusterId) -> Vec<NodeName>;

    fn cluster_owner(&self, cluster: ClusterId) -> Option<NodeName> {
        self.servers(cluster).into_iter().next()
    }

    /// Configured quorum for `cluster` given how many of its replicas are available.
    fn quorum(&self, cluster: ClusterId, quorum_type: QuorumType, available: usize) -> usize;

    fn role(&self, node: &NodeName) -> NodeRole;

    fn is_node_available(&self, node: &NodeName) -> bool;

    /// Clusters explicitly placed with `node` as their owner.
    fn owned_clusters(&self, _node: &NodeName) -> Vec<ClusterId> {
        Vec::new()
    }

    /// Whether `node`'s reply counts toward a quorum of this type.
    fn concurs(&self, node: &NodeName, quorum_type: QuorumType) -> bool {
        match quorum_type {
            QuorumType::Write | QuorumType::All => self.role(node) == NodeRole::Primary,
            QuorumType::Read | QuorumType::None => true,
        }
    }
}

/// Membership read from configuration, with a mutable offline set.
#[derive(Debug)]
pub struct StaticMembership {
    layout: LayoutConfig,
    read_quorum: QuorumSetting,
    write_quorum: QuorumSetting,
    offline: RwLock<BTreeSet<NodeName>>,
}

impl StaticMembership {
    pub fn new(layout: LayoutConfig, replication: &ReplicationConfig) -> Self {
        Self {
            layout,
            read_quorum: replication.read_quorum,
            write_quorum: replication.write_quorum,
            offline: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn nodes(&self) -> Vec<NodeName> {
        self.layout.nodes.iter().map(|n| NodeName::new(n.clone())).collect()
    }

    pub fn set_online(&self, node: &NodeName, online: bool) {
        let mut offline = self.offline.write().unwrap_or_else(PoisonError::into_inner);
        if online {
            offline.remove(node);
        } else {
            offline.insert(node.clone());
        }
    }
}

impl Membership for StaticMembership {
    fn servers(&self, cluster: ClusterId) -> Vec<NodeName> {
        self.layout
            .servers_for(cluster.as_u32())
            .into_iter()
            .map(NodeName::from)
            .collect()
    }

    fn quorum(&self, _cluster: ClusterId, quorum_type: QuorumType, available: usize) -> usize {
        match quorum_type {
            QuorumType::None => 0,
            QuorumType::Read => self.read_quorum.resolve(available),
            QuorumType::Write => self.write_quorum.resolve(available),
            QuorumType::All => available,
        }
    }

    fn role(&self, node: &NodeName) -> NodeRole {
        self.layout.role_of(node.as_str())
    }

    fn is_node_available(&self, node: &NodeName) -> bool {
        let known = self.layout.nodes.iter().any(|n| n == node.as_str());
        known
            && !self
                .offline
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(node)
    }

    fn owned_clusters(&self, node: &NodeName) -> Vec<ClusterId> {
        self.layout
            .clusters
            .keys()
            .filter_map(|key| key.parse::<u32>().ok())
            .map(ClusterId::new)
            .filter(|cluster| self.cluster_owner(*cluster).as_ref() == Some(node))
            .collect()
    }
}
