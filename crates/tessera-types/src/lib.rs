//! # tessera-types: Core types for `Tessera`
//!
//! Shared identifiers and record values used by every replication component:
//! - Cluster members ([`NodeId`], [`NodeName`])
//! - Distributed operations ([`RequestId`], [`TransactionId`])
//! - Records ([`ClusterId`], [`RecordId`], [`Version`], [`RawRecord`])
//! - Lockable resources ([`IndexKey`], [`LockKey`])

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Cluster Members
// ============================================================================

/// Numeric identifier of a server node, stable for the lifetime of the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Human-readable node name as used by membership and messaging.
///
/// Names order lexicographically, which gives fan-out a stable delivery order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Distributed Operations
// ============================================================================

/// Identifies one distributed operation: the node that started it plus a
/// per-node sequence number.
///
/// Used as the key for response collectors, transaction contexts and lock
/// ownership. The origin is what lets a node failure be traced back to the
/// locks and contexts it left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId {
    origin: NodeId,
    sequence: u64,
}

impl RequestId {
    pub fn new(origin: NodeId, sequence: u64) -> Self {
        Self { origin, sequence }
    }

    pub fn origin(self) -> NodeId {
        self.origin
    }

    pub fn sequence(self) -> u64 {
        self.sequence
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.origin, self.sequence)
    }
}

/// Per-database transaction identifier handed out by the transaction sequencer.
///
/// The sequencer owns a ring of slots; within one slot sequence numbers are
/// strictly increasing and gapless, so a participant can tell whether it is
/// missing a predecessor or replaying something it already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    slot: u32,
    sequence: u64,
}

impl TransactionId {
    pub fn new(slot: u32, sequence: u64) -> Self {
        Self { slot, sequence }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn sequence(self) -> u64 {
        self.sequence
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}:{}", self.slot, self.sequence)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A record cluster. Clusters are the partitioning unit for dispatch and the
/// unit of ownership for cluster repair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusterId(u32);

impl ClusterId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ClusterId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Position used by a record that has not been assigned a slot in its cluster.
pub const NEW_RECORD_POSITION: i64 = -1;

/// Physical record identifier: `#cluster:position`.
///
/// Positions below [`NEW_RECORD_POSITION`] are temporary ids that only exist
/// inside an open transaction and are never replicated or repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    cluster: ClusterId,
    position: i64,
}

impl RecordId {
    pub fn new(cluster: ClusterId, position: i64) -> Self {
        Self { cluster, position }
    }

    pub fn cluster(self) -> ClusterId {
        self.cluster
    }

    pub fn position(self) -> i64 {
        self.position
    }

    /// Returns true if the record has a real position in its cluster.
    pub fn is_persistent(self) -> bool {
        self.position >= 0
    }

    /// Returns true for transaction-local ids that must never leave the node.
    pub fn is_temporary(self) -> bool {
        self.position < NEW_RECORD_POSITION
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Record version. Updates and deletes carry the version they expect to find.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(u32);

impl Version {
    /// Version assigned to a freshly created record.
    pub const INITIAL: Version = Version(1);

    pub fn new(version: u32) -> Self {
        Self(version)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The version a successful update produces.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Raw record bytes plus their version, as stored on one replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRecord {
    pub content: Bytes,
    pub version: Version,
}

impl RawRecord {
    pub fn new(content: impl Into<Bytes>, version: Version) -> Self {
        Self {
            content: content.into(),
            version,
        }
    }
}

// ============================================================================
// Lockable Resources
// ============================================================================

/// A key inside a unique index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub index: String,
    pub key: String,
}

impl IndexKey {
    pub fn new(index: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            key: key.into(),
        }
    }
}

impl Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.index, self.key)
    }
}

/// Anything the lock table can hand out.
///
/// The derived ordering is the canonical acquisition order: every record id
/// (by cluster, then position) sorts before every index key (by index name,
/// then key string). Acquiring batches in this order is what keeps two
/// overlapping transactions from deadlocking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockKey {
    Record(RecordId),
    Key(IndexKey),
}

impl Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Record(rid) => write!(f, "{rid}"),
            LockKey::Key(key) => write!(f, "{key}"),
        }
    }
}

impl From<RecordId> for LockKey {
    fn from(rid: RecordId) -> Self {
        LockKey::Record(rid)
    }
}

impl From<IndexKey> for LockKey {
    fn from(key: IndexKey) -> Self {
        LockKey::Key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn request_id_display() {
        let id = RequestId::new(NodeId::new(3), 42);
        assert_eq!(id.to_string(), "3.42");
        assert_eq!(id.origin(), NodeId::new(3));
        assert_eq!(id.sequence(), 42);
    }

    #[test]
    fn record_id_display() {
        let rid = RecordId::new(ClusterId::new(9), 17);
        assert_eq!(rid.to_string(), "#9:17");
    }

    #[test_case(0, true, false; "first position")]
    #[test_case(NEW_RECORD_POSITION, false, false; "not yet allocated")]
    #[test_case(-2, false, true; "transaction temporary")]
    fn record_id_classification(position: i64, persistent: bool, temporary: bool) {
        let rid = RecordId::new(ClusterId::new(1), position);
        assert_eq!(rid.is_persistent(), persistent);
        assert_eq!(rid.is_temporary(), temporary);
    }

    #[test]
    fn version_next_saturates() {
        assert_eq!(Version::INITIAL.next(), Version::new(2));
        assert_eq!(Version::new(u32::MAX).next(), Version::new(u32::MAX));
    }

    #[test]
    fn records_sort_before_index_keys() {
        let mut keys = vec![
            LockKey::Key(IndexKey::new("users.email", "a@x")),
            LockKey::Record(RecordId::new(ClusterId::new(7), 1)),
            LockKey::Record(RecordId::new(ClusterId::new(2), 5)),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                LockKey::Record(RecordId::new(ClusterId::new(2), 5)),
                LockKey::Record(RecordId::new(ClusterId::new(7), 1)),
                LockKey::Key(IndexKey::new("users.email", "a@x")),
            ]
        );
    }

    #[test]
    fn node_name_serializes_as_plain_string() {
        let json = serde_json::to_string(&NodeName::new("europe-1")).unwrap();
        assert_eq!(json, "\"europe-1\"");
    }

    proptest! {
        /// Sorting is insensitive to the order keys were supplied in.
        #[test]
        fn canonical_order_is_total(
            mut raw in prop::collection::vec((0u32..4, 0i64..8, any::<bool>()), 0..20)
        ) {
            let to_keys = |raw: &[(u32, i64, bool)]| {
                let mut keys: Vec<LockKey> = raw
                    .iter()
                    .map(|&(c, p, is_key)| {
                        if is_key {
                            LockKey::Key(IndexKey::new(format!("idx{c}"), p.to_string()))
                        } else {
                            LockKey::Record(RecordId::new(ClusterId::new(c), p))
                        }
                    })
                    .collect();
                keys.sort();
                keys
            };
            let forward = to_keys(&raw);
            raw.reverse();
            let backward = to_keys(&raw);
            prop_assert_eq!(forward, backward);
        }
    }
}
