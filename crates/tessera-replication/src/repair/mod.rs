//! Pending repair work and conflict resolution.

mod resolver;

pub use resolver::{
    Candidate, ConflictResolver, ContentResolver, Decision, MajorityResolver, OwnerResolver,
    Resolution, ResolveContext, ResolverChain, VersionResolver,
};

use dashmap::DashSet;
use tessera_types::{ClusterId, RecordId};

/// Records and clusters waiting to be checked across their replicas.
///
/// Enqueueing is idempotent. Draining hands out a sorted batch and removes it
/// from the queue; callers re-enqueue whatever they could not finish.
#[derive(Debug, Default)]
pub struct RepairQueue {
    records: DashSet<RecordId>,
    clusters: DashSet<ClusterId>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a record for repair. Returns false for ids that never left the
    /// transaction that created them.
    pub fn enqueue_record(&self, record: RecordId) -> bool {
        if !record.is_persistent() {
            return false;
        }
        self.records.insert(record);
        true
    }

    pub fn enqueue_records(&self, records: impl IntoIterator<Item = RecordId>) -> usize {
        records
            .into_iter()
            .filter(|record| self.enqueue_record(*record))
            .count()
    }

    pub fn enqueue_cluster(&self, cluster: ClusterId) {
        self.clusters.insert(cluster);
    }

    /// Drops a pending record. Returns true if it was queued.
    pub fn cancel_record(&self, record: RecordId) -> bool {
        self.records.remove(&record).is_some()
    }

    pub fn take_clusters(&self, max: usize) -> Vec<ClusterId> {
        let mut clusters: Vec<ClusterId> = self.clusters.iter().map(|c| *c).collect();
        clusters.sort_unstable();
        clusters.truncate(max);
        clusters.retain(|cluster| self.clusters.remove(cluster).is_some());
        clusters
    }

    pub fn take_records(&self, max: usize) -> Vec<RecordId> {
        let mut records: Vec<RecordId> = self.records.iter().map(|r| *r).collect();
        records.sort_unstable();
        records.truncate(max);
        records.retain(|record| self.records.remove(record).is_some());
        records
    }

    pub fn contains_record(&self, record: RecordId) -> bool {
        self.records.contains(&record)
    }

    pub fn pending_records(&self) -> usize {
        self.records.len()
    }

    pub fn pending_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.clusters.is_empty()
    }
}
