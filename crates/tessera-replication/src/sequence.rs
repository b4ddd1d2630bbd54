//! Per-database transaction sequencer.
//!
//! Transaction ids come from a ring of slots. Each slot keeps the last
//! committed sequence number and at most one outstanding promise. A
//! participant validates an incoming id against its own copy of the ring,
//! which tells it whether the transaction was already applied, whether it
//! missed a predecessor, or whether another coordinator got there first.
//! Each slot also remembers the request that committed its latest sequence,
//! so a redelivered phase 1 can be told apart from a stale coordinator.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tessera_types::{RequestId, TransactionId};

/// Why an incoming transaction id was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Already committed here; replaying it must not re-apply anything.
    AlreadyPresent,
    /// An earlier transaction in the same slot has not been committed here.
    MissingPrevious,
    /// The slot is promised to a different request.
    AlreadyPromised(RequestId),
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    committed: u64,
    promised: Option<(u64, RequestId)>,
    committed_by: Option<RequestId>,
}

#[derive(Debug)]
struct SequenceState {
    slots: Vec<Slot>,
    cursor: usize,
}

#[derive(Debug)]
pub struct TransactionSequence {
    state: Mutex<SequenceState>,
}

impl TransactionSequence {
    /// Creates a ring of `slots` positions. `start` spreads coordinators on
    /// different nodes across the ring.
    pub fn new(slots: u32, start: usize) -> Self {
        let len = usize::try_from(slots.max(1)).unwrap_or(1);
        Self {
            state: Mutex::new(SequenceState {
                slots: vec![Slot::default(); len],
                cursor: start % len,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Promises the next free slot to `owner`. `None` when every slot is promised.
    pub fn next_id(&self, owner: RequestId) -> Option<TransactionId> {
        let mut state = self.lock();
        let len = state.slots.len();
        let index = (0..len)
            .map(|offset| (state.cursor + offset) % len)
            .find(|index| state.slots[*index].promised.is_none())?;

        state.cursor = (index + 1) % len;
        let slot = &mut state.slots[index];
        let sequence = slot.committed + 1;
        slot.promised = Some((sequence, owner));
        Some(TransactionId::new(u32::try_from(index).ok()?, sequence))
    }

    /// Checks `id` against local state and promises its slot to `owner`.
    /// Validating again for the same owner succeeds.
    pub fn validate(&self, id: TransactionId, owner: RequestId) -> Result<(), SequenceStatus> {
        let mut state = self.lock();
        let Some(slot) = usize::try_from(id.slot())
            .ok()
            .and_then(|index| state.slots.get_mut(index))
        else {
            return Err(SequenceStatus::MissingPrevious);
        };

        if id.sequence() <= slot.committed {
            return Err(SequenceStatus::AlreadyPresent);
        }
        if id.sequence() > slot.committed + 1 {
            return Err(SequenceStatus::MissingPrevious);
        }
        match slot.promised {
            Some((_, holder)) if holder != owner => Err(SequenceStatus::AlreadyPromised(holder)),
            _ => {
                slot.promised = Some((id.sequence(), owner));
                Ok(())
            }
        }
    }

    /// The transaction committed: advance its slot and drop the promise.
    pub fn notify_success(&self, id: TransactionId, owner: RequestId) {
        self.advance(id, owner);
    }

    /// The transaction was rolled back: drop `owner`'s promise, if it still holds it.
    pub fn notify_failure(&self, id: TransactionId, owner: RequestId) {
        let mut state = self.lock();
        if let Some(slot) = usize::try_from(id.slot())
            .ok()
            .and_then(|index| state.slots.get_mut(index))
            && slot.promised == Some((id.sequence(), owner))
        {
            slot.promised = None;
        }
    }

    /// Records a transaction confirmed elsewhere whose phase 1 never ran here.
    pub fn force_commit(&self, id: TransactionId, owner: RequestId) {
        self.advance(id, owner);
    }

    fn advance(&self, id: TransactionId, owner: RequestId) {
        let mut state = self.lock();
        let Some(slot) = usize::try_from(id.slot())
            .ok()
            .and_then(|index| state.slots.get_mut(index))
        else {
            return;
        };
        if id.sequence() >= slot.committed {
            slot.committed = id.sequence();
            slot.committed_by = Some(owner);
        }
        if slot
            .promised
            .is_some_and(|(sequence, _)| sequence <= slot.committed)
        {
            slot.promised = None;
        }
    }

    /// Last committed sequence of `slot`.
    pub fn committed(&self, slot: u32) -> Option<u64> {
        let state = self.lock();
        usize::try_from(slot)
            .ok()
            .and_then(|index| state.slots.get(index))
            .map(|slot| slot.committed)
    }

    /// Request that committed `id`, if `id` is the latest commit of its slot.
    pub fn committed_by(&self, id: TransactionId) -> Option<RequestId> {
        let state = self.lock();
        let slot = state.slots.get(usize::try_from(id.slot()).ok()?)?;
        (slot.committed == id.sequence())
            .then_some(slot.committed_by)
            .flatten()
    }

    pub fn promised(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.promised.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::NodeId;

    fn owner(seq: u64) -> RequestId {
        RequestId::new(NodeId::new(0), seq)
    }

    #[test]
    fn next_id_promises_round_robin() {
        let sequence = TransactionSequence::new(2, 0);
        assert_eq!(sequence.next_id(owner(1)), Some(TransactionId::new(0, 1)));
        assert_eq!(sequence.next_id(owner(2)), Some(TransactionId::new(1, 1)));
        assert_eq!(sequence.next_id(owner(3)), None);

        sequence.notify_success(TransactionId::new(0, 1), owner(1));
        assert_eq!(sequence.next_id(owner(4)), Some(TransactionId::new(0, 2)));
    }

    #[test]
    fn validate_classifies_ids() {
        let sequence = TransactionSequence::new(4, 0);
        let id = TransactionId::new(1, 1);
        assert_eq!(sequence.validate(id, owner(1)), Ok(()));
        assert_eq!(sequence.validate(id, owner(1)), Ok(()));
        assert_eq!(
            sequence.validate(id, owner(2)),
            Err(SequenceStatus::AlreadyPromised(owner(1)))
        );
        assert_eq!(
            sequence.validate(TransactionId::new(1, 3), owner(2)),
            Err(SequenceStatus::MissingPrevious)
        );

        sequence.notify_success(id, owner(1));
        assert_eq!(
            sequence.validate(id, owner(1)),
            Err(SequenceStatus::AlreadyPresent)
        );
        assert_eq!(sequence.validate(TransactionId::new(1, 2), owner(2)), Ok(()));
    }

    #[test]
    fn failure_only_clears_own_promise() {
        let sequence = TransactionSequence::new(1, 0);
        let id = sequence.next_id(owner(1)).unwrap();
        sequence.notify_failure(id, owner(9));
        assert_eq!(sequence.promised(), 1);
        sequence.notify_failure(id, owner(1));
        assert_eq!(sequence.promised(), 0);
        assert_eq!(sequence.committed(0), Some(0));
    }

    #[test]
    fn force_commit_unblocks_lagging_slot() {
        let sequence = TransactionSequence::new(1, 0);
        assert_eq!(
            sequence.validate(TransactionId::new(0, 2), owner(1)),
            Err(SequenceStatus::MissingPrevious)
        );
        sequence.force_commit(TransactionId::new(0, 1), owner(5));
        assert_eq!(sequence.validate(TransactionId::new(0, 2), owner(1)), Ok(()));
    }

    #[test]
    fn remembers_who_committed_the_latest_sequence() {
        let sequence = TransactionSequence::new(1, 0);
        let first = TransactionId::new(0, 1);
        let second = TransactionId::new(0, 2);
        assert_eq!(sequence.committed_by(first), None);

        sequence.notify_success(first, owner(1));
        assert_eq!(sequence.committed_by(first), Some(owner(1)));

        sequence.force_commit(second, owner(2));
        assert_eq!(sequence.committed_by(second), Some(owner(2)));
        assert_eq!(sequence.committed_by(first), None);

        // A late confirm for an older id does not overwrite the latest.
        sequence.force_commit(first, owner(3));
        assert_eq!(sequence.committed(0), Some(2));
        assert_eq!(sequence.committed_by(second), Some(owner(2)));
    }

    #[test]
    fn unknown_slot_is_missing_previous() {
        let sequence = TransactionSequence::new(2, 0);
        assert_eq!(
            sequence.validate(TransactionId::new(7, 1), owner(1)),
            Err(SequenceStatus::MissingPrevious)
        );
    }

    #[test]
    fn start_offsets_cursor() {
        let sequence = TransactionSequence::new(4, 6);
        assert_eq!(sequence.next_id(owner(1)), Some(TransactionId::new(2, 1)));
    }
}
