//! Domain slot table and STW participant bookkeeping
//!
//! The runtime owns a fixed array of [`DomainSlot`]s, one per possible
//! domain. A secondary order array tracks which slots are running: the
//! participant set for STW sections is the dense prefix
//! `[0, participating_domains)`, free slots occupy the suffix. Slots move
//! between the two regions only under the coordination lock.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use pardom_core::id::DomainIndex;
use pardom_core::state::BackupMsg;
use pardom_core::DomainState;

use crate::interruptor::Interruptor;
use crate::sync::{PlatCond, PlatMutex};

/// One possible domain: fixed identity plus the state handed from occupant
/// to occupant. Lives for the whole process.
pub struct DomainSlot {
    /// Slot index, fixed at table creation
    pub id: DomainIndex,

    /// Mutator state; allocated on the slot's first use, then reused by
    /// every later occupant (allocation stats persist by design). Never
    /// freed.
    state: AtomicPtr<DomainState>,

    /// Interrupt mailbox
    pub interruptor: Interruptor,

    /// Backup-thread message word
    backup_msg: AtomicU8,

    /// A backup thread is attached to this slot
    pub backup_thread_running: AtomicBool,

    /// Owns the mutator state; the rendezvous for mutator/backup handoff
    pub domain_lock: PlatMutex,
    pub domain_cond: PlatCond,

    /// This slot's slice of the minor-heap reservation.
    /// Rewritten only inside the reservation-resize STW section.
    pub minor_heap_area_start: AtomicUsize,
    pub minor_heap_area_end: AtomicUsize,
}

impl DomainSlot {
    pub fn new(id: u32) -> Self {
        DomainSlot {
            id: DomainIndex::new(id),
            state: AtomicPtr::new(core::ptr::null_mut()),
            interruptor: Interruptor::new(),
            backup_msg: AtomicU8::new(BackupMsg::Init as u8),
            backup_thread_running: AtomicBool::new(false),
            domain_lock: PlatMutex::new(),
            domain_cond: PlatCond::new(),
            minor_heap_area_start: AtomicUsize::new(0),
            minor_heap_area_end: AtomicUsize::new(0),
        }
    }

    /// The slot's state record, if it has ever been occupied
    #[inline]
    pub fn state(&self) -> Option<&DomainState> {
        let ptr = self.state.load(Ordering::Acquire);
        // Never freed once allocated, so the reference cannot dangle.
        unsafe { ptr.as_ref() }
    }

    /// Get the state record, allocating it on the slot's first use.
    ///
    /// Caller must hold the coordination lock; there is exactly one
    /// allocating writer per slot.
    pub fn state_or_alloc(&self) -> &DomainState {
        if let Some(state) = self.state() {
            return state;
        }
        let fresh = Box::into_raw(Box::new(DomainState::new(self.id.as_u32())));
        self.state.store(fresh, Ordering::Release);
        unsafe { &*fresh }
    }

    #[inline]
    pub fn backup_msg(&self) -> BackupMsg {
        BackupMsg::from(self.backup_msg.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_backup_msg(&self, msg: BackupMsg) {
        self.backup_msg.store(msg as u8, Ordering::Release);
    }

    /// Byte bounds of this slot's reserved slice
    #[inline]
    pub fn heap_area(&self) -> (usize, usize) {
        (
            self.minor_heap_area_start.load(Ordering::Relaxed),
            self.minor_heap_area_end.load(Ordering::Relaxed),
        )
    }

    pub fn set_heap_area(&self, start: usize, end: usize) {
        self.minor_heap_area_start.store(start, Ordering::Relaxed);
        self.minor_heap_area_end.store(end, Ordering::Relaxed);
    }
}

/// Participant bookkeeping, guarded by the coordination lock
pub struct CoordState {
    /// Number of running domains; also the length of the dense prefix
    participating_domains: usize,

    /// Slot ids; `[0, participating_domains)` run, the rest are free
    order: Box<[u32]>,

    /// Spawners starved by STW churn park new STW requests here
    pub stw_requests_suspended: usize,

    /// Next unique id to hand out
    next_unique_id: u64,
}

impl CoordState {
    pub fn new(max_domains: usize) -> Self {
        CoordState {
            participating_domains: 0,
            order: (0..max_domains as u32).collect(),
            stw_requests_suspended: 0,
            next_unique_id: 0,
        }
    }

    /// Number of running domains
    #[inline]
    pub fn participating(&self) -> usize {
        self.participating_domains
    }

    /// Slot ids of the current participant set
    #[inline]
    pub fn participant_ids(&self) -> &[u32] {
        &self.order[..self.participating_domains]
    }

    /// The slot the next domain will occupy, if any is free
    pub fn next_free(&self) -> Option<u32> {
        if self.participating_domains == self.order.len() {
            None
        } else {
            Some(self.order[self.participating_domains])
        }
    }

    /// Move the next free slot into the participant prefix.
    ///
    /// The caller has fully initialised that slot (interrupt word
    /// published) before calling this.
    pub fn add_next_to_participants(&mut self) {
        debug_assert!(self.participating_domains < self.order.len());
        self.participating_domains += 1;
    }

    /// Remove a slot from the participant prefix, swapping it with the
    /// last participant so the prefix stays dense.
    pub fn remove_from_participants(&mut self, slot_id: u32) {
        let i = self.order[..self.participating_domains]
            .iter()
            .position(|&id| id == slot_id)
            .expect("slot not in participant set");
        self.participating_domains -= 1;
        self.order.swap(i, self.participating_domains);
    }

    /// Hand out a fresh unique id.
    ///
    /// Returns 0 on the first call (the bootstrap domain), distinct ids
    /// afterwards unless the counter wraps, and never 0 again even after
    /// wraparound.
    pub fn fresh_unique_id(&mut self) -> u64 {
        let next = self.next_unique_id;
        self.next_unique_id = self.next_unique_id.wrapping_add(1);
        if self.next_unique_id == 0 {
            self.next_unique_id = 1;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_state_alloc_once() {
        let slot = DomainSlot::new(3);
        assert!(slot.state().is_none());

        let first = slot.state_or_alloc() as *const DomainState;
        let second = slot.state_or_alloc() as *const DomainState;
        assert_eq!(first, second);
        assert_eq!(slot.state().unwrap().index(), 3);
    }

    #[test]
    fn test_dense_prefix_add_remove() {
        let mut coord = CoordState::new(4);
        assert_eq!(coord.participating(), 0);
        assert_eq!(coord.next_free(), Some(0));

        coord.add_next_to_participants();
        coord.add_next_to_participants();
        coord.add_next_to_participants();
        assert_eq!(coord.participant_ids(), &[0, 1, 2]);
        assert_eq!(coord.next_free(), Some(3));

        // removing from the middle swaps with the last participant
        coord.remove_from_participants(1);
        assert_eq!(coord.participating(), 2);
        assert_eq!(coord.participant_ids(), &[0, 2]);

        // the freed slot is the next one reused
        assert_eq!(coord.next_free(), Some(1));
        coord.add_next_to_participants();
        assert_eq!(coord.participant_ids(), &[0, 2, 1]);
    }

    #[test]
    fn test_no_free_slot_when_full() {
        let mut coord = CoordState::new(2);
        coord.add_next_to_participants();
        coord.add_next_to_participants();
        assert_eq!(coord.next_free(), None);
    }

    #[test]
    fn test_unique_id_zero_once() {
        let mut coord = CoordState::new(1);
        assert_eq!(coord.fresh_unique_id(), 0);
        assert_eq!(coord.fresh_unique_id(), 1);
        assert_eq!(coord.fresh_unique_id(), 2);
    }

    #[test]
    fn test_unique_id_wrap_skips_zero() {
        let mut coord = CoordState::new(1);
        coord.next_unique_id = u64::MAX;
        assert_eq!(coord.fresh_unique_id(), u64::MAX);
        // wrapped: 0 is skipped, the next id is 1
        assert_eq!(coord.fresh_unique_id(), 1);
        assert_eq!(coord.fresh_unique_id(), 2);
    }
}
