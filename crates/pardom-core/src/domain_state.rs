//! Per-domain mutable state record
//!
//! One `DomainState` per domain slot, allocated on first use of the slot
//! and reused by every later domain on the same slot (allocation stats
//! persist across occupants).
//!
//! All fields are atomics so the record can be shared with the backup
//! thread and with other domains during stop-the-world sections. Semantic
//! ownership is still exclusive: only the thread holding the slot's domain
//! lock mutates the record, except for `young_limit`, which any thread may
//! overwrite with `usize::MAX` to interrupt the owner.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::constants::WORD_SIZE;

/// Per-domain state: minor-heap window, GC requests, local storage.
///
/// The `young_*` fields are byte addresses into this domain's slice of the
/// shared minor-heap reservation. `young_limit` doubles as the domain's
/// interrupt word: storing `usize::MAX` into it makes the next allocation
/// check fail, diverting the mutator into the runtime.
pub struct DomainState {
    /// Interrupt word; either the poll trigger address or `usize::MAX`
    pub young_limit: AtomicUsize,

    /// Start of the committed minor heap (0 when uninitialised)
    pub young_start: AtomicUsize,

    /// One past the end of the committed minor heap
    pub young_end: AtomicUsize,

    /// Bump pointer; allocation moves it down from `young_end`
    pub young_ptr: AtomicUsize,

    /// Poll trigger; starts at the heap midpoint, drops to `young_start`
    /// once a major slice has been scheduled
    pub young_trigger: AtomicUsize,

    /// Committed minor heap size in words
    pub minor_heap_wsz: AtomicUsize,

    /// Slot index, fixed at slot creation
    pub id: AtomicU32,

    /// Unique id of the current occupant
    pub unique_id: AtomicU64,

    /// Domain-local storage cell
    pub dls: AtomicUsize,

    /// Minor collection requested on this domain
    pub requested_minor_gc: AtomicBool,

    /// Major slice requested on this domain
    pub requested_major_slice: AtomicBool,

    /// A major slice should be scheduled on all domains
    pub requested_global_major_slice: AtomicBool,

    /// External interrupt requested (serviced via the external hook)
    pub requested_external_interrupt: AtomicBool,

    /// Last process-wide major-slice epoch this domain has acted on
    pub major_slice_epoch: AtomicU64,

    /// This domain has no outstanding marking work
    pub marking_done: AtomicBool,

    /// This domain has no outstanding sweeping work
    pub sweeping_done: AtomicBool,

    /// Backtrace recording enabled for this domain
    pub backtrace_active: AtomicBool,

    /// Set while this domain executes an STW callback
    pub inside_stw_handler: AtomicBool,

    /// Words allocated on this slot over the process lifetime
    pub allocated_words: AtomicU64,

    /// Minor collections performed on this slot over the process lifetime
    pub minor_collections: AtomicU64,
}

impl DomainState {
    /// Fresh state for slot `id`; the minor heap is uninitialised.
    pub fn new(id: u32) -> Self {
        DomainState {
            young_limit: AtomicUsize::new(0),
            young_start: AtomicUsize::new(0),
            young_end: AtomicUsize::new(0),
            young_ptr: AtomicUsize::new(0),
            young_trigger: AtomicUsize::new(0),
            minor_heap_wsz: AtomicUsize::new(0),
            id: AtomicU32::new(id),
            unique_id: AtomicU64::new(0),
            dls: AtomicUsize::new(0),
            requested_minor_gc: AtomicBool::new(false),
            requested_major_slice: AtomicBool::new(false),
            requested_global_major_slice: AtomicBool::new(false),
            requested_external_interrupt: AtomicBool::new(false),
            major_slice_epoch: AtomicU64::new(0),
            marking_done: AtomicBool::new(true),
            sweeping_done: AtomicBool::new(true),
            backtrace_active: AtomicBool::new(false),
            inside_stw_handler: AtomicBool::new(false),
            allocated_words: AtomicU64::new(0),
            minor_collections: AtomicU64::new(0),
        }
    }

    /// Slot index
    #[inline]
    pub fn index(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Unique id of the current occupant
    #[inline]
    pub fn uid(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    /// Allocation fast path: bump `young_ptr` down by `wsz` words.
    ///
    /// Returns the address of the new block, or `None` when the allocation
    /// check fails and the caller must take the interrupt slow path. Only
    /// the owning mutator thread may call this.
    #[inline]
    pub fn try_alloc_words(&self, wsz: usize) -> Option<usize> {
        let bsz = wsz * WORD_SIZE;
        let p = self.young_ptr.load(Ordering::Relaxed);
        let new_p = p.checked_sub(bsz)?;
        self.young_ptr.store(new_p, Ordering::Relaxed);
        if new_p < self.young_limit.load(Ordering::Acquire) {
            // check failed: roll back, the slow path re-examines everything
            self.young_ptr.store(p, Ordering::Relaxed);
            None
        } else {
            self.allocated_words.fetch_add(wsz as u64, Ordering::Relaxed);
            Some(new_p)
        }
    }

    /// Words currently allocated in the minor heap
    #[inline]
    pub fn young_used_words(&self) -> usize {
        (self.young_end.load(Ordering::Relaxed) - self.young_ptr.load(Ordering::Relaxed))
            / WORD_SIZE
    }

    /// Whether a minor heap is committed for this domain
    #[inline]
    pub fn has_minor_heap(&self) -> bool {
        self.young_start.load(Ordering::Relaxed) != 0
    }

    /// Force the next allocation check on this domain to fail.
    ///
    /// Local variant: only meaningful when called from the owning thread
    /// (other threads go through the interruptor).
    #[inline]
    pub fn interrupt_now(&self) {
        self.young_limit.store(usize::MAX, Ordering::Relaxed);
    }

    /// Discard every live minor allocation: move the bump pointer back to
    /// the top of the heap. Used by the (opaque) minor collector once
    /// survivors have been evacuated.
    #[inline]
    pub fn reset_young_ptr(&self) {
        let end = self.young_end.load(Ordering::Relaxed);
        self.young_ptr.store(end, Ordering::Relaxed);
    }
}
