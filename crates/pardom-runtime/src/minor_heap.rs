//! Minor-heap reservation management
//!
//! Layout: one contiguous virtual reservation of
//! `minor_heap_max_wsz * max_domains` words, carved into `max_domains`
//! equal slices. Slot *i* owns slice *i*, recorded in its
//! `minor_heap_area_start/end`. Each domain commits only the prefix of its
//! slice that it actually uses (`minor_heap_wsz` words); the committed
//! window's bounds live in the domain state's `young_start`/`young_end`
//! and are touched by no other domain outside STW sections.
//!
//! Growing `minor_heap_max_wsz` moves the whole reservation, so it runs as
//! a stop-the-world section: every participant empties and frees its own
//! minor heap, a single domain re-maps the reservation and rewrites the
//! slice bounds, then every participant re-commits its own slice (each
//! domain touches its own memory for NUMA locality).

use core::sync::atomic::Ordering;

use pardom_core::constants::{MINOR_HEAP_MIN_WSZ, WORD_SIZE};
use pardom_core::error::{fatal_error, DomainResult};
use pardom_core::{ddebug, dtrace, DomainState};

use crate::domain::Runtime;
use crate::memory;
use crate::registry::DomainSlot;
use crate::stw::StwParticipants;
use crate::tls;

/// Clamp and round a minor-heap size request to mapping granularity
pub fn norm_minor_heap_size(wsz: usize) -> usize {
    let wsz = wsz.max(MINOR_HEAP_MIN_WSZ);
    memory::round_up_mapping_size(wsz * WORD_SIZE) / WORD_SIZE
}

impl Runtime {
    /// Current per-domain reservation size, in words
    #[inline]
    pub fn minor_heap_max_wsz(&self) -> usize {
        self.minor_heap_max_wsz.load(Ordering::Acquire)
    }

    /// Bounds of the whole reservation, in bytes
    pub fn minor_heaps_range(&self) -> (usize, usize) {
        (
            self.minor_heaps_start.load(Ordering::Relaxed),
            self.minor_heaps_end.load(Ordering::Relaxed),
        )
    }

    fn check_minor_heap(&self, slot: &DomainSlot, dom: &DomainState) {
        let young_start = dom.young_start.load(Ordering::Relaxed);
        let young_end = dom.young_end.load(Ordering::Relaxed);
        let (area_start, area_end) = slot.heap_area();
        dtrace!(
            "minor heap: young_start={:#x} young_end={:#x} area=[{:#x},{:#x}) wsz={}",
            young_start,
            young_end,
            area_start,
            area_end,
            dom.minor_heap_wsz.load(Ordering::Relaxed)
        );
        debug_assert_eq!(
            dom.young_ptr.load(Ordering::Relaxed),
            young_end,
            "minor heap must be empty"
        );
        debug_assert!(
            (young_start == 0 && young_end == 0)
                || (young_start == area_start && young_end <= area_end),
            "committed window must sit at the start of the slot's slice"
        );
    }

    /// Reserve the whole region and hand each slot its slice.
    ///
    /// Single-executor: runs before any mutator starts, or inside the
    /// exclusive phase of the resize section.
    pub(crate) fn reserve_minor_heaps_single(&self) {
        let minor_heap_max_bsz = self.minor_heap_max_wsz() * WORD_SIZE;
        debug_assert_eq!(
            memory::round_up_mapping_size(minor_heap_max_bsz),
            minor_heap_max_bsz
        );

        let reservation_bsz = minor_heap_max_bsz
            .checked_mul(self.config.max_domains)
            .unwrap_or_else(|| fatal_error("minor heap reservation size overflows"));

        let base = match memory::reserve(reservation_bsz) {
            Ok(base) => base,
            Err(_) => fatal_error("not enough heap memory to reserve minor heaps"),
        };
        self.minor_heaps_start.store(base, Ordering::Relaxed);
        self.minor_heaps_end.store(base + reservation_bsz, Ordering::Relaxed);
        ddebug!(
            "minor heaps reserved: [{:#x}, {:#x})",
            base,
            base + reservation_bsz
        );

        for (i, slot) in self.all_domains.iter().enumerate() {
            let area = base + minor_heap_max_bsz * i;
            slot.set_heap_area(area, area + minor_heap_max_bsz);
        }
    }

    /// Drop the whole reservation. Single-executor, same contract as
    /// [`Runtime::reserve_minor_heaps_single`].
    fn unreserve_minor_heaps_single(&self) {
        ddebug!("unreserving minor heaps");
        for slot in self.all_domains.iter() {
            #[cfg(debug_assertions)]
            {
                // a running domain must have freed its heap already; a
                // free slot has nothing committed
                if slot.interruptor.is_running() {
                    let dom = slot.state().expect("running domain without state");
                    debug_assert_eq!(dom.young_start.load(Ordering::Relaxed), 0);
                    debug_assert_eq!(dom.young_end.load(Ordering::Relaxed), 0);
                }
            }
            slot.set_heap_area(0, 0);
        }

        let (start, end) = self.minor_heaps_range();
        if memory::unmap(start, end - start).is_err() {
            fatal_error("failed to unmap the minor heap reservation");
        }
    }

    fn resize_heap_reservation_single(&self, new_minor_wsz: usize) {
        ddebug!(
            "resizing minor heap reservation: {} -> {} words per domain",
            self.minor_heap_max_wsz(),
            new_minor_wsz
        );
        self.unreserve_minor_heaps_single();
        // new_minor_wsz is mapping-aligned: callers normalise it first
        self.minor_heap_max_wsz.store(new_minor_wsz, Ordering::Release);
        self.reserve_minor_heaps_single();
        // Participants synchronise with the rewritten slice bounds by
        // leaving the barrier phase before re-reading them.
    }

    /// Commit `wsz` words at the start of this domain's slice and point
    /// the allocation window at it.
    pub(crate) fn allocate_minor_heap(
        &self,
        slot: &DomainSlot,
        dom: &DomainState,
        wsz: usize,
    ) -> DomainResult<()> {
        self.check_minor_heap(slot, dom);

        let wsz = norm_minor_heap_size(wsz);
        debug_assert!(wsz <= self.minor_heap_max_wsz());
        ddebug!("allocating minor heap: {}k words", wsz / 1024);

        let (area_start, _) = slot.heap_area();
        memory::commit(area_start, wsz * WORD_SIZE)?;

        dom.minor_heap_wsz.store(wsz, Ordering::Relaxed);
        let young_end = area_start + wsz * WORD_SIZE;
        dom.young_start.store(area_start, Ordering::Relaxed);
        dom.young_end.store(young_end, Ordering::Relaxed);
        dom.young_ptr.store(young_end, Ordering::Relaxed);
        // poll when half of the heap is filled; a major slice gets
        // scheduled there, a full heap forces a minor collection
        dom.young_trigger
            .store(area_start + (wsz / 2) * WORD_SIZE, Ordering::Relaxed);
        self.reset_young_limit(dom);

        self.check_minor_heap(slot, dom);
        Ok(())
    }

    /// Decommit this domain's minor heap and clear the allocation window.
    ///
    /// Decommit rather than unmap: the slice stays claimed, so no foreign
    /// mapping can appear inside the reservation.
    pub(crate) fn free_minor_heap(&self, slot: &DomainSlot, dom: &DomainState) {
        let wsz = dom.minor_heap_wsz.load(Ordering::Relaxed);
        if dom.young_start.load(Ordering::Relaxed) == 0 || wsz == 0 {
            return;
        }
        ddebug!("freeing minor heap: {}k words", wsz / 1024);
        self.check_minor_heap(slot, dom);

        let (area_start, _) = slot.heap_area();
        if memory::decommit(area_start, wsz * WORD_SIZE).is_err() {
            fatal_error("failed to decommit a minor heap");
        }

        dom.young_start.store(0, Ordering::Relaxed);
        dom.young_end.store(0, Ordering::Relaxed);
        dom.young_ptr.store(0, Ordering::Relaxed);
        dom.young_trigger.store(0, Ordering::Relaxed);
        dom.young_limit.store(0, Ordering::Release);
    }

    /// Free the old window, commit a new one of `wsz` words
    pub(crate) fn reallocate_minor_heap(
        &self,
        slot: &DomainSlot,
        dom: &DomainState,
        wsz: usize,
    ) -> DomainResult<()> {
        self.free_minor_heap(slot, dom);
        self.allocate_minor_heap(slot, dom, wsz)
    }

    /// Grow the per-domain reservation so that `requested_wsz` fits.
    ///
    /// Loops because a concurrent domain may bump the requirement further
    /// while this section runs.
    pub fn update_minor_heap_max(&self, requested_wsz: usize) {
        let requested = norm_minor_heap_size(requested_wsz);
        ddebug!(
            "changing minor heap max from {} to {} words",
            self.minor_heap_max_wsz(),
            requested
        );
        // `requested` lives on this stack, but every participant reads it
        // before arriving at the exclusive phase, which completes before
        // this frame can unwind.
        let data = &requested as *const usize as *mut ();
        while requested > self.minor_heap_max_wsz() {
            self.try_run_on_all_domains(stw_resize_minor_heap_reservation, data, None);
        }

        if let Some((_, slot)) = tls::domain_self() {
            if let Some(dom) = slot.state() {
                self.check_minor_heap(slot, dom);
            }
        }
    }

    /// One process-wide minor collection, coordinated or joined.
    ///
    /// Loops until the minor-collection epoch advances: either this
    /// domain led the collection, or a failed claim joined the section
    /// that did the same work.
    pub fn empty_minor_heap_once(&self) {
        let epoch = self.minor_collections_count.load(Ordering::Acquire);
        while self.minor_collections_count.load(Ordering::Acquire) == epoch {
            self.try_run_on_all_domains(stw_empty_minor_heap, core::ptr::null_mut(), None);
        }
    }
}

/// Empty the calling domain's own minor heap. Stands in for the minor
/// collector: survivors are the (opaque) collector's business, the
/// coordination core only resets the allocation window.
pub(crate) fn empty_own_minor_heap(rt: &Runtime, dom: &DomainState) {
    dom.reset_young_ptr();
    dom.requested_minor_gc.store(false, Ordering::Relaxed);
    dom.minor_collections.fetch_add(1, Ordering::Relaxed);
    // fresh cycle: the poll trigger goes back to the heap midpoint
    let start = dom.young_start.load(Ordering::Relaxed);
    let end = dom.young_end.load(Ordering::Relaxed);
    if start != 0 {
        dom.young_trigger.store(start + (end - start) / 2, Ordering::Relaxed);
    }
    rt.reset_young_limit(dom);
}

/// STW callback: every participant empties its own minor heap; one domain
/// advances the process epoch once all are done.
pub(crate) fn stw_empty_minor_heap(
    rt: &Runtime,
    dom: &DomainState,
    _data: *mut (),
    participating: &StwParticipants<'_>,
) {
    empty_own_minor_heap(rt, dom);
    rt.global_barrier_if_final(participating.len(), || {
        rt.minor_collections_count.fetch_add(1, Ordering::AcqRel);
    });
}

/// STW callback: move the whole reservation to a bigger per-domain size.
fn stw_resize_minor_heap_reservation(
    rt: &Runtime,
    dom: &DomainState,
    minor_wsz_data: *mut (),
    participating: &StwParticipants<'_>,
) {
    // read before the exclusive phase; see update_minor_heap_max
    let new_minor_wsz = unsafe { *(minor_wsz_data as *const usize) };
    let slot = &rt.all_domains[dom.index() as usize];

    // empty and free our own window (no major slice here)
    empty_own_minor_heap(rt, dom);
    rt.free_minor_heap(slot, dom);

    rt.global_barrier_if_final(participating.len(), || {
        rt.resize_heap_reservation_single(new_minor_wsz);
    });

    // Each domain re-commits its own slice: committing from the owning
    // thread keeps the pages NUMA-local.
    let wsz = dom.minor_heap_wsz.load(Ordering::Relaxed);
    if rt.allocate_minor_heap(slot, dom, wsz).is_err() {
        fatal_error("no memory for minor heap");
    }
    ddebug!("minor heap max is now {} words", rt.minor_heap_max_wsz());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run_domain_test, join_domain, spawn_looper, test_runtime, wait_until};
    use core::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_norm_minor_heap_size() {
        // clamped up to the minimum, then page-rounded
        assert!(norm_minor_heap_size(1) >= MINOR_HEAP_MIN_WSZ);
        let w = norm_minor_heap_size(MINOR_HEAP_MIN_WSZ + 1);
        assert!(w > MINOR_HEAP_MIN_WSZ);
        assert_eq!(
            memory::round_up_mapping_size(w * WORD_SIZE),
            w * WORD_SIZE
        );
    }

    #[test]
    fn test_slices_partition_reservation() {
        run_domain_test(|| {
            let rt = test_runtime(4);
            let (start, end) = rt.minor_heaps_range();
            let slice_bsz = rt.minor_heap_max_wsz() * WORD_SIZE;
            assert_eq!(end - start, slice_bsz * 4);

            for (i, slot) in rt.all_domains.iter().enumerate() {
                let (a, b) = slot.heap_area();
                assert_eq!(a, start + i * slice_bsz);
                assert_eq!(b - a, slice_bsz);
            }
        });
    }

    #[test]
    fn test_alloc_lands_in_own_slice() {
        run_domain_test(|| {
            let rt = test_runtime(2);
            let (_, slot) = crate::tls::domain_self().unwrap();
            let dom = slot.state().unwrap();
            let (area_start, area_end) = slot.heap_area();

            let addr = rt.alloc_words(8);
            assert!(addr >= area_start && addr < area_end);
            assert_eq!(dom.young_used_words(), 8);
        });
    }

    // S6 + round-trip 7: grow the reservation, then verify every live
    // domain's heap still works; per-slot widths track the new maximum.
    #[test]
    fn test_resize_reservation_grows() {
        run_domain_test(|| {
            let rt = test_runtime(4);
            let stop = Arc::new(AtomicBool::new(false));
            let (_, d1) = spawn_looper(rt, &stop);
            let (_, d2) = spawn_looper(rt, &stop);

            let old_max = rt.minor_heap_max_wsz();
            let new_max = norm_minor_heap_size(old_max * 4);
            rt.update_minor_heap_max(new_max);
            assert_eq!(rt.minor_heap_max_wsz(), new_max);

            // slices were rewritten to the new width
            let (start, _) = rt.minor_heaps_range();
            let slice_bsz = new_max * WORD_SIZE;
            for (i, slot) in rt.all_domains.iter().enumerate() {
                let (a, b) = slot.heap_area();
                assert_eq!(a, start + i * slice_bsz);
                assert_eq!(b - a, slice_bsz);
            }

            // every live domain's heap is still usable: allocate until a
            // minor collection triggers
            let (_, slot) = crate::tls::domain_self().unwrap();
            let dom = slot.state().unwrap();
            let collections = dom.minor_collections.load(Ordering::Relaxed);
            let heap_wsz = dom.minor_heap_wsz.load(Ordering::Relaxed);
            for _ in 0..(heap_wsz / 64 + 2) {
                rt.alloc_words(64);
            }
            assert!(dom.minor_collections.load(Ordering::Relaxed) > collections);

            stop.store(true, Ordering::Release);
            join_domain(rt, &d1);
            join_domain(rt, &d2);
        });
    }

    // A resize request no bigger than the current maximum is a no-op.
    #[test]
    fn test_resize_noop_when_smaller() {
        run_domain_test(|| {
            let rt = test_runtime(2);
            let old_max = rt.minor_heap_max_wsz();
            let (old_start, old_end) = rt.minor_heaps_range();

            rt.update_minor_heap_max(MINOR_HEAP_MIN_WSZ);
            assert_eq!(rt.minor_heap_max_wsz(), old_max);
            assert_eq!(rt.minor_heaps_range(), (old_start, old_end));
        });
    }

    #[test]
    fn test_empty_minor_heap_once_advances_epoch() {
        run_domain_test(|| {
            let rt = test_runtime(2);
            let (_, slot) = crate::tls::domain_self().unwrap();
            let dom = slot.state().unwrap();

            rt.alloc_words(32);
            assert_ne!(dom.young_used_words(), 0);

            let epoch = rt.minor_collections_count.load(Ordering::Acquire);
            rt.empty_minor_heap_once();
            assert!(rt.minor_collections_count.load(Ordering::Acquire) > epoch);
            assert_eq!(dom.young_used_words(), 0);
            assert!(wait_until(rt, || !rt.stw_in_progress()));
        });
    }
}
