//! GC poll points
//!
//! What forces a domain through the interrupt path:
//!
//! - any minor-heap allocation (the `young_limit` check),
//! - any explicit runtime callback (`handle_gc_interrupt`, `cpu_relax`),
//! - blocking-section boundaries, which hand the duty to the backup
//!   thread.
//!
//! `young_limit` is only ever rewritten through [`Runtime::reset_young_limit`]
//! (or set to `usize::MAX` for immediate interruption), so no requested
//! action can be lost to a race.

use core::sync::atomic::Ordering;

use pardom_core::constants::{MAX_YOUNG_WSZ, WORD_SIZE};
use pardom_core::DomainState;

use crate::domain::Runtime;
use crate::stw::StwParticipants;
use crate::tls;

impl Runtime {
    /// Install the regular poll trigger into `young_limit`, then
    /// re-interrupt immediately if something non-delayable is pending.
    pub fn reset_young_limit(&self, dom: &DomainState) {
        let trigger = dom.young_trigger.load(Ordering::Relaxed);
        debug_assert!(dom.young_ptr.load(Ordering::Relaxed) >= trigger);
        // An interrupt might have been queued in the meantime; the swap
        // gives the needed synchronisation with the writer, where a plain
        // store would not.
        dom.young_limit.swap(trigger, Ordering::AcqRel);

        let slot = &self.all_domains[dom.index() as usize];
        if slot.interruptor.has_pending()
            || dom.requested_minor_gc.load(Ordering::Relaxed)
            || dom.requested_major_slice.load(Ordering::Relaxed)
            || dom.requested_external_interrupt.load(Ordering::Relaxed)
            || dom.major_slice_epoch.load(Ordering::Relaxed)
                < self.major_slice_epoch.load(Ordering::Acquire)
        {
            dom.interrupt_now();
        }
    }

    /// First domain to half-fill its arena in a minor cycle schedules a
    /// major slice on everyone.
    fn advance_global_major_slice_epoch(&self, _dom: &DomainState) {
        let minor_count = self.minor_collections_count.load(Ordering::Acquire);
        let old = self.major_slice_epoch.swap(minor_count, Ordering::AcqRel);
        if old != minor_count {
            self.interrupt_all_signal_safe();
        }
    }

    /// Examine the trigger state and run whatever collection work this
    /// domain owes.
    pub fn poll_gc_work(&self) {
        let (_, slot) = tls::domain_self().expect("poll from a non-domain thread");
        let dom = slot.state().expect("domain without state");

        let young_ptr = dom.young_ptr.load(Ordering::Relaxed);
        let trigger = dom.young_trigger.load(Ordering::Relaxed);
        let start = dom.young_start.load(Ordering::Relaxed);
        let margin = MAX_YOUNG_WSZ * WORD_SIZE;

        if dom.has_minor_heap() && young_ptr.saturating_sub(margin) < trigger {
            if trigger == start {
                // out of minor heap
                dom.requested_minor_gc.store(true, Ordering::Relaxed);
            } else {
                // Half of the arena is used: schedule a major slice
                // everywhere, and drop the trigger so that filling the
                // heap forces the minor collection.
                self.advance_global_major_slice_epoch(dom);
                dom.young_trigger.store(start, Ordering::Relaxed);
            }
        } else if dom.requested_minor_gc.load(Ordering::Relaxed) {
            // a collection was forced while the arena is still half
            // empty: schedule a slice anyway so this domain keeps pace
            self.advance_global_major_slice_epoch(dom);
        }

        if dom.major_slice_epoch.load(Ordering::Relaxed)
            < self.major_slice_epoch.load(Ordering::Acquire)
        {
            dom.requested_major_slice.store(true, Ordering::Relaxed);
        }

        if dom.requested_minor_gc.swap(false, Ordering::Relaxed) {
            self.empty_minor_heap_once();
        }

        if dom.requested_major_slice.swap(false, Ordering::Relaxed) {
            dom.major_slice_epoch
                .store(self.major_slice_epoch.load(Ordering::Acquire), Ordering::Relaxed);
            (self.config.gc.major_collection_slice)(self, dom);
        }

        if dom.requested_global_major_slice.load(Ordering::Relaxed) {
            if self.try_run_on_all_domains_async(
                stw_global_major_slice,
                core::ptr::null_mut(),
                None,
            ) {
                dom.requested_global_major_slice.store(false, Ordering::Relaxed);
            }
            // on failure, retry at the next poll
        }

        self.reset_young_limit(dom);
    }

    /// Allocation slow path: drain interrupts, then poll.
    pub fn handle_gc_interrupt(&self) {
        if self.incoming_interrupts_queued() {
            self.handle_incoming_interrupts();
        }
        self.poll_gc_work();
        self.process_external_interrupt();
    }

    /// Fire the external-interrupt hook if one was requested
    pub fn process_external_interrupt(&self) {
        let (_, slot) = match tls::domain_self() {
            Some(ctx) => ctx,
            None => return,
        };
        let dom = match slot.state() {
            Some(dom) => dom,
            None => return,
        };
        if dom.requested_external_interrupt.swap(false, Ordering::AcqRel) {
            (self.config.hooks.external_interrupt)();
        }
    }

    /// Allocate `wsz` words in the current domain's minor heap, running
    /// collection work as needed. The GC poll point of managed code.
    pub fn alloc_words(&self, wsz: usize) -> usize {
        debug_assert!(wsz > 0 && wsz <= MAX_YOUNG_WSZ);
        let (_, slot) = tls::domain_self().expect("allocation from a non-domain thread");
        let dom = slot.state().expect("domain without state");
        loop {
            if let Some(addr) = dom.try_alloc_words(wsz) {
                return addr;
            }
            self.handle_gc_interrupt();
        }
    }
}

/// Async STW callback behind a deferred global major slice: just flag the
/// slice; the handler polls right after the callback and runs it.
fn stw_global_major_slice(
    _rt: &Runtime,
    dom: &DomainState,
    _data: *mut (),
    _participating: &StwParticipants<'_>,
) {
    dom.requested_major_slice.store(true, Ordering::Relaxed);
}

impl Runtime {
    /// Request an external interrupt on the current domain and trap it.
    pub fn request_external_interrupt(&self) {
        if let Some((_, slot)) = tls::domain_self() {
            if let Some(dom) = slot.state() {
                dom.requested_external_interrupt.store(true, Ordering::Release);
                dom.interrupt_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{run_domain_test, join_domain, spawn_looper, test_runtime, wait_until};
    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    // Filling the minor heap forces a minor collection through the
    // allocation path alone.
    #[test]
    fn test_alloc_triggers_minor_collection() {
        run_domain_test(|| {
            let rt = test_runtime(2);
            let (_, slot) = tls::domain_self().unwrap();
            let dom = slot.state().unwrap();

            let collections = dom.minor_collections.load(Ordering::Relaxed);
            let heap_wsz = dom.minor_heap_wsz.load(Ordering::Relaxed);
            for _ in 0..(heap_wsz / 32 + 2) {
                rt.alloc_words(32);
            }
            assert!(dom.minor_collections.load(Ordering::Relaxed) > collections);
        });
    }

    // Half-filling the arena advances the process epoch and pokes every
    // domain; the others run their slice at their next poll point.
    #[test]
    fn test_half_full_schedules_global_slice() {
        run_domain_test(|| {
            let rt = test_runtime(4);
            let stop = Arc::new(AtomicBool::new(false));
            let (_, d1) = spawn_looper(rt, &stop);

            // the epoch tracks the minor-collection count; run one collection
            // so an advance is observable
            rt.empty_minor_heap_once();
            let epoch_before = rt.major_slice_epoch.load(Ordering::Acquire);
            let (_, slot) = tls::domain_self().unwrap();
            let dom = slot.state().unwrap();
            let heap_wsz = dom.minor_heap_wsz.load(Ordering::Relaxed);

            // burn just past half of the arena
            for _ in 0..(heap_wsz / 2 / 64 + 2) {
                rt.alloc_words(64);
            }
            assert!(wait_until(rt, || {
                rt.major_slice_epoch.load(Ordering::Acquire) != epoch_before
            }));

            stop.store(true, Ordering::Release);
            join_domain(rt, &d1);
        });
    }

    // cpu_relax drains a pending interrupt.
    #[test]
    fn test_cpu_relax_services_interrupts() {
        run_domain_test(|| {
            let rt = test_runtime(2);
            let stop = Arc::new(AtomicBool::new(false));
            let (_, d1) = spawn_looper(rt, &stop);

            static CALLS: AtomicUsize = AtomicUsize::new(0);
            fn callback(
                _rt: &Runtime,
                _dom: &DomainState,
                _data: *mut (),
                _p: &StwParticipants<'_>,
            ) {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }

            while !rt.try_run_on_all_domains(callback, core::ptr::null_mut(), None) {
                rt.cpu_relax();
            }
            assert!(wait_until(rt, || CALLS.load(Ordering::SeqCst) == 2));

            stop.store(true, Ordering::Release);
            join_domain(rt, &d1);
        });
    }

    // The external-interrupt hook fires through the allocation path.
    #[test]
    fn test_external_interrupt_hook_fires() {
        run_domain_test(|| {
            static FIRED: AtomicBool = AtomicBool::new(false);
            fn external_hook() {
                FIRED.store(true, Ordering::SeqCst);
            }

            let config = crate::config::RuntimeConfig::from_env()
                .max_domains(2)
                .init_minor_heap_wsz(1 << 14)
                .hooks(crate::config::RuntimeHooks {
                    external_interrupt: external_hook,
                    ..Default::default()
                });
            let rt = Runtime::create(config).unwrap();

            rt.request_external_interrupt();
            // the next allocation takes the slow path and services the hook
            rt.alloc_words(4);
            assert!(FIRED.load(Ordering::SeqCst));
        });
    }
}
