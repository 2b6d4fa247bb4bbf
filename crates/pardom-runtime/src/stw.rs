//! Stop-the-world coordinator
//!
//! During a stop-the-world (STW) section, all currently running domains
//! stop their usual work and synchronise to call the same function. The
//! coordination lock and the `stw_leader` cell (null when no section is
//! running, the leader's slot pointer otherwise) guarantee that no domain
//! is running something else:
//!
//! - If two STW sections are attempted in parallel, only one claims the
//!   leadership; the domain starting the other joins the winning section
//!   through its interrupt handler, without running its own callback at
//!   all. That is the `try_` in [`Runtime::try_run_on_all_domains`]: a
//!   false return means the section did not run, so callers retry in a
//!   loop.
//!
//! - Domain initialisation never runs in parallel with a section:
//!   `domain_create` loops until it holds the coordination lock with no
//!   leader claimed, suspending new STW requests if it cannot make
//!   progress.
//!
//! - A terminating domain leaves the participant set only while holding
//!   the coordination lock with no interrupt pending.
//!
//! Each domain leaves the section as soon as it finishes the callback; a
//! mutator may resume while others are still inside. Callback code that
//! must complete before any mutator resumes is followed by a phase of the
//! inner barrier.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use pardom_core::ddebug;
use pardom_core::spin::{spin_until, SpinWait, MAX_SPINS_LONG, MAX_SPINS_MEDIUM};
use pardom_core::DomainState;

use crate::barrier::{barrier_count, barrier_sense, Barrier, BarrierStatus};
use crate::domain::Runtime;
use crate::registry::DomainSlot;
use crate::tls;

/// STW callback: runs once on every participant.
///
/// `data` is the pointer the leader passed to the request; it must stay
/// valid until the section fully drains (the exit counter reaches zero),
/// which can be after `try_run_on_all_domains` returns on the leader.
pub type StwCallback = fn(&Runtime, &DomainState, *mut (), &StwParticipants<'_>);

/// Runs on the leader while it still holds the coordination lock, before
/// any participant is poked. Used to publish shared state that
/// participants read after the enter barrier.
pub type StwLeaderSetup = fn(&Runtime, &DomainState, *mut ());

/// Optional useful work while waiting at the enter barrier. Returns false
/// when there is no more work worth spinning for.
pub type StwSpinCallback = fn(&Runtime, &DomainState, *mut ()) -> bool;

/// Participant snapshot of the current section.
///
/// Synchronous sections may rely on every entry: the enter barrier orders
/// the leader's writes before any participant's reads. Asynchronous
/// sections must only rely on their own state.
pub struct StwParticipants<'a> {
    slots: &'a [AtomicPtr<DomainState>],
    len: usize,
}

impl<'a> StwParticipants<'a> {
    /// Number of domains in the section
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Participant `i`'s state
    #[inline]
    pub fn get(&self, i: usize) -> &'a DomainState {
        assert!(i < self.len);
        let ptr = self.slots[i].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        // Domain states are never freed.
        unsafe { &*ptr }
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a DomainState> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

/// The operation of the current section. Plain data behind an
/// `UnsafeCell`: written only by the leader between claiming `stw_leader`
/// (under the coordination lock) and the first poke; read by participants
/// between observing their poke and decrementing the exit counter. The
/// exit counter reaching zero happens-before the next leader's writes.
#[derive(Clone, Copy)]
pub(crate) struct StwOp {
    pub callback: StwCallback,
    pub data: *mut (),
    pub enter_spin_callback: Option<StwSpinCallback>,
    pub enter_spin_data: *mut (),
}

fn noop_callback(_: &Runtime, _: &DomainState, _: *mut (), _: &StwParticipants<'_>) {}

impl Default for StwOp {
    fn default() -> Self {
        StwOp {
            callback: noop_callback,
            data: core::ptr::null_mut(),
            enter_spin_callback: None,
            enter_spin_data: core::ptr::null_mut(),
        }
    }
}

pub(crate) struct OpCell(UnsafeCell<StwOp>);

// Synchronised by the STW protocol; see the comment on StwOp.
unsafe impl Sync for OpCell {}
unsafe impl Send for OpCell {}

impl OpCell {
    fn new() -> Self {
        OpCell(UnsafeCell::new(StwOp::default()))
    }

    /// Leader-only write; caller holds the coordination lock with
    /// `stw_leader` claimed and no participant poked yet.
    pub(crate) unsafe fn set(&self, op: StwOp) {
        *self.0.get() = op;
    }

    /// Participant read; caller observed its poke for this section.
    pub(crate) unsafe fn get(&self) -> StwOp {
        *self.0.get()
    }
}

/// Process-wide STW request record
pub(crate) struct StwRequest {
    /// Enter barrier: participants arrive here before the callback
    pub(crate) domains_still_running: Barrier,

    /// Domains that have yet to return from the callback
    pub(crate) num_domains_still_processing: AtomicUsize,

    /// The operation to run
    pub(crate) op: OpCell,

    /// Participant count of the section
    pub(crate) num_domains: AtomicUsize,

    /// Reusable inner barrier for callbacks that phase their work
    pub(crate) barrier: Barrier,

    /// Participant snapshot; prefix of length `num_domains` is valid
    pub(crate) participating: Box<[AtomicPtr<DomainState>]>,
}

impl StwRequest {
    pub(crate) fn new(max_domains: usize) -> Self {
        StwRequest {
            domains_still_running: Barrier::new(),
            num_domains_still_processing: AtomicUsize::new(0),
            op: OpCell::new(),
            num_domains: AtomicUsize::new(0),
            barrier: Barrier::new(),
            participating: (0..max_domains)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
        }
    }
}

impl Runtime {
    /// Does the current domain have an unserviced interrupt?
    #[inline]
    pub fn incoming_interrupts_queued(&self) -> bool {
        match tls::domain_self() {
            Some((_, slot)) => slot.interruptor.has_pending(),
            None => false,
        }
    }

    /// Service a pending interrupt on `slot`, which must be the slot the
    /// calling thread acts for. Returns whether work was done.
    pub(crate) fn handle_incoming(&self, slot: &DomainSlot) -> bool {
        let handled = slot.interruptor.has_pending();
        if handled {
            debug_assert!(slot.interruptor.is_running());
            slot.interruptor.set_handled();
            self.stw_handler(slot);
        }
        handled
    }

    /// Service a pending interrupt on the current domain, if any
    pub fn handle_incoming_interrupts(&self) {
        if let Some((_, slot)) = tls::domain_self() {
            self.handle_incoming(slot);
        }
    }

    pub(crate) fn handle_incoming_otherwise_relax(&self, slot: &DomainSlot) {
        if !self.handle_incoming(slot) {
            core::hint::spin_loop();
        }
    }

    /// Is an STW section in flight?
    #[inline]
    pub fn stw_in_progress(&self) -> bool {
        !self.stw_leader.load(Ordering::Acquire).is_null()
    }

    /// Is the current domain inside an STW callback?
    pub fn domain_is_in_stw(&self) -> bool {
        match tls::domain_self() {
            Some((_, slot)) => match slot.state() {
                Some(dom) => dom.inside_stw_handler.load(Ordering::Relaxed),
                None => false,
            },
            None => false,
        }
    }

    pub(crate) fn stw_participants(&self) -> StwParticipants<'_> {
        StwParticipants {
            slots: &self.stw.participating,
            len: self.stw.num_domains.load(Ordering::Relaxed),
        }
    }

    /// Run the current section on behalf of the calling thread's domain.
    /// Reached from poll points and from the backup thread.
    pub(crate) fn stw_handler(&self, slot: &DomainSlot) {
        let dom = slot.state().expect("interrupted domain without state");

        if !self.stw.domains_still_running.is_released() {
            self.stw_api_barrier(dom);
        }

        let op = unsafe { self.stw.op.get() };
        debug_assert!(!dom.inside_stw_handler.load(Ordering::Relaxed));
        dom.inside_stw_handler.store(true, Ordering::Relaxed);
        (op.callback)(self, dom, op.data, &self.stw_participants());
        dom.inside_stw_handler.store(false, Ordering::Relaxed);

        self.decrement_stw_domains_still_processing();

        // Check for deferred work here: blocked or waiting threads only
        // execute the interrupt handler and never reach a poll point.
        self.poll_gc_work();
    }

    /// Arrive at the enter barrier; the last arriver releases it.
    fn stw_api_barrier(&self, dom: &DomainState) {
        let status = self.stw.domains_still_running.arrive();
        if barrier_count(status) == self.stw.num_domains.load(Ordering::Relaxed) {
            self.stw.domains_still_running.release();
        } else {
            self.stw_wait_for_running(dom);
        }
    }

    /// Wait for the remaining domains to stop, optionally doing useful
    /// work while spinning.
    fn stw_wait_for_running(&self, dom: &DomainState) {
        let op = unsafe { self.stw.op.get() };

        if let Some(spin_callback) = op.enter_spin_callback {
            let mut spin = SpinWait::new(MAX_SPINS_MEDIUM);
            loop {
                if self.stw.domains_still_running.is_released() {
                    return;
                }
                if !spin_callback(self, dom, op.enter_spin_data) {
                    break;
                }
                if !spin.spin() {
                    break;
                }
            }
        }

        // spin a bit for the other domains, then block
        if spin_until(MAX_SPINS_LONG, || self.stw.domains_still_running.is_released()) {
            return;
        }
        self.stw.domains_still_running.wait();
    }

    /// Leave the section; the last domain out clears the leadership and
    /// wakes anyone waiting to spawn or terminate.
    fn decrement_stw_domains_still_processing(&self) {
        let am_last = self
            .stw
            .num_domains_still_processing
            .fetch_sub(1, Ordering::AcqRel)
            == 1;

        if am_last {
            let _coord = self.coord.lock().unwrap();
            self.stw_leader.store(core::ptr::null_mut(), Ordering::Release);
            self.all_domains_cond.notify_all();
            ddebug!("stw: end of section");
        }
    }

    /// Try to run `callback` on all currently running domains.
    ///
    /// Returns true when this call claimed the section and the callback
    /// ran on every participant; false when another section was in flight
    /// (this call then at most participated in it). Callers retry in a
    /// loop.
    ///
    /// With `sync` the participants rendezvous at the enter barrier before
    /// the callback; without it they run the callback as they notice the
    /// poke, but the leadership is still held until every participant has
    /// finished, so no second section can overlap this one.
    pub fn try_run_on_all_domains_with_spin_work(
        &self,
        sync: bool,
        callback: StwCallback,
        data: *mut (),
        leader_setup: Option<StwLeaderSetup>,
        enter_spin_callback: Option<StwSpinCallback>,
        enter_spin_data: *mut (),
    ) -> bool {
        let (_, slot) = tls::domain_self().expect("STW requested from a non-domain thread");
        let dom = slot.state().expect("domain without state");

        // Don't touch the lock if there is already a leader or the lock is
        // contended; the read is an optimisation that gives up early.
        if self.stw_in_progress() {
            self.handle_incoming_interrupts();
            return false;
        }
        let mut coord = match self.coord.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.handle_incoming_interrupts();
                return false;
            }
        };

        loop {
            if self.stw_in_progress() {
                drop(coord);
                self.handle_incoming_interrupts();
                return false;
            }

            // Starving spawners park new requests; wait for them to be
            // unsuspended, then recheck the leadership.
            if coord.stw_requests_suspended > 0 {
                coord = self.requests_suspended_cond.wait(coord).unwrap();
                continue;
            }

            break;
        }

        // we hold the lock and can claim the leadership
        self.stw_leader
            .store(slot as *const DomainSlot as *mut DomainSlot, Ordering::Release);
        ddebug!("stw: stopping the world (sync={})", sync);

        // All request fields must be in place before any domain is poked.
        unsafe {
            self.stw.op.set(StwOp {
                callback,
                data,
                enter_spin_callback,
                enter_spin_data,
            });
        }
        let num_domains = coord.participating();
        self.stw.num_domains.store(num_domains, Ordering::Relaxed);
        self.stw
            .num_domains_still_processing
            .store(num_domains, Ordering::Release);

        let is_alone = num_domains == 1;
        let should_sync = sync && !is_alone;
        if should_sync {
            self.stw.domains_still_running.reset();
        }

        if let Some(setup) = leader_setup {
            setup(self, dom, data);
        }

        for (i, &slot_id) in coord.participant_ids().iter().enumerate() {
            let d = &self.all_domains[slot_id as usize];
            let d_state = d.state().expect("participant without state");
            self.stw.participating[i].store(
                d_state as *const DomainState as *mut DomainState,
                Ordering::Release,
            );
            debug_assert!(!d.interruptor.has_pending());
            if !core::ptr::eq(d_state, dom) {
                d.interruptor.send();
            }
        }

        // Releasing the lock does not let new domains in: spawners wait on
        // all_domains_cond, which is only broadcast when the section ends.
        // A condvar rather than holding the lock, because the last domain
        // out is not necessarily the one that claimed the leadership.
        drop(coord);

        if should_sync {
            self.stw_api_barrier(dom);
        }

        debug_assert!(!dom.inside_stw_handler.load(Ordering::Relaxed));
        dom.inside_stw_handler.store(true, Ordering::Relaxed);
        callback(self, dom, data, &self.stw_participants());
        dom.inside_stw_handler.store(false, Ordering::Relaxed);

        self.decrement_stw_domains_still_processing();

        true
    }

    /// Synchronous STW: participants rendezvous before the callback
    pub fn try_run_on_all_domains(
        &self,
        callback: StwCallback,
        data: *mut (),
        leader_setup: Option<StwLeaderSetup>,
    ) -> bool {
        self.try_run_on_all_domains_with_spin_work(true, callback, data, leader_setup, None, core::ptr::null_mut())
    }

    /// Asynchronous STW: no rendezvous, leadership still held to drain
    pub fn try_run_on_all_domains_async(
        &self,
        callback: StwCallback,
        data: *mut (),
        leader_setup: Option<StwLeaderSetup>,
    ) -> bool {
        self.try_run_on_all_domains_with_spin_work(false, callback, data, leader_setup, None, core::ptr::null_mut())
    }

    /// Trap the current domain's own allocation fast path
    pub fn interrupt_self(&self) {
        if let Some((_, slot)) = tls::domain_self() {
            if let Some(dom) = slot.state() {
                dom.interrupt_now();
            }
        }
    }

    /// Poke every activated slot's interrupt word.
    ///
    /// Takes no lock, performs no allocation and cannot panic, so it is
    /// callable from a signal handler. Sound because slots are activated
    /// in index order and interrupt words are never nulled while the
    /// process runs; the first null word means no later slot was ever
    /// activated.
    pub fn interrupt_all_signal_safe(&self) {
        for d in self.all_domains.iter() {
            let word = d.interruptor.interrupt_word_ptr();
            if word.is_null() {
                return;
            }
            unsafe { (*word).store(usize::MAX, Ordering::Release) };
        }
    }

    // --- inner barrier, exposed to STW callbacks ---

    /// Number of domains participating in the current section
    pub fn global_barrier_num_participating(&self) -> usize {
        self.stw.num_domains.load(Ordering::Relaxed)
    }

    /// One phase of the inner barrier: returns once all `num_participating`
    /// domains of the section have arrived.
    pub fn enter_global_barrier(&self, num_participating: usize) {
        debug_assert_eq!(num_participating, self.stw.num_domains.load(Ordering::Relaxed));
        let status = self.stw.barrier.arrive();
        let sense = barrier_sense(status);
        if barrier_count(status) == num_participating {
            self.stw.barrier.flip(sense);
        } else {
            self.global_barrier_wait(sense, num_participating);
        }
    }

    fn global_barrier_wait(&self, sense: usize, num_participating: usize) {
        // not worth spinning long when more than one other domain is due
        let spins = if num_participating == 2 {
            MAX_SPINS_LONG
        } else {
            MAX_SPINS_MEDIUM
        };
        self.stw.barrier.wait_sense_spinning(sense, spins);
    }

    /// Arrive at the inner barrier; the final arriver gets the status back
    /// (always nonzero) and must call
    /// [`Runtime::global_barrier_release_as_final`], everyone else waits.
    pub fn global_barrier_and_check_final(&self, num_participating: usize) -> Option<BarrierStatus> {
        debug_assert_eq!(num_participating, self.stw.num_domains.load(Ordering::Relaxed));
        let status = self.stw.barrier.arrive();
        if barrier_count(status) == num_participating {
            Some(status)
        } else {
            self.global_barrier_wait(barrier_sense(status), num_participating);
            None
        }
    }

    /// Release the peers parked by [`Runtime::global_barrier_and_check_final`]
    pub fn global_barrier_release_as_final(&self, status: BarrierStatus) {
        self.stw.barrier.flip(barrier_sense(status));
    }

    /// Run `f` on exactly one domain of the section, with every other
    /// participant parked at the barrier until `f` returns.
    pub fn global_barrier_if_final<F: FnOnce()>(&self, num_participating: usize, f: F) {
        if let Some(status) = self.global_barrier_and_check_final(num_participating) {
            f();
            self.global_barrier_release_as_final(status);
        }
    }
}
