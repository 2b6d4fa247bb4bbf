//! Domain lifecycle: the `Runtime` handle, creation, spawn, termination
//!
//! A `Runtime` owns everything process-global: the slot table, the STW
//! request record, the minor-heap reservation and the coordination lock.
//! It is leaked at creation, so every reference to it and to its slots is
//! `'static`; the signal-safe broadcast path reads the slot array without
//! any lock.
//!
//! The thread that calls [`Runtime::create`] becomes the bootstrap domain
//! (unique id 0) and stays a domain for the life of the process.

use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use pardom_core::error::{fatal_error, DomainError, DomainResult};
use pardom_core::id::{DomainIndex, DomainUid};
use pardom_core::state::{BackupMsg, DomainStatus};
use pardom_core::{ddebug, dinfo};

use crate::config::RuntimeConfig;
use crate::minor_heap::norm_minor_heap_size;
use crate::registry::{CoordState, DomainSlot};
use crate::stw::StwRequest;
use crate::tls;

/// How many STW sections a starting domain is willing to sit out before
/// it suspends new STW requests to guarantee its own progress.
const MAX_STWS_BEFORE_SUSPEND: usize = 2;

/// The process-global coordination state, created once and leaked.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,

    /// One slot per possible domain; the base pointer and length never
    /// change, which the signal-safe broadcast relies on
    pub(crate) all_domains: Box<[DomainSlot]>,

    /// Guards the participant prefix, the suspended-request counter and
    /// the unique-id counter; the condvars below pair with it
    pub(crate) coord: Mutex<CoordState>,

    /// Broadcast when an STW section ends; spawners and terminators wait
    /// here
    pub(crate) all_domains_cond: Condvar,

    /// Broadcast when starving spawners unsuspend STW requests
    pub(crate) requests_suspended_cond: Condvar,

    /// Slot of the domain leading the current STW section; null when none
    pub(crate) stw_leader: AtomicPtr<DomainSlot>,

    /// The STW request record
    pub(crate) stw: StwRequest,

    /// Bounds of the minor-heap reservation, in bytes
    pub(crate) minor_heaps_start: AtomicUsize,
    pub(crate) minor_heaps_end: AtomicUsize,

    /// Per-domain reservation slice size, in words; grows only inside the
    /// resize STW section
    pub(crate) minor_heap_max_wsz: AtomicUsize,

    /// Number of running domains
    pub(crate) num_domains_running: AtomicUsize,

    /// Process-wide minor collection epoch
    pub(crate) minor_collections_count: AtomicU64,

    /// Process-wide major-slice epoch
    pub(crate) major_slice_epoch: AtomicU64,
}

impl Runtime {
    /// Build the runtime and turn the calling thread into the bootstrap
    /// domain. The runtime is leaked: it lives until process exit.
    pub fn create(config: RuntimeConfig) -> DomainResult<&'static Runtime> {
        config.validate()?;
        pardom_core::dlog::init();

        let max_domains = config.max_domains;
        let init_wsz = config.init_minor_heap_wsz;
        let rt: &'static Runtime = Box::leak(Box::new(Runtime {
            all_domains: (0..max_domains as u32).map(DomainSlot::new).collect(),
            coord: Mutex::new(CoordState::new(max_domains)),
            all_domains_cond: Condvar::new(),
            requests_suspended_cond: Condvar::new(),
            stw_leader: AtomicPtr::new(core::ptr::null_mut()),
            stw: StwRequest::new(max_domains),
            minor_heaps_start: AtomicUsize::new(0),
            minor_heaps_end: AtomicUsize::new(0),
            minor_heap_max_wsz: AtomicUsize::new(norm_minor_heap_size(init_wsz)),
            num_domains_running: AtomicUsize::new(0),
            minor_collections_count: AtomicU64::new(0),
            major_slice_epoch: AtomicU64::new(0),
            config,
        }));

        // mutators and domains have not started yet: single-executor
        rt.reserve_minor_heaps_single();

        let slot = match rt.domain_create(init_wsz) {
            Ok(slot) => slot,
            Err(_) => fatal_error("failed to create the bootstrap domain"),
        };
        debug_assert_eq!(slot.interruptor.uid(), 0);
        dinfo!("runtime created: {} domain slots", max_domains);
        Ok(rt)
    }

    /// Immutable runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of running domains
    #[inline]
    pub fn num_domains_running(&self) -> usize {
        self.num_domains_running.load(Ordering::Acquire)
    }

    /// Is the current domain the only one running?
    #[inline]
    pub fn domain_alone(&self) -> bool {
        self.num_domains_running() == 1
    }

    /// Unique id of the current domain
    pub fn self_uid(&self) -> DomainUid {
        let (_, slot) = tls::domain_self().expect("not a domain");
        DomainUid::new(slot.interruptor.uid())
    }

    /// Slot index of the current domain
    pub fn self_index(&self) -> DomainIndex {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.id
    }

    /// Yield hint; also drains pending STW interrupts.
    pub fn cpu_relax(&self) {
        match tls::domain_self() {
            Some((_, slot)) => self.handle_incoming_otherwise_relax(slot),
            None => std::thread::yield_now(),
        }
    }

    // --- domain-local storage ---

    /// Read the current domain's local-storage cell
    pub fn dls_get(&self) -> usize {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.state().expect("no state").dls.load(Ordering::Acquire)
    }

    /// Write the current domain's local-storage cell
    pub fn dls_set(&self, v: usize) {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.state().expect("no state").dls.store(v, Ordering::Release);
    }

    /// Compare-and-set on the local-storage cell; true when it held `old`
    pub fn dls_compare_and_set(&self, old: usize, new: usize) -> bool {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.state()
            .expect("no state")
            .dls
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// OS-derived recommendation for how many domains to run, clamped to
    /// `[1, max_domains]`.
    pub fn recommended_domain_count(&self) -> usize {
        let n = affinity_cpu_count()
            .or_else(online_cpu_count)
            .unwrap_or(1);
        n.clamp(1, self.config.max_domains)
    }

    /// Run the configured fork hook; call in the child of `fork`.
    pub fn atfork(&self) {
        (self.config.hooks.atfork)();
    }

    /// Recreate the current domain's lock and condvar in place.
    ///
    /// # Safety
    ///
    /// Only callable in the single-threaded child of `fork`: all other
    /// domains and backup threads are gone there, and nothing else may
    /// touch these objects concurrently.
    pub unsafe fn reset_domain_lock(&self) {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.domain_lock.reinit();
        slot.domain_cond.reinit();
    }

    /// Turn the calling thread into a domain. Claims a free slot, commits
    /// its minor heap and joins the STW participant set.
    ///
    /// On failure everything is unwound in reverse order and the slot is
    /// free again.
    pub(crate) fn domain_create(
        &'static self,
        initial_minor_heap_wsz: usize,
    ) -> DomainResult<&'static DomainSlot> {
        assert!(
            tls::domain_self().is_none(),
            "thread is already a domain"
        );
        ddebug!("domain: creating");

        // Take the coordination lock so the participant set changes
        // atomically; wait out any in-progress STW section first.
        let mut coord = self.coord.lock().unwrap();
        let mut stws_waited = 1;
        while self.stw_in_progress() {
            if stws_waited < MAX_STWS_BEFORE_SUSPEND {
                stws_waited += 1;
                coord = self.all_domains_cond.wait(coord).unwrap();
            } else {
                // prevent new STW requests to avoid our own starvation
                coord.stw_requests_suspended += 1;
                while self.stw_in_progress() {
                    coord = self.all_domains_cond.wait(coord).unwrap();
                }
                coord.stw_requests_suspended -= 1;
                if coord.stw_requests_suspended == 0 {
                    // We still hold the lock, so the waiting requesters
                    // won't wake up yet.
                    self.requests_suspended_cond.notify_all();
                }
                break;
            }
        }

        let slot_id = match coord.next_free() {
            Some(id) => id,
            None => {
                ddebug!("domain: creation failed, no free slot");
                return Err(DomainError::NoFreeSlot);
            }
        };
        let slot = &self.all_domains[slot_id as usize];
        let s = &slot.interruptor;
        debug_assert!(!s.is_running());
        debug_assert!(!s.has_pending());

        let dom = slot.state_or_alloc();

        // Until we hold the domain lock, the state may still be shared
        // with a terminating predecessor.
        slot.domain_lock.lock();
        tls::set_domain_self(self, slot);

        dom.young_limit.store(0, Ordering::Relaxed);
        dom.unique_id.store(s.uid(), Ordering::Relaxed);
        dom.dls.store(0, Ordering::Relaxed);
        dom.requested_minor_gc.store(false, Ordering::Relaxed);
        dom.requested_major_slice.store(false, Ordering::Relaxed);
        dom.requested_global_major_slice.store(false, Ordering::Relaxed);
        dom.requested_external_interrupt.store(false, Ordering::Relaxed);
        dom.marking_done.store(true, Ordering::Relaxed);
        dom.sweeping_done.store(true, Ordering::Relaxed);
        dom.major_slice_epoch.store(0, Ordering::Relaxed);
        dom.backtrace_active
            .store(self.config.backtrace_enabled, Ordering::Relaxed);

        // The initialising write of young_limit must happen before any
        // interrupt can reach this slot.
        s.publish_interrupt_word(&dom.young_limit);
        debug_assert!(!s.has_pending());

        if let Err(e) = self.reallocate_minor_heap(slot, dom, initial_minor_heap_wsz) {
            // unwind: leave the slot exactly as free as we found it
            tls::clear_domain_self();
            slot.domain_lock.unlock();
            ddebug!("domain: creation failed, no minor heap");
            return Err(e);
        }

        // No remaining failure cases: globally visible state can be
        // updated without needing to unwind it.
        let uid = coord.fresh_unique_id();
        s.set_uid(uid);
        dom.unique_id.store(uid, Ordering::Relaxed);
        s.set_running(true);
        self.num_domains_running.fetch_add(1, Ordering::SeqCst);
        coord.add_next_to_participants();
        drop(coord);

        ddebug!("domain: creation complete (uid {})", uid);
        Ok(slot)
    }

    /// Spawn a new domain running `callback`; its result is published
    /// through `term_sync`.
    ///
    /// Blocks until the child has claimed a slot (servicing STW
    /// interrupts meanwhile) and returns the child's unique id.
    pub fn spawn(
        &'static self,
        callback: DomainCallback,
        term_sync: Arc<TermSync>,
    ) -> DomainResult<DomainUid> {
        (self.config.hooks.spawn)();

        let (_, parent_slot) = tls::domain_self().ok_or(DomainError::NotADomain)?;
        ddebug!("domain: spawning a child");

        let params = Arc::new(StartupParams {
            status: AtomicU8::new(DomainStatus::Starting as u8),
            uid: AtomicU64::new(0),
            fail: Mutex::new(None),
        });

        let child_params = Arc::clone(&params);
        let spawned = std::thread::Builder::new()
            .name("pardom-domain".into())
            .spawn(move || domain_thread_func(self, parent_slot, child_params, callback, term_sync));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(_) => return Err(DomainError::ThreadSpawnFailed),
        };

        // While waiting for the child to start up, service stop-the-world
        // requests as they come in so the system keeps making progress.
        let s = &parent_slot.interruptor;
        let mut guard = s.lock.lock().unwrap();
        while DomainStatus::from(params.status.load(Ordering::Acquire)) == DomainStatus::Starting {
            if self.incoming_interrupts_queued() {
                drop(guard);
                self.handle_incoming(parent_slot);
                guard = s.lock.lock().unwrap();
            } else {
                guard = s.cond.wait(guard).unwrap();
            }
        }
        drop(guard);

        match DomainStatus::from(params.status.load(Ordering::Acquire)) {
            DomainStatus::Started => {
                // the child owns its slot now; let the thread run free
                drop(handle);
                // the bootstrap domain gets its backup thread on first spawn
                self.install_backup_thread(parent_slot)?;
                Ok(DomainUid::new(params.uid.load(Ordering::Acquire)))
            }
            _ => {
                let _ = handle.join();
                let reason = params.fail.lock().unwrap().take();
                Err(reason.unwrap_or(DomainError::CreationAllocFailed))
            }
        }
    }

    /// Leave the participant set and tear the domain down. Runs on the
    /// domain's own thread after its callback has returned.
    pub(crate) fn domain_terminate(&'static self, slot: &'static DomainSlot) {
        let dom = slot.state().expect("terminating domain without state");
        let s = &slot.interruptor;

        ddebug!("domain: terminating");
        s.set_terminating(true);

        // No managed code runs on this domain after the stop hook.
        (self.config.hooks.stop)();
        (self.config.hooks.terminated)();

        let mut finished = false;
        let mut had_backup = false;
        while !finished {
            (self.config.gc.finish_sweeping)(self, dom);

            // also joins any STW section that has already poked us
            self.empty_minor_heap_once();

            (self.config.gc.finish_marking)(self, dom);
            (self.config.gc.orphan_ephemerons)(self, dom);
            (self.config.gc.orphan_finalisers)(self, dom);

            // Leaving the participant set must not race with a section
            // being triggered: only leave with the lock held and no
            // interrupt pending, otherwise loop and serve the section.
            let mut coord = self.coord.lock().unwrap();
            if !self.incoming_interrupts_queued()
                && dom.marking_done.load(Ordering::Relaxed)
                && dom.sweeping_done.load(Ordering::Relaxed)
            {
                finished = true;
                s.set_terminating(false);
                s.set_running(false);
                coord.remove_from_participants(slot.id.as_u32());

                // the backup thread may be asleep on the interruptor
                {
                    let _g = s.lock.lock().unwrap();
                    s.cond.notify_all();
                }
                had_backup = slot.backup_thread_running.swap(false, Ordering::Relaxed);
            }
            drop(coord);
        }

        // The state record may be adopted by a fresh domain, but only
        // once we release the domain lock below; teardown is safe while
        // we hold it.
        self.free_minor_heap(slot, dom);
        dom.dls.store(0, Ordering::Relaxed);

        // reap the backup thread; a domain that never had one leaves the
        // message word at Init for the slot's next occupant
        if had_backup {
            slot.set_backup_msg(BackupMsg::Terminate);
            slot.domain_cond.signal();
        }
        tls::clear_domain_self();
        slot.domain_lock.unlock();

        // Last: peers rely on num_domains_running to observe "alone"
        // consistently on their lock-free fast paths.
        self.num_domains_running.fetch_sub(1, Ordering::SeqCst);
        ddebug!("domain: terminated");
    }
}

/// Boxed domain body: runs on the new domain, returns the domain's result
pub type DomainCallback = Box<dyn FnOnce() -> Box<dyn Any + Send> + Send + 'static>;

/// How a domain finished
pub enum DomainOutcome {
    /// The callback returned a value
    Ok(Box<dyn Any + Send>),

    /// The callback panicked; the payload is preserved
    Error(Box<dyn Any + Send>),
}

enum TermState {
    Running,
    Finished(Option<DomainOutcome>),
}

/// Rendezvous between a domain and its joiners: a mutex-protected result
/// slot plus a condvar.
///
/// The domain publishes its outcome and broadcasts, but holds the mutex
/// until its runtime state is fully torn down, so a joiner that returns
/// from [`TermSync::join`] observes the domain gone.
pub struct TermSync {
    state: Mutex<TermState>,
    cond: Condvar,
}

impl TermSync {
    pub fn new() -> Arc<TermSync> {
        Arc::new(TermSync {
            state: Mutex::new(TermState::Running),
            cond: Condvar::new(),
        })
    }

    /// Block until the domain finishes and take its outcome.
    ///
    /// Blocks without servicing STW interrupts: a domain calling this
    /// directly must be inside a blocking section. Panics on a second
    /// join.
    pub fn join(&self) -> DomainOutcome {
        let mut guard = self.state.lock().unwrap();
        loop {
            match &mut *guard {
                TermState::Running => guard = self.cond.wait(guard).unwrap(),
                TermState::Finished(outcome) => {
                    return outcome.take().expect("domain joined twice")
                }
            }
        }
    }

    /// Take the outcome if the domain has finished
    pub fn try_join(&self) -> Option<DomainOutcome> {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            TermState::Running => None,
            TermState::Finished(outcome) => Some(outcome.take().expect("domain joined twice")),
        }
    }
}

/// Spawn handshake, shared between parent and child
struct StartupParams {
    status: AtomicU8,
    uid: AtomicU64,
    fail: Mutex<Option<DomainError>>,
}

/// Body of a spawned domain's thread
fn domain_thread_func(
    rt: &'static Runtime,
    parent_slot: &'static DomainSlot,
    params: Arc<StartupParams>,
    callback: DomainCallback,
    term_sync: Arc<TermSync>,
) {
    let created = rt.domain_create(rt.config.init_minor_heap_wsz);

    // Handshake with the parent under its interruptor lock; it must not
    // miss the status change while deciding whether to sleep.
    {
        let _guard = parent_slot.interruptor.lock.lock().unwrap();
        match &created {
            Ok(slot) => {
                params.uid.store(slot.interruptor.uid(), Ordering::Release);
                params
                    .status
                    .store(DomainStatus::Started as u8, Ordering::Release);
            }
            Err(e) => {
                *params.fail.lock().unwrap() = Some(e.clone());
                params
                    .status
                    .store(DomainStatus::Failed as u8, Ordering::Release);
            }
        }
        parent_slot.interruptor.cond.notify_all();
    }

    let slot = match created {
        Ok(slot) => slot,
        Err(_) => return,
    };

    let outcome = match rt.install_backup_thread(slot) {
        Ok(()) => {
            (rt.config.hooks.initialize)();
            ddebug!("domain: started (uid {})", slot.interruptor.uid());
            match catch_unwind(AssertUnwindSafe(callback)) {
                Ok(value) => DomainOutcome::Ok(value),
                Err(payload) => DomainOutcome::Error(payload),
            }
        }
        Err(e) => DomainOutcome::Error(Box::new(e)),
    };

    // Publish the result and wake the joiners, but keep the mutex across
    // teardown: joiners resume only once this domain's runtime state is
    // gone.
    let mut guard = term_sync.state.lock().unwrap();
    *guard = TermState::Finished(Some(outcome));
    term_sync.cond.notify_all();

    rt.domain_terminate(slot);
    drop(guard);
}

/// Default fork hook: recreate and retake the domain lock in the child.
pub fn atfork_default() {
    if let Some((_, slot)) = tls::domain_self() {
        // child of fork: no other thread exists
        unsafe {
            slot.domain_lock.reinit();
            slot.domain_cond.reinit();
        }
        slot.domain_lock.lock();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn affinity_cpu_count() -> Option<usize> {
    use nix::sched::{sched_getaffinity, CpuSet};
    use nix::unistd::Pid;

    let set = sched_getaffinity(Pid::from_raw(0)).ok()?;
    let count = (0..CpuSet::count())
        .filter(|&i| set.is_set(i).unwrap_or(false))
        .count();
    if count == 0 {
        None
    } else {
        Some(count)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn affinity_cpu_count() -> Option<usize> {
    None
}

fn online_cpu_count() -> Option<usize> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        Some(n as usize)
    } else {
        None
    }
}
