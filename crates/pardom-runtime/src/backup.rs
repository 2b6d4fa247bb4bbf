//! Backup threads
//!
//! Each domain has a companion thread that answers STW pokes while the
//! domain's mutator thread is blocked in a system call or a long native
//! section. The STW coordinator counts on every participant reaching the
//! enter barrier; the backup thread is the stand-in for participants that
//! cannot get there themselves.
//!
//! The mutator and the backup trade the domain lock through the
//! [`BackupMsg`] word; see its state diagram for the transitions.

use pardom_core::ddebug;
use pardom_core::error::{DomainError, DomainResult};
use pardom_core::state::BackupMsg;

use crate::domain::Runtime;
use crate::registry::DomainSlot;
use crate::tls;

/// Body of the backup thread for `slot`
pub(crate) fn backup_thread_func(rt: &'static Runtime, slot: &'static DomainSlot) {
    // the backup acts for the domain when it handles interrupts
    tls::set_domain_self(rt, slot);
    let s = &slot.interruptor;

    let mut msg = slot.backup_msg();
    while msg != BackupMsg::Terminate {
        match msg {
            BackupMsg::InBlockingSection => {
                // Handle interrupts on behalf of the blocked mutator:
                // must hold the domain lock to run the handler, and must
                // never block while holding it, so the mutator can always
                // come back from its blocking section.
                if rt.incoming_interrupts_queued() {
                    if slot.domain_lock.try_lock() {
                        rt.handle_incoming_interrupts();
                        slot.domain_lock.unlock();
                    }
                } else {
                    // Sleep until poked or until the mutator re-enters
                    // managed code.
                    let mut guard = s.lock.lock().unwrap();
                    msg = slot.backup_msg();
                    if msg == BackupMsg::InBlockingSection && !rt.incoming_interrupts_queued() {
                        guard = s.cond.wait(guard).unwrap();
                    }
                    drop(guard);
                }
            }
            BackupMsg::EnteringManaged => {
                // The mutator owns the domain; sleep until it hands the
                // domain over by switching to InBlockingSection.
                slot.domain_lock.lock();
                msg = slot.backup_msg();
                if msg == BackupMsg::EnteringManaged {
                    slot.domain_cond.wait(&slot.domain_lock);
                }
                slot.domain_lock.unlock();
            }
            _ => {
                core::hint::spin_loop();
            }
        }
        msg = slot.backup_msg();
    }

    // handshake for the next occupant of this slot
    slot.set_backup_msg(BackupMsg::Init);
    tls::clear_domain_self();
}

impl Runtime {
    /// Start the backup thread for `slot` if it is not already running.
    ///
    /// Caller must hold the slot's domain lock (every mutator does).
    pub(crate) fn install_backup_thread(
        &'static self,
        slot: &'static DomainSlot,
    ) -> DomainResult<()> {
        use core::sync::atomic::Ordering;

        if slot.backup_thread_running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut msg = slot.backup_msg();
        debug_assert!(msg == BackupMsg::Init || msg == BackupMsg::Terminate);

        while msg != BackupMsg::Init {
            // give the previous occupant's backup thread a chance to exit
            slot.domain_lock.unlock();
            core::hint::spin_loop();
            slot.domain_lock.lock();
            msg = slot.backup_msg();
        }

        // No signals on the backup thread: block everything while it is
        // created so it inherits a full mask.
        let mut old_mask: libc::sigset_t = unsafe { core::mem::zeroed() };
        let mut mask: libc::sigset_t = unsafe { core::mem::zeroed() };
        unsafe {
            libc::sigfillset(&mut mask);
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut old_mask);
        }

        slot.set_backup_msg(BackupMsg::EnteringManaged);
        let spawned = std::thread::Builder::new()
            .name(format!("pardom-backup-{}", slot.id))
            .spawn(move || backup_thread_func(self, slot));

        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, core::ptr::null_mut());
        }

        match spawned {
            Ok(handle) => {
                slot.backup_thread_running.store(true, Ordering::Relaxed);
                // detached: the backup reaps itself through the msg word
                drop(handle);
                ddebug!("backup: installed");
                Ok(())
            }
            Err(_) => {
                slot.set_backup_msg(BackupMsg::Init);
                Err(DomainError::BackupThreadSpawnFailed)
            }
        }
    }

    /// Reacquire the current domain's lock (end of a blocking section)
    pub fn acquire_domain_lock(&self) {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.domain_lock.lock();
    }

    /// Release the current domain's lock (start of a blocking section)
    pub fn release_domain_lock(&self) {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.domain_lock.unlock();
    }

    /// The mutator is about to run managed code again: take interrupt
    /// servicing back from the backup thread.
    pub fn bt_enter_managed(&self) {
        use core::sync::atomic::Ordering;
        let (_, slot) = tls::domain_self().expect("not a domain");
        debug_assert!(
            self.domain_alone() || slot.backup_thread_running.load(Ordering::Relaxed)
        );
        if slot.backup_thread_running.load(Ordering::Relaxed) {
            slot.set_backup_msg(BackupMsg::EnteringManaged);
            // nudge the backup off the interruptor condvar so it notices
            let _guard = slot.interruptor.lock.lock().unwrap();
            slot.interruptor.cond.notify_all();
        }
    }

    /// The mutator is leaving managed code: hand interrupt servicing to
    /// the backup thread.
    pub fn bt_exit_managed(&self) {
        use core::sync::atomic::Ordering;
        let (_, slot) = tls::domain_self().expect("not a domain");
        debug_assert!(
            self.domain_alone() || slot.backup_thread_running.load(Ordering::Relaxed)
        );
        if slot.backup_thread_running.load(Ordering::Relaxed) {
            slot.set_backup_msg(BackupMsg::InBlockingSection);
            // wake the backup if it is sleeping on the domain condvar
            slot.domain_cond.signal();
        }
    }

    /// Enter a blocking section: the backup thread services STW pokes
    /// until [`Runtime::leave_blocking_section`].
    pub fn enter_blocking_section(&self) {
        self.bt_exit_managed();
        self.release_domain_lock();
    }

    /// Leave a blocking section and resume servicing interrupts inline
    pub fn leave_blocking_section(&self) {
        self.acquire_domain_lock();
        self.bt_enter_managed();
    }

    /// Is the current domain inside a blocking section?
    pub fn is_in_blocking_section(&self) -> bool {
        let (_, slot) = tls::domain_self().expect("not a domain");
        slot.backup_msg() == BackupMsg::InBlockingSection
    }
}
