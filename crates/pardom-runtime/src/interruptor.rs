//! Per-domain interrupt mailbox
//!
//! Cross-domain pokes have two halves:
//!
//! - the *interrupt word*: a pointer to the target's `young_limit` cell.
//!   Writing `usize::MAX` through it makes the target's next allocation
//!   check trap into the runtime — zero-cost polling for the mutator.
//! - the *pending flag* plus a lock/condvar pair, for targets that are
//!   currently waiting (spawn handshake, backup thread) rather than
//!   polling.
//!
//! The interrupt word is published with release ordering before the slot
//! joins the STW participant set, and is never reset to null while the
//! process runs (a terminated slot keeps its pointer for reuse). The
//! signal-safe broadcast path depends on both facts.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Interrupt mailbox, one per domain slot
pub struct Interruptor {
    /// Points at the domain state's `young_limit`; null until the slot's
    /// first occupant publishes it
    interrupt_word: AtomicPtr<AtomicUsize>,

    /// Guards blocked-receiver wake-ups only
    pub lock: Mutex<()>,
    pub cond: Condvar,

    /// Slot is in the STW participant set
    running: AtomicBool,

    /// Current occupant is tearing down
    terminating: AtomicBool,

    /// Unique id of the current occupant
    unique_id: AtomicU64,

    /// An interrupt has been sent and not yet handled
    pending: AtomicBool,
}

impl Interruptor {
    pub fn new() -> Self {
        Interruptor {
            interrupt_word: AtomicPtr::new(core::ptr::null_mut()),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            unique_id: AtomicU64::new(0),
            pending: AtomicBool::new(false),
        }
    }

    /// Is an interrupt pending?
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Mark the pending interrupt as taken; called by the receiver as it
    /// enters the handler.
    #[inline]
    pub fn set_handled(&self) {
        self.pending.store(false, Ordering::Release);
    }

    #[inline]
    pub fn set_pending(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Poke this domain: raise the pending flag, wake it if it is blocked,
    /// and trap its allocation fast path.
    pub fn send(&self) {
        self.set_pending();

        // Wake the target in case it is waiting for an interrupt to be
        // processed elsewhere. Taking the lock closes the window between
        // the target's predicate check and its cond wait.
        {
            let _guard = self.lock.lock().unwrap();
            self.cond.notify_all();
        }

        self.interrupt_word_now();
    }

    /// Write `usize::MAX` through the interrupt word.
    ///
    /// Takes no lock and performs no allocation; usable from the
    /// signal-safe broadcast path.
    #[inline]
    pub fn interrupt_word_now(&self) {
        let word = self.interrupt_word.load(Ordering::Relaxed);
        debug_assert!(!word.is_null());
        if !word.is_null() {
            unsafe { (*word).store(usize::MAX, Ordering::Release) };
        }
    }

    /// Publish the interrupt word. Must happen before the slot is appended
    /// to the participant prefix; the release pairs with the acquire in
    /// the signal-safe broadcast.
    pub fn publish_interrupt_word(&self, word: &AtomicUsize) {
        self.interrupt_word
            .store(word as *const AtomicUsize as *mut AtomicUsize, Ordering::Release);
    }

    /// Acquire-load of the interrupt word pointer, for the signal-safe walk
    #[inline]
    pub fn interrupt_word_ptr(&self) -> *mut AtomicUsize {
        self.interrupt_word.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub fn set_terminating(&self, terminating: bool) {
        self.terminating.store(terminating, Ordering::Relaxed);
    }

    #[inline]
    pub fn uid(&self) -> u64 {
        self.unique_id.load(Ordering::Relaxed)
    }

    pub fn set_uid(&self, uid: u64) {
        self.unique_id.store(uid, Ordering::Relaxed);
    }
}

impl Default for Interruptor {
    fn default() -> Self {
        Interruptor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pending_flag() {
        let s = Interruptor::new();
        assert!(!s.has_pending());
        s.set_pending();
        assert!(s.has_pending());
        s.set_handled();
        assert!(!s.has_pending());
    }

    #[test]
    fn test_send_writes_interrupt_word() {
        let word: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        let s = Interruptor::new();
        s.publish_interrupt_word(word);

        s.send();
        assert!(s.has_pending());
        assert_eq!(word.load(Ordering::Acquire), usize::MAX);
    }

    #[test]
    fn test_send_wakes_blocked_receiver() {
        let word: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        let s = Arc::new(Interruptor::new());
        s.publish_interrupt_word(word);

        let s2 = Arc::clone(&s);
        let receiver = thread::spawn(move || {
            let mut guard = s2.lock.lock().unwrap();
            while !s2.has_pending() {
                guard = s2.cond.wait(guard).unwrap();
            }
        });

        thread::sleep(std::time::Duration::from_millis(20));
        s.send();
        receiver.join().unwrap();
        assert!(s.has_pending());
    }
}
