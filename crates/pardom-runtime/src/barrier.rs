//! Sense-reversing phased barrier
//!
//! One word packs the arrival count (low bits) and the sense (high bit).
//! Arrivers increment the count; the last arriver flips the sense, which
//! both releases the waiters and resets the count for the next phase.
//!
//! Two usage patterns:
//!
//! - **Phased** (reusable): `arrive` / `flip` / `wait_sense`. Used for the
//!   inner barrier STW callbacks split work with.
//! - **One-shot**: `reset` / `arrive` / `release` / `wait` /
//!   `is_released`. Used for the STW enter barrier. A freshly built
//!   barrier starts released, so a section that never reset it (the
//!   asynchronous STW variant) observes it as already passed.
//!
//! Waiters spin for a bounded number of iterations before blocking on the
//! condvar.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use pardom_core::spin::SpinWait;

/// High bit of the barrier word
pub const BARRIER_SENSE_BIT: usize = 1 << (usize::BITS - 1);

const COUNT_MASK: usize = !BARRIER_SENSE_BIT;

/// Packed (sense, count) snapshot returned by [`Barrier::arrive`]
pub type BarrierStatus = usize;

/// Arrival count part of a status word
#[inline]
pub fn barrier_count(status: BarrierStatus) -> usize {
    status & COUNT_MASK
}

/// Sense part of a status word
#[inline]
pub fn barrier_sense(status: BarrierStatus) -> usize {
    status & BARRIER_SENSE_BIT
}

/// Sense-reversing barrier
pub struct Barrier {
    word: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Barrier {
    /// A new barrier starts in the released state
    pub fn new() -> Self {
        Barrier {
            word: AtomicUsize::new(BARRIER_SENSE_BIT),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Arrive at the barrier; returns the packed (sense, count) including
    /// this arrival.
    #[inline]
    pub fn arrive(&self) -> BarrierStatus {
        self.word.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Called by the last arriver of a phase: toggle the sense, zeroing
    /// the count, and wake every blocked waiter.
    pub fn flip(&self, sense: usize) {
        self.word.store(sense ^ BARRIER_SENSE_BIT, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Has some other arriver flipped the sense since `sense` was observed?
    #[inline]
    pub fn sense_has_flipped(&self, sense: usize) -> bool {
        (self.word.load(Ordering::Acquire) & BARRIER_SENSE_BIT) != sense
    }

    /// Block until the sense differs from `sense`. Callers usually spin
    /// via [`Barrier::wait_sense_spinning`] first.
    pub fn wait_sense(&self, sense: usize) {
        let mut guard = self.lock.lock().unwrap();
        while !self.sense_has_flipped(sense) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Spin up to `spins` iterations for the flip, then block.
    pub fn wait_sense_spinning(&self, sense: usize, spins: usize) {
        let mut spin = SpinWait::new(spins);
        loop {
            if self.sense_has_flipped(sense) {
                return;
            }
            if !spin.spin() {
                break;
            }
        }
        self.wait_sense(sense);
    }

    // --- one-shot usage ---

    /// Prepare the barrier for a one-shot rendezvous: count 0, sense clear.
    pub fn reset(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Release a one-shot barrier (last arriver).
    pub fn release(&self) {
        self.flip(0);
    }

    /// Whether a one-shot barrier has been released since the last reset.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.sense_has_flipped(0)
    }

    /// Block until a one-shot barrier is released.
    pub fn wait(&self) {
        self.wait_sense(0);
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Barrier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pardom_core::spin::MAX_SPINS_MEDIUM;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_barrier_is_released() {
        let b = Barrier::new();
        assert!(b.is_released());
        b.reset();
        assert!(!b.is_released());
        b.release();
        assert!(b.is_released());
    }

    #[test]
    fn test_one_shot_rendezvous() {
        const N: usize = 4;
        let barrier = Arc::new(Barrier::new());
        barrier.reset();
        let before = Arc::new(StdAtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..N {
            let barrier = Arc::clone(&barrier);
            let before = Arc::clone(&before);
            handles.push(thread::spawn(move || {
                before.fetch_add(1, Ordering::SeqCst);
                let status = barrier.arrive();
                if barrier_count(status) == N {
                    barrier.release();
                } else {
                    barrier.wait_sense_spinning(barrier_sense(status), MAX_SPINS_MEDIUM);
                }
                // everyone must have incremented before anyone is released
                assert_eq!(before.load(Ordering::SeqCst), N);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(barrier.is_released());
    }

    #[test]
    fn test_phased_reuse() {
        const N: usize = 3;
        const PHASES: usize = 20;
        let barrier = Arc::new(Barrier::new());
        let phase_counts = Arc::new(
            (0..PHASES).map(|_| StdAtomicUsize::new(0)).collect::<Vec<_>>(),
        );

        let mut handles = vec![];
        for _ in 0..N {
            let barrier = Arc::clone(&barrier);
            let phase_counts = Arc::clone(&phase_counts);
            handles.push(thread::spawn(move || {
                for phase in 0..PHASES {
                    phase_counts[phase].fetch_add(1, Ordering::SeqCst);
                    let status = barrier.arrive();
                    if barrier_count(status) == N {
                        barrier.flip(barrier_sense(status));
                    } else {
                        barrier.wait_sense_spinning(barrier_sense(status), MAX_SPINS_MEDIUM);
                    }
                    // no thread may be a phase ahead of a stalled peer
                    assert_eq!(phase_counts[phase].load(Ordering::SeqCst), N);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_blocked_waiter_is_woken() {
        let barrier = Arc::new(Barrier::new());
        barrier.reset();

        let b2 = Arc::clone(&barrier);
        let waiter = thread::spawn(move || {
            let status = b2.arrive();
            // spin budget of zero forces the condvar path
            b2.wait_sense_spinning(barrier_sense(status), 0);
        });

        thread::sleep(std::time::Duration::from_millis(20));
        let status = barrier.arrive();
        assert_eq!(barrier_count(status), 2);
        barrier.release();
        waiter.join().unwrap();
    }
}
