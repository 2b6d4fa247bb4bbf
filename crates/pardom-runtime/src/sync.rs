//! pthread mutex and condition-variable wrappers
//!
//! The domain lock is held across arbitrary scopes and handed between the
//! mutator thread and the backup thread, which a guard-based
//! `std::sync::Mutex` cannot express. These wrappers expose plain
//! lock/unlock/wait operations over the raw pthread objects, aborting on
//! any error return the protocol cannot recover from.
//!
//! Lock/unlock pairing is a protocol invariant of the callers, not checked
//! here: unlocking a mutex the thread does not hold is a caller bug.

use core::cell::UnsafeCell;

use pardom_core::error::fatal_error;

fn check(ret: libc::c_int, what: &str) {
    if ret != 0 {
        // no way to continue with a broken lock
        fatal_error(what);
    }
}

/// Plain pthread mutex
pub struct PlatMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The pthread object provides its own synchronisation.
unsafe impl Send for PlatMutex {}
unsafe impl Sync for PlatMutex {}

impl PlatMutex {
    pub fn new() -> Self {
        PlatMutex {
            inner: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
        }
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) {
        check(unsafe { libc::pthread_mutex_lock(self.inner.get()) }, "pthread_mutex_lock");
    }

    /// Acquire the mutex if it is free; true on success
    pub fn try_lock(&self) -> bool {
        let ret = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        match ret {
            0 => true,
            libc::EBUSY => false,
            _ => fatal_error("pthread_mutex_trylock"),
        }
    }

    /// Release the mutex; the calling thread must hold it
    pub fn unlock(&self) {
        check(unsafe { libc::pthread_mutex_unlock(self.inner.get()) }, "pthread_mutex_unlock");
    }

    /// Overwrite with a freshly initialised mutex.
    ///
    /// # Safety
    ///
    /// Only callable in the single-threaded child of `fork`, where every
    /// other holder of the mutex has ceased to exist. The old object is
    /// not destroyed (destroying a mutex another thread held at fork time
    /// is itself undefined).
    pub unsafe fn reinit(&self) {
        core::ptr::write(self.inner.get(), libc::PTHREAD_MUTEX_INITIALIZER);
    }

    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl Default for PlatMutex {
    fn default() -> Self {
        PlatMutex::new()
    }
}

/// Plain pthread condition variable
pub struct PlatCond {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for PlatCond {}
unsafe impl Sync for PlatCond {}

impl PlatCond {
    pub fn new() -> Self {
        PlatCond {
            inner: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
        }
    }

    /// Atomically release `mutex` and sleep until signalled; the mutex is
    /// reacquired before returning. Spurious wakeups happen: callers loop
    /// on their predicate.
    pub fn wait(&self, mutex: &PlatMutex) {
        check(
            unsafe { libc::pthread_cond_wait(self.inner.get(), mutex.raw()) },
            "pthread_cond_wait",
        );
    }

    /// Wake one waiter
    pub fn signal(&self) {
        check(unsafe { libc::pthread_cond_signal(self.inner.get()) }, "pthread_cond_signal");
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        check(
            unsafe { libc::pthread_cond_broadcast(self.inner.get()) },
            "pthread_cond_broadcast",
        );
    }

    /// Overwrite with a freshly initialised condvar.
    ///
    /// # Safety
    ///
    /// Same contract as [`PlatMutex::reinit`]: post-fork child only.
    pub unsafe fn reinit(&self) {
        core::ptr::write(self.inner.get(), libc::PTHREAD_COND_INITIALIZER);
    }
}

impl Default for PlatCond {
    fn default() -> Self {
        PlatCond::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_excludes() {
        let mutex = Arc::new(PlatMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    mutex.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_try_lock_contended() {
        let mutex = Arc::new(PlatMutex::new());
        mutex.lock();

        let mutex2 = Arc::clone(&mutex);
        let handle = thread::spawn(move || mutex2.try_lock());
        assert!(!handle.join().unwrap());

        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn test_cond_signal_wakes() {
        let mutex = Arc::new(PlatMutex::new());
        let cond = Arc::new(PlatCond::new());
        let flag = Arc::new(AtomicBool::new(false));

        let (m, c, f) = (Arc::clone(&mutex), Arc::clone(&cond), Arc::clone(&flag));
        let handle = thread::spawn(move || {
            m.lock();
            while !f.load(Ordering::Relaxed) {
                c.wait(&m);
            }
            m.unlock();
        });

        thread::sleep(std::time::Duration::from_millis(20));
        mutex.lock();
        flag.store(true, Ordering::Relaxed);
        cond.broadcast();
        mutex.unlock();

        handle.join().unwrap();
    }
}
