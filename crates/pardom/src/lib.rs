//! # pardom - parallel domains
//!
//! Multi-domain coordination core for a managed-language runtime: domains
//! (one per OS thread running managed code), stop-the-world sections that
//! pause every domain at a safe point and run the same callback in
//! parallel, backup threads that stand in for domains blocked in native
//! code, and a shared contiguous minor-heap reservation resized under
//! stop-the-world protection.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pardom::{init, spawn, RuntimeConfig};
//!
//! fn main() {
//!     // The calling thread becomes the bootstrap domain (unique id 0).
//!     let rt = init(RuntimeConfig::default()).unwrap();
//!
//!     let handle = spawn(|| {
//!         // managed work; allocation polls for stop-the-world requests
//!         pardom::cpu_relax();
//!         42usize
//!     })
//!     .unwrap();
//!
//!     assert_eq!(handle.join().unwrap(), 42);
//!     assert_eq!(rt.num_domains_running(), 1);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       User Code                          │
//! │        spawn(), join(), cpu_relax(), dls_get/set         │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    STW Coordinator                       │
//! │    leader claim, interrupt pokes, enter barrier, exit    │
//! └──────────────────────────────────────────────────────────┘
//!          │                  │                   │
//!          ▼                  ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Domain   │      │  Domain   │      │  Backup   │
//!    │  Thread   │      │  Thread   │      │  Threads  │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                  │                   │
//!          └──────────────────┼───────────────────┘
//!                             ▼
//!    ┌──────────────────────────────────────────────────────┐
//!    │                Minor-Heap Reservation                │
//!    │    max_domains equal slices, commit/decommit, mmap   │
//!    └──────────────────────────────────────────────────────┘
//! ```

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

// Re-export core types
pub use pardom_core::{
    BackupMsg, DomainError, DomainIndex, DomainResult, DomainState, DomainUid, MemoryError,
};

// Re-export logging macros and helpers
pub use pardom_core::dlog::{set_log_level, LogLevel};
pub use pardom_core::{ddebug, derror, dinfo, dtrace, dwarn};
pub use pardom_core::{env_get, env_get_bool};

// Re-export runtime types
pub use pardom_runtime::{
    DomainOutcome, GcHooks, Runtime, RuntimeConfig, RuntimeHooks, StwParticipants, TermSync,
};

use pardom_runtime::tls;

/// Create the runtime; the calling thread becomes the bootstrap domain
/// (unique id 0) and remains a domain for the life of the process.
pub fn init(config: RuntimeConfig) -> DomainResult<&'static Runtime> {
    Runtime::create(config)
}

/// The runtime of the current domain. Panics on a non-domain thread.
pub fn runtime() -> &'static Runtime {
    tls::domain_self()
        .expect("current thread is not a pardom domain")
        .0
}

/// Handle to a spawned domain
pub struct JoinHandle<T> {
    uid: DomainUid,
    sync: Arc<TermSync>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    /// Unique id of the spawned domain
    pub fn uid(&self) -> DomainUid {
        self.uid
    }

    /// Wait for the domain to finish and take its result; a panic in the
    /// domain body comes back as `Err` with the payload.
    ///
    /// When called from a domain, the wait happens inside a blocking
    /// section, so this domain's backup thread keeps answering
    /// stop-the-world requests meanwhile.
    pub fn join(self) -> Result<T, Box<dyn Any + Send>> {
        let outcome = match tls::domain_self() {
            Some((rt, _)) => {
                rt.enter_blocking_section();
                let outcome = self.sync.join();
                rt.leave_blocking_section();
                outcome
            }
            None => self.sync.join(),
        };
        match outcome {
            DomainOutcome::Ok(value) => Ok(*value
                .downcast::<T>()
                .expect("domain result has the spawned type")),
            DomainOutcome::Error(payload) => Err(payload),
        }
    }
}

/// Spawn a new domain running `f`.
///
/// Fails when no slot is free, the OS refuses the thread, or the new
/// domain's allocations fail; the slot is fully released on failure.
pub fn spawn<T, F>(f: F) -> DomainResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let rt = tls::domain_self().ok_or(DomainError::NotADomain)?.0;
    let sync = TermSync::new();
    let uid = rt.spawn(
        Box::new(move || Box::new(f()) as Box<dyn Any + Send>),
        Arc::clone(&sync),
    )?;
    Ok(JoinHandle {
        uid,
        sync,
        _marker: PhantomData,
    })
}

/// Unique id of the current domain
pub fn self_uid() -> DomainUid {
    runtime().self_uid()
}

/// Slot index of the current domain
pub fn self_index() -> DomainIndex {
    runtime().self_index()
}

/// Yield hint; also drains pending stop-the-world interrupts.
pub fn cpu_relax() {
    runtime().cpu_relax()
}

/// Read the current domain's local-storage cell
pub fn dls_get() -> usize {
    runtime().dls_get()
}

/// Write the current domain's local-storage cell
pub fn dls_set(v: usize) {
    runtime().dls_set(v)
}

/// Compare-and-set the local-storage cell; true when it held `old`
pub fn dls_compare_and_set(old: usize, new: usize) -> bool {
    runtime().dls_compare_and_set(old, new)
}

/// OS-derived recommendation for how many domains to run
pub fn recommended_domain_count() -> usize {
    runtime().recommended_domain_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test body runs on a fresh thread: that thread becomes the
    // bootstrap domain of its own runtime.
    fn run_domain_test(body: impl FnOnce() + Send + 'static) {
        let handle = std::thread::Builder::new()
            .name("pardom-test".into())
            .spawn(body)
            .expect("failed to spawn test thread");
        if let Err(payload) = handle.join() {
            std::panic::resume_unwind(payload);
        }
    }

    fn test_init(max_domains: usize) -> &'static Runtime {
        init(RuntimeConfig::from_env()
            .max_domains(max_domains)
            .init_minor_heap_wsz(1 << 14))
        .unwrap()
    }

    #[test]
    fn test_spawn_join_value() {
        run_domain_test(|| {
            let rt = test_init(4);
            let handle = spawn(|| 6 * 7).unwrap();
            assert!(handle.uid().as_u64() > 0);
            assert_eq!(handle.join().unwrap(), 42);
            assert_eq!(rt.num_domains_running(), 1);
        });
    }

    #[test]
    fn test_nested_spawn() {
        run_domain_test(|| {
            let _rt = test_init(4);
            let outer = spawn(|| {
                let inner = spawn(|| self_uid().as_u64()).unwrap();
                inner.join().unwrap()
            })
            .unwrap();
            let inner_uid = outer.join().unwrap();
            assert!(inner_uid > 0);
        });
    }

    #[test]
    fn test_panic_payload_round_trips() {
        run_domain_test(|| {
            let _rt = test_init(2);
            let handle = spawn(|| -> usize { panic!("boom") }).unwrap();
            let payload = handle.join().unwrap_err();
            assert_eq!(payload.downcast_ref::<&str>().copied(), Some("boom"));
        });
    }

    #[test]
    fn test_dls_helpers() {
        run_domain_test(|| {
            let _rt = test_init(2);
            dls_set(7);
            assert_eq!(dls_get(), 7);
            assert!(dls_compare_and_set(7, 8));
            assert!(!dls_compare_and_set(7, 9));
            assert_eq!(dls_get(), 8);
        });
    }

    #[test]
    fn test_bootstrap_identity() {
        run_domain_test(|| {
            let rt = test_init(2);
            assert_eq!(self_uid(), DomainUid::BOOTSTRAP);
            assert_eq!(self_index().as_u32(), 0);
            assert!(recommended_domain_count() >= 1);
            assert_eq!(rt.num_domains_running(), 1);
        });
    }
}
