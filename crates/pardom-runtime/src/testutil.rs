//! Shared helpers for the concurrency tests
//!
//! Every test builds its own (leaked) runtime on its own thread, so tests
//! stay independent under the parallel test harness. The calling test
//! thread is the bootstrap domain of its runtime; helpers that wait
//! therefore keep servicing STW interrupts instead of blocking blindly.

use core::sync::atomic::{AtomicBool, Ordering};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pardom_core::id::DomainUid;

use crate::config::RuntimeConfig;
use crate::domain::{DomainOutcome, Runtime, TermSync};

/// Run a test body on a fresh thread. Runtime-creating tests need one:
/// the creating thread becomes the bootstrap domain of its runtime, and a
/// harness thread (reused when tests run single-threaded) can only be the
/// bootstrap of one runtime, ever.
pub(crate) fn run_domain_test(body: impl FnOnce() + Send + 'static) {
    let handle = std::thread::Builder::new()
        .name("pardom-test".into())
        .spawn(body)
        .expect("failed to spawn test thread");
    if let Err(payload) = handle.join() {
        std::panic::resume_unwind(payload);
    }
}

/// A small runtime for one test; the calling thread becomes its bootstrap
/// domain.
pub(crate) fn test_runtime(max_domains: usize) -> &'static Runtime {
    Runtime::create(
        RuntimeConfig::from_env()
            .max_domains(max_domains)
            .init_minor_heap_wsz(1 << 14),
    )
    .expect("failed to create test runtime")
}

/// Spawn a domain running `f`; its result is wrapped for the term-sync
/// record.
pub(crate) fn spawn_domain<T, F>(rt: &'static Runtime, f: F) -> Arc<TermSync>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let sync = TermSync::new();
    rt.spawn(
        Box::new(move || Box::new(f()) as Box<dyn Any + Send>),
        Arc::clone(&sync),
    )
    .expect("spawn failed");
    sync
}

/// Spawn a domain that polls for interrupts until `stop` is raised.
pub(crate) fn spawn_looper(
    rt: &'static Runtime,
    stop: &Arc<AtomicBool>,
) -> (DomainUid, Arc<TermSync>) {
    let stop = Arc::clone(stop);
    let sync = TermSync::new();
    let uid = rt
        .spawn(
            Box::new(move || {
                let (rt, _) = crate::tls::domain_self().unwrap();
                while !stop.load(Ordering::Acquire) {
                    rt.cpu_relax();
                }
                Box::new(()) as Box<dyn Any + Send>
            }),
            Arc::clone(&sync),
        )
        .expect("spawn failed");
    (uid, sync)
}

/// Join a domain from inside a blocking section, so the caller's backup
/// thread keeps answering STW pokes while the join blocks. The terminating
/// domain holds the term-sync mutex across its own teardown, and that
/// teardown needs every other domain to keep participating in sections.
pub(crate) fn join_domain(rt: &'static Runtime, sync: &TermSync) -> DomainOutcome {
    rt.enter_blocking_section();
    let outcome = sync.join();
    rt.leave_blocking_section();
    outcome
}

/// Poll `pred` (servicing interrupts) until it holds or 10s elapse.
pub(crate) fn wait_until(rt: &'static Runtime, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        rt.cpu_relax();
        std::thread::yield_now();
    }
    false
}
