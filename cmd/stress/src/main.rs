//! pardom stress test
//!
//! Spawn/terminate churn racing a stop-the-world requester, with
//! allocation pressure on every domain. Environment knobs:
//!
//! - `STRESS_ROUNDS` - churn iterations (default 200)
//! - `STRESS_DOMAINS` - churn width per round (default 3)

use pardom::{
    cpu_relax, env_get, init, spawn, DomainState, Runtime, RuntimeConfig, StwParticipants,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

static STWS_RUN: AtomicUsize = AtomicUsize::new(0);
static DONE: AtomicBool = AtomicBool::new(false);

fn nop(_rt: &Runtime, _dom: &DomainState, _data: *mut (), _p: &StwParticipants<'_>) {}

fn main() {
    let rounds: usize = env_get("STRESS_ROUNDS", 200);
    let width: usize = env_get("STRESS_DOMAINS", 3);

    println!("=== pardom stress: {} rounds x {} domains ===", rounds, width);
    let rt = init(RuntimeConfig::default().max_domains(width + 2)).expect("runtime");

    // one long-lived domain hammers stop-the-world requests
    let requester = spawn(|| {
        let mut wins = 0usize;
        while !DONE.load(Ordering::Acquire) {
            if pardom::runtime().try_run_on_all_domains(nop, std::ptr::null_mut(), None) {
                wins += 1;
                STWS_RUN.fetch_add(1, Ordering::SeqCst);
            }
            cpu_relax();
        }
        wins
    })
    .expect("spawn requester");

    let start = Instant::now();
    for round in 0..rounds {
        let handles: Vec<_> = (0..width)
            .map(|_| {
                spawn(|| {
                    // allocation pressure: forces minor collections and
                    // the occasional global major slice
                    for _ in 0..512 {
                        pardom::runtime().alloc_words(16);
                    }
                })
                .expect("spawn churn domain")
            })
            .collect();

        assert!(rt.num_domains_running() <= width + 2);
        for handle in handles {
            handle.join().expect("churn domain");
        }

        if (round + 1) % 50 == 0 {
            println!(
                "round {:>5}: {} stop-the-world sections, {} domains running",
                round + 1,
                STWS_RUN.load(Ordering::SeqCst),
                rt.num_domains_running()
            );
        }
    }

    DONE.store(true, Ordering::Release);
    let wins = requester.join().expect("requester");

    println!(
        "done in {:?}: {} rounds, {} stop-the-world sections won by the requester",
        start.elapsed(),
        rounds,
        wins
    );
}
