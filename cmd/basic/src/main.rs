//! Basic pardom example
//!
//! Spawns a few domains and runs a stop-the-world callback across them.

use pardom::{cpu_relax, init, self_uid, spawn, DomainState, Runtime, RuntimeConfig, StwParticipants};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

static STW_VISITS: AtomicUsize = AtomicUsize::new(0);

fn visit(_rt: &Runtime, dom: &DomainState, _data: *mut (), parts: &StwParticipants<'_>) {
    println!(
        "[domain {}] inside the stop-the-world section ({} participants)",
        dom.index(),
        parts.len()
    );
    STW_VISITS.fetch_add(1, Ordering::SeqCst);
}

fn main() {
    println!("=== pardom basic example ===\n");

    let rt = init(RuntimeConfig::default().max_domains(8)).expect("runtime");
    println!("bootstrap domain: uid {}", self_uid());

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let stop = Arc::clone(&stop);
        let handle = spawn(move || {
            println!("[domain spawned] uid {}", self_uid());
            while !stop.load(Ordering::Acquire) {
                cpu_relax();
            }
            self_uid().as_u64()
        })
        .expect("spawn");
        println!("spawned domain: uid {}", handle.uid());
        handles.push(handle);
    }

    // pause the world: every running domain executes `visit` once
    while !rt.try_run_on_all_domains(visit, std::ptr::null_mut(), None) {
        cpu_relax();
    }
    while rt.stw_in_progress() {
        cpu_relax();
    }
    println!("\nstop-the-world visited {} domains", STW_VISITS.load(Ordering::SeqCst));

    stop.store(true, Ordering::Release);
    for handle in handles {
        let uid = handle.join().expect("domain result");
        println!("joined domain: uid {}", uid);
    }

    println!("\nrunning domains at exit: {}", rt.num_domains_running());
}
