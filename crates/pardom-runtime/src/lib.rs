//! # pardom-runtime
//!
//! Platform-specific runtime for the pardom multi-domain core.
//!
//! This crate provides:
//! - Domain registry and slot management
//! - The stop-the-world (STW) coordinator
//! - Backup threads that service STW interrupts for blocked mutators
//! - Minor-heap reservation management (mmap)
//! - GC poll points (allocation check, interrupt handling)
//! - pthread mutex/condvar wrappers and a sense-reversing barrier

#![allow(dead_code)]

pub mod config;
pub mod sync;
pub mod barrier;
pub mod memory;
pub mod interruptor;
pub mod registry;
pub mod stw;
pub mod backup;
pub mod domain;
pub mod minor_heap;
pub mod poll;
pub mod tls;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use config::{GcHooks, RuntimeConfig, RuntimeHooks};
pub use domain::{DomainOutcome, Runtime, TermSync};
pub use stw::StwParticipants;

// Platform gate: the memory and sync layers are unix-only for now.
cfg_if::cfg_if! {
    if #[cfg(unix)] {
        // ok
    } else {
        compile_error!("pardom-runtime currently supports unix platforms only");
    }
}
