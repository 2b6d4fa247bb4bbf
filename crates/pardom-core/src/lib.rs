//! # pardom-core
//!
//! Core types for the pardom multi-domain runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations are in `pardom-runtime`.
//!
//! ## Modules
//!
//! - `id` - Domain index and unique-id types
//! - `state` - Backup-thread message and spawn-handshake enums
//! - `domain_state` - Per-domain mutable state record
//! - `error` - Error types
//! - `spin` - Bounded spin-wait helpers
//! - `dlog` - Domain-aware debug printing macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod id;
pub mod state;
pub mod domain_state;
pub mod error;
pub mod spin;
pub mod dlog;
pub mod env;

// Re-exports for convenience
pub use id::{DomainIndex, DomainUid};
pub use state::{BackupMsg, DomainStatus};
pub use domain_state::DomainState;
pub use error::{fatal_error, DomainError, DomainResult, MemoryError};
pub use spin::SpinWait;
pub use env::{env_get, env_get_bool};

/// Constants shared by the whole runtime
pub mod constants {
    /// Default cap on concurrently running domains.
    ///
    /// Fixes the size of the slot array; overridable at runtime creation.
    pub const DEFAULT_MAX_DOMAINS: usize = 128;

    /// Hard ceiling for `max_domains`, to keep the slot table bounded.
    pub const MAX_DOMAINS_LIMIT: usize = 4096;

    /// Default minor heap size for new domains, in words.
    pub const DEFAULT_MINOR_HEAP_WSZ: usize = 256 * 1024;

    /// Smallest minor heap a domain may request, in words.
    pub const MINOR_HEAP_MIN_WSZ: usize = 4096;

    /// Bytes per word.
    pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

    /// Largest allocation served from the minor heap, in words.
    /// Bigger requests go straight to the shared heap.
    pub const MAX_YOUNG_WSZ: usize = 256;

    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;
}
