//! Runtime configuration
//!
//! Compile-time defaults with environment overrides and builder-style
//! setters. Read once at `Runtime::create`; immutable afterwards.
//!
//! Environment variables (all optional):
//! - `PD_MAX_DOMAINS` - cap on concurrent domains (fixes the slot table)
//! - `PD_MINOR_HEAP_WSZ` - initial minor heap size for new domains, words
//! - `PD_BACKTRACE` - enable backtrace recording on new domains (0/1)

use pardom_core::constants::{DEFAULT_MAX_DOMAINS, DEFAULT_MINOR_HEAP_WSZ, MAX_DOMAINS_LIMIT};
use pardom_core::env::{env_get, env_get_bool};
use pardom_core::error::{DomainError, DomainResult};
use pardom_core::DomainState;

use crate::domain::Runtime;

/// Hooks fired at domain lifecycle events.
///
/// All hooks default to no-ops and are fixed at `Runtime::create`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHooks {
    /// Runs on the parent thread before a domain is spawned
    pub spawn: fn(),

    /// Runs on the child thread once its domain exists, before the callback
    pub initialize: fn(),

    /// Runs on the domain thread as termination begins
    pub stop: fn(),

    /// Runs when an external interrupt is serviced
    pub external_interrupt: fn(),

    /// Runs as termination begins, right after the stop hook
    pub terminated: fn(),

    /// Runs in the child process after fork
    pub atfork: fn(),
}

fn hook_noop() {}

impl Default for RuntimeHooks {
    fn default() -> Self {
        RuntimeHooks {
            spawn: hook_noop,
            initialize: hook_noop,
            stop: hook_noop,
            external_interrupt: hook_noop,
            terminated: hook_noop,
            atfork: crate::domain::atfork_default,
        }
    }
}

/// Entry points into the (external) collectors.
///
/// The coordination core treats the minor/major collectors, ephemerons and
/// finalisers as opaque collaborators. The defaults complete instantly so
/// the lifecycle protocol runs end-to-end without a real collector.
#[derive(Debug, Clone, Copy)]
pub struct GcHooks {
    /// Run one major collection slice on this domain
    pub major_collection_slice: fn(&Runtime, &DomainState),

    /// Drain this domain's outstanding marking work
    pub finish_marking: fn(&Runtime, &DomainState),

    /// Drain this domain's outstanding sweeping work
    pub finish_sweeping: fn(&Runtime, &DomainState),

    /// Hand this domain's ephemerons to the surviving domains
    pub orphan_ephemerons: fn(&Runtime, &DomainState),

    /// Hand this domain's finalisers to the surviving domains
    pub orphan_finalisers: fn(&Runtime, &DomainState),
}

fn default_major_slice(_rt: &Runtime, dom: &DomainState) {
    use core::sync::atomic::Ordering;
    dom.marking_done.store(true, Ordering::Relaxed);
    dom.sweeping_done.store(true, Ordering::Relaxed);
}

fn default_finish_marking(_rt: &Runtime, dom: &DomainState) {
    use core::sync::atomic::Ordering;
    dom.marking_done.store(true, Ordering::Relaxed);
}

fn default_finish_sweeping(_rt: &Runtime, dom: &DomainState) {
    use core::sync::atomic::Ordering;
    dom.sweeping_done.store(true, Ordering::Relaxed);
}

fn gc_hook_noop(_rt: &Runtime, _dom: &DomainState) {}

impl Default for GcHooks {
    fn default() -> Self {
        GcHooks {
            major_collection_slice: default_major_slice,
            finish_marking: default_finish_marking,
            finish_sweeping: default_finish_sweeping,
            orphan_ephemerons: gc_hook_noop,
            orphan_finalisers: gc_hook_noop,
        }
    }
}

/// Runtime configuration with builder pattern.
///
/// Use `from_env()` to start with compile-time defaults and apply
/// environment overrides.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Cap on concurrently running domains
    pub max_domains: usize,

    /// Minor heap size for new domains, in words
    pub init_minor_heap_wsz: usize,

    /// Record backtraces on new domains
    pub backtrace_enabled: bool,

    /// Lifecycle hooks
    pub hooks: RuntimeHooks,

    /// Collector entry points
    pub gc: GcHooks,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    pub fn from_env() -> Self {
        RuntimeConfig {
            max_domains: env_get("PD_MAX_DOMAINS", DEFAULT_MAX_DOMAINS),
            init_minor_heap_wsz: env_get("PD_MINOR_HEAP_WSZ", DEFAULT_MINOR_HEAP_WSZ),
            backtrace_enabled: env_get_bool("PD_BACKTRACE", false),
            hooks: RuntimeHooks::default(),
            gc: GcHooks::default(),
        }
    }

    /// Set the domain cap
    pub fn max_domains(mut self, n: usize) -> Self {
        self.max_domains = n;
        self
    }

    /// Set the initial minor heap size, in words
    pub fn init_minor_heap_wsz(mut self, wsz: usize) -> Self {
        self.init_minor_heap_wsz = wsz;
        self
    }

    /// Enable or disable backtrace recording
    pub fn backtrace_enabled(mut self, enabled: bool) -> Self {
        self.backtrace_enabled = enabled;
        self
    }

    /// Install lifecycle hooks
    pub fn hooks(mut self, hooks: RuntimeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install collector entry points
    pub fn gc_hooks(mut self, gc: GcHooks) -> Self {
        self.gc = gc;
        self
    }

    /// Check the configuration for nonsense values
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_domains == 0 {
            return Err(DomainError::InvalidConfig("max_domains must be at least 1"));
        }
        if self.max_domains > MAX_DOMAINS_LIMIT {
            return Err(DomainError::InvalidConfig("max_domains exceeds the slot-table limit"));
        }
        if self.init_minor_heap_wsz == 0 {
            return Err(DomainError::InvalidConfig("init_minor_heap_wsz must be nonzero"));
        }
        Ok(())
    }
}
