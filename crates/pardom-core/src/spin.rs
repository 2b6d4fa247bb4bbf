//! Bounded spin-wait helpers
//!
//! Waits in the runtime are never unbounded spins: callers spin for a
//! bounded number of iterations with pause hints, then fall back to a
//! blocking primitive (condvar). The bounds below mirror the coordination
//! paths they are used on: a domain waiting for one peer can afford to
//! spin longer than a domain waiting for many.

/// Spin bound for waits that usually resolve in a few cache misses
pub const MAX_SPINS_SHORT: usize = 64;

/// Spin bound for multi-party rendezvous (enter barrier with >2 domains)
pub const MAX_SPINS_MEDIUM: usize = 1_000;

/// Spin bound for two-party rendezvous, where blocking costs more than
/// the expected wait
pub const MAX_SPINS_LONG: usize = 100_000;

/// Incremental spinner with exponential pause backoff.
///
/// ```ignore
/// let mut spin = SpinWait::new(MAX_SPINS_MEDIUM);
/// while !ready() {
///     if !spin.spin() {
///         block_on_condvar();
///         break;
///     }
/// }
/// ```
pub struct SpinWait {
    budget: usize,
    spun: usize,
}

impl SpinWait {
    /// New spinner that allows `budget` iterations before giving up
    #[inline]
    pub fn new(budget: usize) -> Self {
        SpinWait { budget, spun: 0 }
    }

    /// Spin once. Returns false when the budget is exhausted and the
    /// caller should block instead.
    #[inline]
    pub fn spin(&mut self) -> bool {
        if self.spun >= self.budget {
            return false;
        }
        self.spun += 1;
        // pause longer as the wait drags on, capped well below a syscall
        let pauses = (self.spun / 64 + 1).min(32);
        for _ in 0..pauses {
            core::hint::spin_loop();
        }
        true
    }

    /// Iterations spent so far
    #[inline]
    pub fn spun(&self) -> usize {
        self.spun
    }
}

/// Spin until `cond` holds or the budget runs out; true when `cond` held.
#[inline]
pub fn spin_until(budget: usize, mut cond: impl FnMut() -> bool) -> bool {
    let mut spin = SpinWait::new(budget);
    loop {
        if cond() {
            return true;
        }
        if !spin.spin() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_budget_exhausts() {
        let mut spin = SpinWait::new(10);
        let mut iterations = 0;
        while spin.spin() {
            iterations += 1;
        }
        assert_eq!(iterations, 10);
        assert!(!spin.spin());
    }

    #[test]
    fn test_spin_until_success() {
        let mut n = 0;
        assert!(spin_until(100, || {
            n += 1;
            n == 5
        }));
        assert_eq!(n, 5);
    }

    #[test]
    fn test_spin_until_budget() {
        assert!(!spin_until(10, || false));
    }
}
