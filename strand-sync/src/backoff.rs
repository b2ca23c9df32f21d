//! Backoff policies consumed by every retry loop in this crate.
//!
//! Policies are cheap value types constructed fresh per operation. `pause`
//! always makes progress (possibly by yielding the OS thread); `try_pause`
//! refuses once the policy would have to yield, letting callers switch
//! strategy instead of losing their time slice.

use strand_platform::hint;

/// A pause policy for contended retry loops.
pub trait Backoff: Default {
    /// Backs off unconditionally.
    fn pause(&mut self);

    /// Backs off if it can be done without yielding the OS thread.
    ///
    /// Returns `false` without pausing once only a yield would help.
    fn try_pause(&mut self) -> bool;

    /// Restores the initial backoff intensity.
    fn reset(&mut self);
}

/// No-op policy for loops that must not pause.
#[derive(Debug, Default)]
pub struct NullBackoff;

impl Backoff for NullBackoff {
    fn pause(&mut self) {}

    fn try_pause(&mut self) -> bool {
        true
    }

    fn reset(&mut self) {}
}

/// Pauses a fixed `PAUSES` processor hints per call.
#[derive(Debug)]
pub struct ConstantBackoff<const PAUSES: u32 = 1>;

impl<const PAUSES: u32> Default for ConstantBackoff<PAUSES> {
    fn default() -> Self {
        Self
    }
}

impl<const PAUSES: u32> Backoff for ConstantBackoff<PAUSES> {
    fn pause(&mut self) {
        hint::pause_n(PAUSES);
    }

    fn try_pause(&mut self) -> bool {
        self.pause();
        true
    }

    fn reset(&mut self) {}
}

/// Starts at one pause and doubles up to `LIMIT`; past that, `pause` yields
/// the OS thread and `try_pause` declines.
#[derive(Debug)]
pub struct ExponentialBackoff<const LIMIT: u32 = 16> {
    count: u32,
}

impl<const LIMIT: u32> Default for ExponentialBackoff<LIMIT> {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl<const LIMIT: u32> Backoff for ExponentialBackoff<LIMIT> {
    fn pause(&mut self) {
        if self.count <= LIMIT {
            hint::pause_n(self.count);
            self.count *= 2;
        } else {
            hint::yield_now();
        }
    }

    fn try_pause(&mut self) -> bool {
        if self.count <= LIMIT {
            hint::pause_n(self.count);
            self.count *= 2;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.count = 1;
    }
}
