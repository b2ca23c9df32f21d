//! Spin-only barrier for small fixed thread groups.

use core::sync::atomic::{AtomicU32, Ordering};

use strand_platform::hint;

/// A reusable barrier that spins instead of suspending.
///
/// All `total_count` threads must reach [`SpinBarrier::wait`] before any
/// proceeds. Reusable across rounds; intended for a handful of threads that
/// are known to arrive nearly together, not for oversubscribed systems.
#[derive(Debug)]
pub struct SpinBarrier {
    total_count: u32,
    wait_count: AtomicU32,
    ready_count: AtomicU32,
}

impl SpinBarrier {
    /// Creates a barrier for `total_count` threads.
    pub const fn new(total_count: u32) -> Self {
        Self {
            total_count,
            wait_count: AtomicU32::new(total_count),
            ready_count: AtomicU32::new(0),
        }
    }

    /// Blocks (spinning) until every thread has arrived.
    ///
    /// Returns `true` on exactly one thread per round: the last one through,
    /// which also re-arms the barrier for the next round.
    pub fn wait(&self) -> bool {
        self.wait_count.fetch_sub(1, Ordering::Relaxed);
        while self.wait_count.load(Ordering::Acquire) != 0 {
            hint::pause();
        }

        // Count threads through the barrier; the last one re-arms it.
        if self.ready_count.fetch_add(1, Ordering::AcqRel) == self.total_count - 1 {
            self.ready_count.store(0, Ordering::Relaxed);
            self.wait_count.store(self.total_count, Ordering::Release);
            return true;
        }
        false
    }
}
