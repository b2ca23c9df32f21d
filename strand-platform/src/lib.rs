//! Operating system collaborators for the Strand concurrency toolkit.
//!
//! The lock-free primitives in `strand-sync` suspend and resume threads through
//! a small set of kernel-backed facilities. This crate provides them:
//!
//! - [`Semaphore`]: a counting semaphore with a spin-then-block wait.
//! - [`ManualResetEvent`]: a mutex/condvar backed manual-reset event.
//! - [`thread`]: thread spawning with cooperative cancellation.
//! - [`affinity`]: processor affinity masks for pinning meta-threads.
//! - [`hint`]: pause and yield hints consumed by backoff policies.
//!
//! Everything here is a thin wrapper over the host OS. Nothing in this crate
//! knows about waiter lists or schedulers.

pub mod affinity;
pub mod event;
pub mod hint;
pub mod semaphore;
pub mod thread;

pub use event::ManualResetEvent;
pub use semaphore::Semaphore;

/// Returns the number of logical processors available to this process.
///
/// Falls back to `1` if the processor count cannot be queried.
pub fn num_processors() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
