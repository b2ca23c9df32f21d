//! Thread spawning with cooperative cancellation.
//!
//! Cancellation is polling-only: [`Thread::cancel`] raises a flag that the
//! target thread observes at explicit [`cancellation_point`] calls. Nothing is
//! interrupted asynchronously.

use std::cell::{Cell, OnceCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Error returned when the OS refuses to create a thread.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn thread")]
pub struct SpawnError(#[from] pub std::io::Error);

/// Error observed at a cancellation point after [`Thread::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("thread cancellation requested")]
pub struct Canceled;

#[derive(Debug, Default)]
struct Shared {
    cancellation_requested: AtomicBool,
}

thread_local! {
    static CURRENT: OnceCell<Arc<Shared>> = const { OnceCell::new() };
    static CANCELLATION_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// A joinable OS thread with a cooperative cancellation flag.
#[derive(Debug)]
pub struct Thread {
    shared: Arc<Shared>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Spawns `f` on a new thread.
pub fn spawn<F>(f: F) -> Result<Thread, SpawnError>
where
    F: FnOnce() + Send + 'static,
{
    let shared = Arc::new(Shared::default());
    let handle = std::thread::Builder::new().spawn({
        let shared = Arc::clone(&shared);
        move || {
            CURRENT.with(|current| {
                let _ = current.set(shared);
            });
            f();
        }
    })?;
    Ok(Thread {
        shared,
        handle: Some(handle),
    })
}

impl Thread {
    /// Blocks until the thread finishes.
    ///
    /// If the thread panicked, the panic is resumed on the joining thread.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(panic) = handle.join()
        {
            std::panic::resume_unwind(panic);
        }
    }

    /// Detaches the thread, letting it run to completion on its own.
    pub fn detach(mut self) {
        self.handle.take();
    }

    /// Requests cooperative cancellation.
    ///
    /// The target observes the request at its next [`cancellation_point`].
    pub fn cancel(&self) {
        self.shared
            .cancellation_requested
            .store(true, Ordering::Release);
    }

    /// Whether [`Thread::cancel`] has been called for this thread.
    pub fn is_cancellation_requested(&self) -> bool {
        self.shared.cancellation_requested.load(Ordering::Acquire)
    }
}

/// Whether cancellation of the current thread has been requested.
///
/// Always `false` on threads not spawned through this module.
pub fn is_cancellation_requested() -> bool {
    CURRENT.with(|current| {
        current
            .get()
            .is_some_and(|shared| shared.cancellation_requested.load(Ordering::Acquire))
    })
}

/// Observes a pending cancellation request, if cancellation is enabled.
pub fn cancellation_point() -> Result<(), Canceled> {
    if CANCELLATION_ENABLED.with(Cell::get) && is_cancellation_requested() {
        return Err(Canceled);
    }
    Ok(())
}

/// Enables or disables cancellation points on the current thread.
///
/// Returns the previous setting.
pub fn set_cancellation_enabled(enabled: bool) -> bool {
    CANCELLATION_ENABLED.with(|flag| flag.replace(enabled))
}

/// Restores the previous cancellation policy when dropped.
#[derive(Debug)]
pub struct ScopedCancellationPolicy {
    previous: bool,
}

impl ScopedCancellationPolicy {
    /// Applies `enabled` as the current thread's cancellation policy.
    pub fn new(enabled: bool) -> Self {
        Self {
            previous: set_cancellation_enabled(enabled),
        }
    }
}

impl Drop for ScopedCancellationPolicy {
    fn drop(&mut self) {
        set_cancellation_enabled(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use ntest_timeout::timeout;

    use super::{ScopedCancellationPolicy, Thread, spawn};

    #[test]
    #[timeout(5000)]
    fn spawn_and_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let thread = spawn({
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::Release)
        })
        .unwrap();
        thread.join();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    #[timeout(5000)]
    fn cancellation_is_observed() {
        let observed = Arc::new(AtomicBool::new(false));
        let thread = spawn({
            let observed = Arc::clone(&observed);
            move || {
                while super::cancellation_point().is_ok() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                observed.store(true, Ordering::Release);
            }
        })
        .unwrap();
        thread.cancel();
        assert!(thread.is_cancellation_requested());
        thread.join();
        assert!(observed.load(Ordering::Acquire));
    }

    #[test]
    #[timeout(5000)]
    fn cancellation_policy_is_scoped() {
        let thread = spawn(|| {
            let disabled = ScopedCancellationPolicy::new(false);
            while !super::is_cancellation_requested() {
                std::thread::sleep(Duration::from_millis(1));
            }
            // Requested but masked by the scoped policy.
            assert!(super::cancellation_point().is_ok());
            drop(disabled);
            assert!(super::cancellation_point().is_err());
        })
        .unwrap();
        thread.cancel();
        thread.join();
    }

    #[test]
    fn foreign_threads_are_never_canceled() {
        assert!(!super::is_cancellation_requested());
        assert!(super::cancellation_point().is_ok());
    }

    #[test]
    fn detach_does_not_block() {
        let thread: Thread = spawn(|| std::thread::sleep(Duration::from_millis(10))).unwrap();
        thread.detach();
    }
}
