//! The waitable contract and the `wait_for*` combinators.

use core::ptr::NonNull;

use strand_platform::Semaphore;

use crate::meta_scheduler;
use crate::waiter::Waiter;

/// How a `wait_for*` call should suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitMode {
    /// Number of non-blocking attempts before committing to a kernel wait.
    pub spin_count: u32,
    /// Whether an installed cooperative scheduler may run pending work while
    /// this thread logically waits. With no scheduler installed this behaves
    /// like [`WaitMode::block`].
    pub run_cooperative: bool,
}

impl WaitMode {
    /// Spins indefinitely without ever suspending the thread.
    pub const fn poll() -> Self {
        Self {
            spin_count: u32::MAX,
            run_cooperative: false,
        }
    }

    /// Spins `spin_count` times, then blocks in the kernel.
    pub const fn block(spin_count: u32) -> Self {
        Self {
            spin_count,
            run_cooperative: false,
        }
    }

    /// Spins `spin_count` times, then hands the thread to a cooperative
    /// scheduler if one is installed, otherwise blocks.
    pub const fn run(spin_count: u32) -> Self {
        Self {
            spin_count,
            run_cooperative: true,
        }
    }
}

impl Default for WaitMode {
    fn default() -> Self {
        Self::run(0)
    }
}

/// Pointer to a semaphore owned by a waiting thread's stack frame or context.
///
/// Waiter callbacks run on the signaling thread, so the capture must be
/// `Send`; the wait protocol guarantees the semaphore outlives the callback.
#[derive(Clone, Copy)]
pub(crate) struct SemaphoreRef(*const Semaphore);

// SAFETY: `Semaphore` is `Sync`, and the waiter protocol keeps the referent
// alive until the callback has completed.
unsafe impl Send for SemaphoreRef {}

impl SemaphoreRef {
    pub(crate) fn new(semaphore: &Semaphore) -> Self {
        Self(semaphore)
    }

    pub(crate) fn post(self) {
        // SAFETY: see the `Send` justification above.
        unsafe { (*self.0).post() }
    }
}

/// An object a thread can wait on.
///
/// `add_waiter` returning `false` means "already signaled, callback not
/// armed": the caller must treat the waitable as immediately satisfied. That
/// return is the expected synchronous-ready path, not an error.
pub trait Waitable {
    /// Arms `waiter` to be notified when this waitable signals.
    ///
    /// Returns `false` without installing anything if the waitable is already
    /// signaled at the linearization point. Primitives may fold side effects
    /// into this (a mutex hands the caller the lock when it observes it
    /// free).
    ///
    /// # Safety
    ///
    /// `waiter` must be live, unlinked, and stay valid until it is either
    /// notified or successfully removed.
    unsafe fn add_waiter(&self, waiter: NonNull<Waiter>) -> bool;

    /// Unlinks a previously armed `waiter`.
    ///
    /// Returns `true` if this call unlinked it (ownership is back with the
    /// caller), `false` if the waitable already consumed it — at most one of
    /// removal and notification succeeds.
    ///
    /// # Safety
    ///
    /// `waiter` must be one this caller armed on this waitable.
    unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool;

    /// Whether this waitable releases its waiters in a fixed order.
    ///
    /// Order-dependent waitables (a mutex) must be waited on one at a time;
    /// order-independent ones (events) can be armed in parallel.
    fn is_order_dependent(&self) -> bool;
}

/// Blocks the calling thread until `waitable` signals.
///
/// With a meta-scheduler context on this thread, the context's persistent
/// waiter and wait semaphore are reused; otherwise an ad-hoc semaphore is
/// built on the stack.
pub fn wait_for(waitable: &dyn Waitable, mode: WaitMode) {
    if let Some(context) = meta_scheduler::current_context() {
        // SAFETY: the persistent waiter outlives this wait; its callback posts
        // the context's wait semaphore, which we consume below, so the waiter
        // is out of the list again before the next use.
        if unsafe { waitable.add_waiter(context.persistent_waiter()) } {
            context.wait_semaphore().spin_wait(mode.spin_count);
        }
        return;
    }

    let semaphore = Semaphore::new(0);
    // The semaphore stays on this stack frame until the wait completes, and
    // posting is the callback's last access.
    let poster = SemaphoreRef::new(&semaphore);
    let waiter = Waiter::create(move || poster.post(), true);
    // SAFETY: a transient waiter is consumed by its notification; we only
    // destroy it on the not-armed path.
    if unsafe { waitable.add_waiter(waiter) } {
        semaphore.spin_wait(mode.spin_count);
    } else {
        // SAFETY: `add_waiter` returned false, so the waiter was never
        // installed and is still ours.
        unsafe { Waiter::destroy(waiter) };
    }
}

/// Blocks until every waitable in `waitables` has signaled.
///
/// Order-dependent waitables are waited on sequentially in pointer order so
/// that threads waiting for overlapping sets cannot deadlock each other;
/// order-independent ones are armed in parallel against a shared semaphore.
/// An empty slice returns immediately.
pub fn wait_for_all(waitables: &[&dyn Waitable], mode: WaitMode) {
    let mut ordered: Vec<&dyn Waitable> = Vec::new();
    let mut unordered: Vec<&dyn Waitable> = Vec::new();
    for &waitable in waitables {
        if waitable.is_order_dependent() {
            ordered.push(waitable);
        } else {
            unordered.push(waitable);
        }
    }

    // Order dependent does not imply fair, so take them one at a time, in an
    // order every competing thread agrees on.
    ordered.sort_by_key(|waitable| core::ptr::from_ref::<dyn Waitable>(*waitable) as *const () as usize);
    for waitable in ordered {
        wait_for(waitable, mode);
    }

    if !unordered.is_empty() {
        with_wait_semaphore(|semaphore| {
            let poster = SemaphoreRef::new(semaphore);
            let mut added_count = 0;
            for waitable in &unordered {
                // Each transient waiter posts the shared semaphore and is
                // consumed by exactly one of notification (freeing itself) or
                // never being armed.
                let waiter = Waiter::create(move || poster.post(), true);
                // SAFETY: the semaphore outlives the waits below, and armed
                // waiters stay valid until their notification runs.
                if unsafe { waitable.add_waiter(waiter) } {
                    added_count += 1;
                } else {
                    // SAFETY: not armed, still ours.
                    unsafe { Waiter::destroy(waiter) };
                }
            }

            for _ in 0..added_count {
                semaphore.spin_wait(mode.spin_count);
            }
        });
    }
}

/// Blocks until at least one waitable in `waitables` has signaled, returning
/// the indices of all that did.
///
/// The result always has at least one member (for a non-empty input). Every
/// waitable whose waiter could not be removed afterwards is part of the
/// result: its callback fired and consumed the waiter.
pub fn wait_for_any(waitables: &[&dyn Waitable], mode: WaitMode) -> Vec<usize> {
    if waitables.is_empty() {
        return Vec::new();
    }

    with_wait_semaphore(|semaphore| {
        let poster = SemaphoreRef::new(semaphore);
        let mut armed: Vec<(usize, NonNull<Waiter>)> = Vec::with_capacity(waitables.len());
        let mut signaled: Vec<usize> = Vec::new();

        for (index, waitable) in waitables.iter().enumerate() {
            // Persistent waiters: we reclaim them explicitly below, after
            // accounting for in-flight callbacks.
            let waiter = Waiter::create(move || poster.post(), false);
            // SAFETY: the waiter stays valid until removed or its callback has
            // completed, both of which happen before this function returns.
            if unsafe { waitable.add_waiter(waiter) } {
                armed.push((index, waiter));
            } else {
                // Synchronously satisfied; keep scanning so every
                // already-signaled waitable ends up in the result.
                // SAFETY: not armed, still ours.
                unsafe { Waiter::destroy(waiter) };
                signaled.push(index);
            }
        }

        // Only wait if nothing was synchronously ready.
        let synchronously_ready = !signaled.is_empty();
        if !synchronously_ready {
            semaphore.spin_wait(mode.spin_count);
        }

        let mut fired = 0;
        for &(index, waiter) in &armed {
            // SAFETY: `waiter` was armed on `waitables[index]` above.
            if !unsafe { waitables[index].remove_waiter(waiter) } {
                // The waitable fired and consumed this waiter.
                signaled.push(index);
                fired += 1;
            }
        }

        // Every fired callback posts the semaphore once; one post was already
        // consumed by the blocking wait (unless we never blocked). Drain the
        // remainder so the semaphore returns to balance.
        assert!(!signaled.is_empty());
        let drains = if synchronously_ready { fired } else { fired - 1 };
        for _ in 0..drains {
            semaphore.spin_wait(mode.spin_count);
        }

        for (_, waiter) in armed {
            // SAFETY: removed or drained above; no callback can still touch
            // these persistent waiters.
            unsafe { Waiter::destroy(waiter) };
        }

        signaled.sort_unstable();
        signaled
    })
}

/// Runs `operation` against the current meta-scheduler context's wait
/// semaphore, or a fresh local one when the thread has no context.
fn with_wait_semaphore<R>(operation: impl FnOnce(&Semaphore) -> R) -> R {
    match meta_scheduler::current_context() {
        Some(context) => operation(context.wait_semaphore()),
        None => {
            let semaphore = Semaphore::new(0);
            operation(&semaphore)
        }
    }
}
