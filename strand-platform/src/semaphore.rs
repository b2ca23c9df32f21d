//! Counting semaphore with a spin-then-block wait.

use crate::hint;

/// A counting semaphore backed by the host OS.
///
/// On Linux this wraps an unnamed POSIX semaphore; on other targets it falls
/// back to a mutex and condition variable. Both variants provide the same
/// contract: `post` releases one unit, `wait` blocks until a unit is
/// available, and [`Semaphore::spin_wait`] polls with pause hints before
/// committing to a kernel-level sleep.
#[derive(Debug)]
pub struct Semaphore {
    inner: imp::Semaphore,
}

impl Semaphore {
    /// Creates a semaphore holding `initial` units.
    pub fn new(initial: u32) -> Self {
        Self {
            inner: imp::Semaphore::new(initial),
        }
    }

    /// Releases one unit, waking one blocked waiter if any.
    pub fn post(&self) {
        self.inner.post();
    }

    /// Blocks until a unit is available and consumes it.
    pub fn wait(&self) {
        self.inner.wait();
    }

    /// Consumes a unit if one is immediately available.
    pub fn try_wait(&self) -> bool {
        self.inner.try_wait()
    }

    /// Tries `spin_count` non-blocking acquisitions with a pause hint between
    /// each before falling into a blocking [`Semaphore::wait`].
    pub fn spin_wait(&self, spin_count: u32) {
        for _ in 0..spin_count {
            if self.try_wait() {
                return;
            }
            hint::pause();
        }
        self.wait();
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use core::cell::UnsafeCell;
    use core::fmt;

    pub(super) struct Semaphore {
        // Boxed so the `sem_t` address stays stable for the kernel.
        handle: Box<UnsafeCell<libc::sem_t>>,
    }

    // SAFETY: POSIX semaphores are explicitly safe to share and operate on
    // from multiple threads.
    unsafe impl Send for Semaphore {}
    // SAFETY: as above; all access goes through `sem_*` which synchronize
    // internally.
    unsafe impl Sync for Semaphore {}

    impl fmt::Debug for Semaphore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Semaphore").finish_non_exhaustive()
        }
    }

    impl Semaphore {
        pub(super) fn new(initial: u32) -> Self {
            let handle = Box::new(UnsafeCell::new(unsafe { core::mem::zeroed() }));
            // SAFETY: the storage is freshly allocated and not yet shared.
            let rc = unsafe { libc::sem_init(handle.get(), 0, initial as libc::c_uint) };
            assert_eq!(rc, 0, "sem_init failed");
            Self { handle }
        }

        pub(super) fn post(&self) {
            // SAFETY: `handle` holds an initialized semaphore.
            let rc = unsafe { libc::sem_post(self.handle.get()) };
            assert_eq!(rc, 0, "sem_post failed");
        }

        pub(super) fn wait(&self) {
            loop {
                // SAFETY: `handle` holds an initialized semaphore.
                let rc = unsafe { libc::sem_wait(self.handle.get()) };
                if rc == 0 {
                    return;
                }
                // Retry on signal interruption.
                assert_eq!(
                    std::io::Error::last_os_error().raw_os_error(),
                    Some(libc::EINTR),
                    "sem_wait failed"
                );
            }
        }

        pub(super) fn try_wait(&self) -> bool {
            // SAFETY: `handle` holds an initialized semaphore.
            unsafe { libc::sem_trywait(self.handle.get()) == 0 }
        }
    }

    impl Drop for Semaphore {
        fn drop(&mut self) {
            // SAFETY: initialized in `new` and no waiters can remain once the
            // owner is dropping it.
            unsafe {
                libc::sem_destroy(self.handle.get());
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::sync::{Condvar, Mutex};

    #[derive(Debug)]
    pub(super) struct Semaphore {
        count: Mutex<u32>,
        available: Condvar,
    }

    impl Semaphore {
        pub(super) fn new(initial: u32) -> Self {
            Self {
                count: Mutex::new(initial),
                available: Condvar::new(),
            }
        }

        pub(super) fn post(&self) {
            let mut count = self.count.lock().expect("semaphore mutex poisoned");
            *count += 1;
            self.available.notify_one();
        }

        pub(super) fn wait(&self) {
            let mut count = self.count.lock().expect("semaphore mutex poisoned");
            while *count == 0 {
                count = self
                    .available
                    .wait(count)
                    .expect("semaphore mutex poisoned");
            }
            *count -= 1;
        }

        pub(super) fn try_wait(&self) -> bool {
            let mut count = self.count.lock().expect("semaphore mutex poisoned");
            if *count == 0 {
                return false;
            }
            *count -= 1;
            true
        }
    }
}
