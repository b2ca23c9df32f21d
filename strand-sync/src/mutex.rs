//! Composable mutex with LIFO hand-off.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use strand_platform::hint;

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::waitable::{WaitMode, Waitable, wait_for};
use crate::waiter::Waiter;
use crate::waiter_list::{self, WaiterList};

// Set while the mutex is free rather than while locked, so waiter insertion
// does not have to strip the bit when building the list.
const MUTEX_FREE_BIT: u64 = waiter_list::USER_FLAG_BIT;

/// A composable mutex.
///
/// Deliberately unfair: waiters are released in LIFO order, which makes the
/// mutex order-dependent for the combinators. Unlike `std::sync::Mutex` this
/// guards no data and has no poisoning; it exists to be waited on alongside
/// other [`Waitable`]s.
///
/// [`Waitable::add_waiter`] doubles as a try-lock: observing the mutex free,
/// it takes the lock for the caller and returns `false` (no callback armed).
#[derive(Debug)]
pub struct Mutex {
    waiters: WaiterList,
    spin_count: u32,
}

impl Default for Mutex {
    /// Equivalent to `Mutex::new(0)`: no spinning before suspension.
    fn default() -> Self {
        Self::new(0)
    }
}

impl Mutex {
    /// Creates an unlocked mutex that spins `spin_count` times in
    /// [`Mutex::lock`] before suspending.
    pub const fn new(spin_count: u32) -> Self {
        Self {
            waiters: WaiterList::new(MUTEX_FREE_BIT),
            spin_count,
        }
    }

    /// Acquires the mutex, spinning briefly before waiting.
    pub fn lock(&self) {
        if self.try_acquire() {
            return;
        }

        let mut spins_left = self.spin_count;
        while spins_left > 0 {
            spins_left -= 1;
            if self.try_acquire() {
                return;
            }
            hint::pause();
        }

        wait_for(self, WaitMode::default());
    }

    /// Attempts to acquire the mutex without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            if word & MUTEX_FREE_BIT == 0 {
                return false;
            }
            debug_assert!(WaiterList::head(word).is_null());
            let new = (word & !MUTEX_FREE_BIT).wrapping_add(waiter_list::ABA_ADDEND);
            match self.waiters.publish(word, new) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Releases the mutex, handing it to the most recent waiter if any.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is not locked.
    pub fn unlock(&self) {
        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            assert_eq!(
                word & MUTEX_FREE_BIT,
                0,
                "attempted to release an unlocked mutex"
            );

            let head = WaiterList::head(word);
            if head.is_null() {
                debug_assert_eq!(word & waiter_list::LOCK_BIT, 0);
                // No waiters: mark free.
                let new = (word | MUTEX_FREE_BIT).wrapping_add(waiter_list::ABA_ADDEND);
                match self.waiters.publish(word, new) {
                    Ok(_) => return,
                    Err(current) => word = current,
                }
            } else if word & waiter_list::LOCK_BIT != 0 {
                // A removal is scanning the list; wait for it to finish.
                word = self.waiters.load(Ordering::Acquire);
            } else {
                // Pop the most recent waiter and hand it the lock: the free
                // bit stays clear.
                // SAFETY: with the lock bit clear the head is stable and owned
                // by this list.
                let next = unsafe { (*head).next() };
                let new = WaiterList::with_head(word, next).wrapping_add(waiter_list::ABA_ADDEND);
                match self.waiters.publish(word, new) {
                    Ok(_) => {
                        // SAFETY: the CAS unlinked `head`; notifying transfers
                        // it to its callback.
                        unsafe { Waiter::notify(NonNull::new_unchecked(head)) };
                        return;
                    }
                    Err(current) => word = current,
                }
            }

            backoff.pause();
        }
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.waiters.load(Ordering::Acquire) & MUTEX_FREE_BIT == 0
    }
}

impl Waitable for Mutex {
    unsafe fn add_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            if word & MUTEX_FREE_BIT != 0 {
                // Unlocked: take the lock on behalf of the caller instead of
                // arming the callback.
                debug_assert!(WaiterList::head(word).is_null());
                let new = (word & !MUTEX_FREE_BIT).wrapping_add(waiter_list::ABA_ADDEND);
                match self.waiters.publish(word, new) {
                    Ok(_) => return false,
                    Err(current) => word = current,
                }
            } else {
                // Locked: arm the waiter.
                // SAFETY: until the publish below succeeds the waiter is the
                // caller's.
                unsafe { waiter.as_ref() }.set_next(WaiterList::head(word));
                let new = WaiterList::with_head(word, waiter.as_ptr())
                    .wrapping_add(waiter_list::ABA_ADDEND);
                match self.waiters.publish(word, new) {
                    Ok(_) => return true,
                    Err(current) => word = current,
                }
            }

            backoff.pause();
        }
    }

    unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.waiters.remove_waiter(waiter) }
    }

    fn is_order_dependent(&self) -> bool {
        // LIFO hand-off is the only order there is.
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::Mutex;
    use crate::waitable::Waitable;
    use crate::waiter::Waiter;

    fn flag_waiter(flag: &Arc<AtomicBool>) -> core::ptr::NonNull<Waiter> {
        let flag = Arc::clone(flag);
        Waiter::create(
            move || {
                flag.store(true, Ordering::Relaxed);
            },
            false,
        )
    }

    #[test]
    fn starts_unlocked() {
        let mutex = Mutex::new(0);
        assert!(!mutex.is_locked());
        assert!(mutex.is_order_dependent());
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let mutex = Mutex::new(0);
        mutex.lock();
        assert!(mutex.is_locked());
        mutex.unlock();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn add_waiter_to_unlocked_mutex_takes_the_lock() {
        let mutex = Mutex::new(0);
        let called = Arc::new(AtomicBool::new(false));
        let waiter = flag_waiter(&called);

        // SAFETY: the waiter is destroyed below and never armed here.
        assert!(!unsafe { mutex.add_waiter(waiter) });
        assert!(!called.load(Ordering::Relaxed));
        assert!(mutex.is_locked());
        mutex.unlock();
        assert!(!mutex.is_locked());

        // SAFETY: never armed.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn waiters_are_released_lifo() {
        let mutex = Mutex::new(0);
        let called1 = Arc::new(AtomicBool::new(false));
        let called2 = Arc::new(AtomicBool::new(false));
        let called3 = Arc::new(AtomicBool::new(false));
        let waiter1 = flag_waiter(&called1);
        let waiter2 = flag_waiter(&called2);
        let waiter3 = flag_waiter(&called3);

        // SAFETY: all waiters outlive the mutex interactions below.
        unsafe {
            assert!(!mutex.add_waiter(waiter1)); // takes the lock
            assert!(mutex.add_waiter(waiter2));
            assert!(mutex.add_waiter(waiter3));
        }
        assert!(mutex.is_locked());

        mutex.unlock();
        assert!(!called2.load(Ordering::Relaxed));
        assert!(called3.load(Ordering::Relaxed));
        assert!(mutex.is_locked());

        mutex.unlock();
        assert!(called2.load(Ordering::Relaxed));
        assert!(mutex.is_locked());

        mutex.unlock();
        assert!(!mutex.is_locked());
        assert!(!called1.load(Ordering::Relaxed));

        for waiter in [waiter1, waiter2, waiter3] {
            // SAFETY: each waiter is either notified or was never armed;
            // ownership is back with us.
            unsafe { Waiter::destroy(waiter) };
        }
    }

    #[test]
    fn removed_waiters_are_skipped() {
        let mutex = Mutex::new(0);
        let called1 = Arc::new(AtomicBool::new(false));
        let called2 = Arc::new(AtomicBool::new(false));
        let waiter1 = flag_waiter(&called1);
        let waiter2 = flag_waiter(&called2);

        // SAFETY: waiters outlive the interactions below.
        unsafe {
            assert!(!mutex.add_waiter(waiter1)); // takes the lock
            assert!(mutex.add_waiter(waiter2));
            assert!(mutex.remove_waiter(waiter2));
        }
        mutex.unlock();
        assert!(!called2.load(Ordering::Relaxed));
        assert!(!mutex.is_locked());

        for waiter in [waiter1, waiter2] {
            // SAFETY: neither waiter is linked anymore.
            unsafe { Waiter::destroy(waiter) };
        }
    }
}
