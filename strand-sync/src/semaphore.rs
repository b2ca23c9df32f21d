//! Composable counting semaphore.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::waitable::Waitable;
use crate::waiter::Waiter;
use crate::waiter_list::{self, WaiterList};

/// A composable counting semaphore.
///
/// The notional count lives in a separate atomic: when it is negative, its
/// magnitude is the number of parked waiters. [`Semaphore::post`] releases one
/// unit and wakes one waiter if any were parked. Arming a waiter through
/// [`Waitable::add_waiter`] doubles as a try-acquire: if a unit is available
/// it is consumed and `false` is returned.
#[derive(Debug)]
pub struct Semaphore {
    count: AtomicI32,
    waiters: WaiterList,
}

impl Default for Semaphore {
    /// Equivalent to `Semaphore::new(0)`.
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore {
    /// Creates a semaphore holding `initial` units.
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicI32::new(initial as i32),
            waiters: WaiterList::new(0),
        }
    }

    /// Releases one unit; if any waiter was parked, exactly one is notified.
    pub fn post(&self) {
        if self.count.fetch_add(1, Ordering::AcqRel) >= 0 {
            return;
        }

        // A waiter is owed a wakeup. It may still be publishing its node, so
        // give it the spin budget before banking the unit in the count; a
        // waiter that was retracted in the meantime never shows up at all.
        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            let head = WaiterList::head(word);
            if let Some(head) = NonNull::new(head) {
                if word & waiter_list::LOCK_BIT == 0 {
                    // SAFETY: with the lock bit clear the head is stable and
                    // owned by this list.
                    let next = unsafe { head.as_ref() }.next();
                    let new =
                        WaiterList::with_head(word, next).wrapping_add(waiter_list::ABA_ADDEND);
                    match self.waiters.publish(word, new) {
                        Ok(_) => {
                            // SAFETY: the CAS unlinked `head`; notifying
                            // transfers it to its callback.
                            unsafe { Waiter::notify(head) };
                            return;
                        }
                        Err(current) => {
                            word = current;
                        }
                    }
                    backoff.pause();
                } else {
                    word = self.waiters.load(Ordering::Acquire);
                    backoff.pause();
                }
            } else {
                if !backoff.try_pause() {
                    return;
                }
                word = self.waiters.load(Ordering::Acquire);
            }
        }
    }
}

impl Waitable for Semaphore {
    unsafe fn add_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        if self.count.fetch_sub(1, Ordering::AcqRel) > 0 {
            // A unit was available; the caller holds it without waiting.
            return false;
        }

        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            // SAFETY: until the publish below succeeds the waiter is the
            // caller's.
            unsafe { waiter.as_ref() }.set_next(WaiterList::head(word));
            let new =
                WaiterList::with_head(word, waiter.as_ptr()).wrapping_add(waiter_list::ABA_ADDEND);
            match self.waiters.publish(word, new) {
                Ok(_) => return true,
                Err(current) => word = current,
            }

            backoff.pause();
        }
    }

    unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.waiters.remove_waiter(waiter) }
    }

    fn is_order_dependent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::Semaphore;
    use crate::waitable::Waitable;
    use crate::waiter::Waiter;

    fn counting_waiter(count: &Arc<AtomicU32>) -> core::ptr::NonNull<Waiter> {
        let count = Arc::clone(count);
        Waiter::create(
            move || {
                count.fetch_add(1, Ordering::Relaxed);
            },
            false,
        )
    }

    #[test]
    fn initial_units_absorb_waiters() {
        let semaphore = Semaphore::new(2);
        let wakeups = Arc::new(AtomicU32::new(0));
        let waiters: Vec<_> = (0..3).map(|_| counting_waiter(&wakeups)).collect();

        // SAFETY: waiters outlive the interactions below.
        unsafe {
            assert!(!semaphore.add_waiter(waiters[0]));
            assert!(!semaphore.add_waiter(waiters[1]));
            assert!(semaphore.add_waiter(waiters[2]));
        }
        assert_eq!(wakeups.load(Ordering::Relaxed), 0);

        semaphore.post();
        assert_eq!(wakeups.load(Ordering::Relaxed), 1);

        for waiter in waiters {
            // SAFETY: every waiter is either notified or was never armed.
            unsafe { Waiter::destroy(waiter) };
        }
    }

    #[test]
    fn post_without_waiters_banks_a_unit() {
        let semaphore = Semaphore::new(0);
        semaphore.post();

        let wakeups = Arc::new(AtomicU32::new(0));
        let waiter = counting_waiter(&wakeups);
        // SAFETY: destroyed below; never armed.
        assert!(!unsafe { semaphore.add_waiter(waiter) });
        // SAFETY: never armed.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn wakes_one_waiter_per_post() {
        let semaphore = Semaphore::new(0);
        let wakeups = Arc::new(AtomicU32::new(0));
        let waiters: Vec<_> = (0..3).map(|_| counting_waiter(&wakeups)).collect();

        for &waiter in &waiters {
            // SAFETY: waiters outlive the interactions below.
            assert!(unsafe { semaphore.add_waiter(waiter) });
        }

        for expected in 1..=3 {
            semaphore.post();
            assert_eq!(wakeups.load(Ordering::Relaxed), expected);
        }

        for waiter in waiters {
            // SAFETY: all notified above.
            unsafe { Waiter::destroy(waiter) };
        }
    }
}
