//! Lock-free manual-reset event.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
use crate::waitable::Waitable;
use crate::waiter::{self, Waiter};
use crate::waiter_list::{self, WaiterList};

const EVENT_SET_BIT: u64 = waiter_list::USER_FLAG_BIT;

/// A composable manual-reset event.
///
/// Once set, the event never "unsets" observably to an outstanding waiter:
/// [`Event::set`] claims the whole waiter list atomically together with the
/// set bit, then notifies the detached waiters. [`Event::reset`] only clears
/// the bit; a set event can hold no waiters.
///
/// # Example
///
/// ```rust
/// use strand_sync::{Event, WaitMode, wait_for};
///
/// let event = Event::new(false);
/// std::thread::scope(|scope| {
///     scope.spawn(|| event.set());
///     wait_for(&event, WaitMode::block(0));
/// });
/// assert!(event.is_set());
/// ```
#[derive(Debug)]
pub struct Event {
    waiters: WaiterList,
}

impl Default for Event {
    /// Equivalent to `Event::new(false)`.
    fn default() -> Self {
        Self::new(false)
    }
}

impl Event {
    /// Creates an event; `initial` selects the starting signaled state.
    pub const fn new(initial: bool) -> Self {
        Self {
            waiters: WaiterList::new(if initial { EVENT_SET_BIT } else { 0 }),
        }
    }

    /// Signals the event and notifies every current waiter.
    ///
    /// Idempotent: setting a set event is a no-op.
    pub fn set(&self) {
        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.waiters.load(Ordering::Acquire);
        loop {
            if word & EVENT_SET_BIT != 0 {
                return;
            }

            // Wait for any mid-list removal to finish before claiming the
            // list.
            if word & waiter_list::LOCK_BIT == 0 {
                let head = WaiterList::head(word);
                if head.is_null() {
                    // No waiters; only the state bit changes.
                    let new = (word | EVENT_SET_BIT).wrapping_add(waiter_list::ABA_ADDEND);
                    match self.waiters.publish(word, new) {
                        Ok(_) => return,
                        Err(current) => word = current,
                    }
                } else {
                    // Detach the whole list together with the set bit, holding
                    // the lock bit so racing removers spin instead of walking
                    // a list that is being consumed.
                    let locked = (WaiterList::with_head(word, core::ptr::null_mut())
                        | waiter_list::LOCK_BIT
                        | EVENT_SET_BIT)
                        .wrapping_add(waiter_list::ABA_ADDEND);
                    match self.waiters.publish(word, locked) {
                        Ok(_) => {
                            // SAFETY: the CAS detached this chain; nobody else
                            // can reach it.
                            unsafe { waiter::notify_all(head) };
                            self.waiters.unlock();
                            return;
                        }
                        Err(current) => word = current,
                    }
                }
            } else {
                word = self.waiters.load(Ordering::Acquire);
            }

            backoff.pause();
        }
    }

    /// Returns the event to the unsignaled state.
    ///
    /// Wait-free: only the state bit is touched, as a set event has no
    /// waiters.
    pub fn reset(&self) {
        self.waiters.clear_user_flag();
    }

    /// Whether the event is currently signaled.
    pub fn is_set(&self) -> bool {
        self.waiters.load(Ordering::Acquire) & EVENT_SET_BIT != 0
    }
}

impl Waitable for Event {
    unsafe fn add_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.waiters
                .add_waiter_unless::<ConstantBackoff, _>(waiter, |word| word & EVENT_SET_BIT != 0)
        }
    }

    unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.waiters.remove_waiter(waiter) }
    }

    fn is_order_dependent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::Event;
    use crate::waitable::Waitable;
    use crate::waiter::Waiter;

    #[test]
    fn construct_set() {
        let event = Event::new(true);
        assert!(event.is_set());
        assert!(!event.is_order_dependent());
    }

    #[test]
    fn construct_unset() {
        let event = Event::new(false);
        assert!(!event.is_set());
    }

    #[test]
    fn state_changes() {
        let event = Event::new(true);
        event.reset();
        assert!(!event.is_set());
        event.set();
        assert!(event.is_set());
        // Idempotent.
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn add_waiter_to_set_event_is_refused() {
        let event = Event::new(true);
        let wakeups = Arc::new(AtomicU32::new(0));
        let waiter = Waiter::create(
            {
                let wakeups = Arc::clone(&wakeups);
                move || {
                    wakeups.fetch_add(1, Ordering::Relaxed);
                }
            },
            false,
        );

        // SAFETY: the waiter outlives this test and is destroyed below.
        assert!(!unsafe { event.add_waiter(waiter) });
        assert_eq!(wakeups.load(Ordering::Relaxed), 0);
        // SAFETY: never armed.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn add_remove_and_notify() {
        let event = Event::new(false);
        let wakeups = Arc::new(AtomicU32::new(0));
        let waiter = Waiter::create(
            {
                let wakeups = Arc::clone(&wakeups);
                move || {
                    wakeups.fetch_add(1, Ordering::Relaxed);
                }
            },
            false,
        );

        // Removed waiters must not be notified.
        // SAFETY: the waiter outlives its membership and is destroyed below.
        unsafe {
            assert!(event.add_waiter(waiter));
            assert_eq!(wakeups.load(Ordering::Relaxed), 0);
            assert!(event.remove_waiter(waiter));
        }
        event.set();
        assert_eq!(wakeups.load(Ordering::Relaxed), 0);

        // Armed waiters are notified exactly once.
        event.reset();
        // SAFETY: as above.
        assert!(unsafe { event.add_waiter(waiter) });
        event.set();
        assert_eq!(wakeups.load(Ordering::Relaxed), 1);

        // SAFETY: consumed by the notification; ownership is back with us.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn detached_list_is_notified_in_lifo_order() {
        let event = Event::new(false);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let waiters: Vec<_> = (0..3)
            .map(|id| {
                let order = Arc::clone(&order);
                Waiter::create(
                    move || {
                        order.lock().unwrap().push(id);
                    },
                    false,
                )
            })
            .collect();
        for &waiter in &waiters {
            // SAFETY: waiters are destroyed below, after notification.
            assert!(unsafe { event.add_waiter(waiter) });
        }

        event.set();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);

        for waiter in waiters {
            // SAFETY: notified above; ownership is back with us.
            unsafe { Waiter::destroy(waiter) };
        }
    }
}
