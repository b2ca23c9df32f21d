//! The 64-bit packed waiter-list word shared by every waitable primitive.
//!
//! A single atomic word packs the head-of-list pointer, one primitive-specific
//! flag bit, a removal lock bit, and a version counter bumped on every
//! successful publish. Insertion and whole-list detachment are lock-free; only
//! mid-list removal takes the lock bit, and notification always happens after
//! the affected sub-list has been detached from the word.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::waiter::Waiter;

#[cfg(target_pointer_width = "64")]
mod packing {
    /// Primitive-specific flag (event-set, mutex-free).
    pub(crate) const USER_FLAG_BIT: u64 = 1;
    /// Excludes concurrent mid-list removal.
    pub(crate) const LOCK_BIT: u64 = 2;
    pub(crate) const FLAG_MASK: u64 = USER_FLAG_BIT | LOCK_BIT;
    /// Version counter increment; assumes 48-bit effective addresses.
    pub(crate) const ABA_ADDEND: u64 = 1 << 48;
    /// Pointer field; low two bits are stolen for flags, so waiters must be
    /// at least 4-byte aligned.
    pub(crate) const PTR_MASK: u64 = (ABA_ADDEND - 1) & !FLAG_MASK;
}

#[cfg(target_pointer_width = "32")]
mod packing {
    pub(crate) const USER_FLAG_BIT: u64 = 1 << 32;
    pub(crate) const LOCK_BIT: u64 = 2 << 32;
    pub(crate) const FLAG_MASK: u64 = USER_FLAG_BIT | LOCK_BIT;
    pub(crate) const ABA_ADDEND: u64 = 4 << 32;
    pub(crate) const PTR_MASK: u64 = 0xffff_ffff;
}

pub(crate) use packing::{ABA_ADDEND, LOCK_BIT, PTR_MASK, USER_FLAG_BIT};

/// The packed `{pointer, user flag, lock bit, version}` word.
pub(crate) struct WaiterList {
    word: AtomicU64,
}

impl core::fmt::Debug for WaiterList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let word = self.load(Ordering::Relaxed);
        f.debug_struct("WaiterList")
            .field("head", &Self::head(word))
            .field("user_flag", &(word & USER_FLAG_BIT != 0))
            .field("locked", &(word & LOCK_BIT != 0))
            .field("version", &(word / ABA_ADDEND))
            .finish()
    }
}

impl WaiterList {
    pub(crate) const fn new(initial: u64) -> Self {
        Self {
            word: AtomicU64::new(initial),
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> u64 {
        self.word.load(order)
    }

    /// Extracts the head-of-list pointer from a word.
    pub(crate) fn head(word: u64) -> *mut Waiter {
        (word & PTR_MASK) as *mut Waiter
    }

    /// Replaces the pointer field of `word` with `head`, keeping flag and
    /// version bits.
    pub(crate) fn with_head(word: u64, head: *mut Waiter) -> u64 {
        let head_bits = head as u64;
        debug_assert_eq!(head_bits & !PTR_MASK, 0, "misaligned or oversized waiter pointer");
        (word & !PTR_MASK) | head_bits
    }

    /// Publishes `new` if the word is still `current`. The version bits of
    /// `new` are the caller's responsibility; every publish must add
    /// [`ABA_ADDEND`].
    pub(crate) fn publish(&self, current: u64, new: u64) -> Result<u64, u64> {
        debug_assert_ne!(current, new);
        self.word
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Clears the user flag bit without touching the rest of the word.
    pub(crate) fn clear_user_flag(&self) {
        self.word.fetch_and(!USER_FLAG_BIT, Ordering::Relaxed);
    }

    /// Releases the removal lock.
    pub(crate) fn unlock(&self) {
        self.word.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Inserts `waiter` at the head unless `ready(word)` reports the
    /// primitive as already signaled; returns whether the waiter was armed.
    ///
    /// # Safety
    ///
    /// `waiter` must be live, unlinked, and stay valid until removed or
    /// notified.
    pub(crate) unsafe fn add_waiter_unless<B, F>(&self, waiter: NonNull<Waiter>, ready: F) -> bool
    where
        B: Backoff,
        F: Fn(u64) -> bool,
    {
        let mut backoff = B::default();
        let mut word = self.load(Ordering::Acquire);
        loop {
            if ready(word) {
                return false;
            }

            // SAFETY: until the publish below succeeds the waiter is ours.
            unsafe { waiter.as_ref() }.set_next(Self::head(word));
            let new = Self::with_head(word, waiter.as_ptr()).wrapping_add(ABA_ADDEND);
            match self.publish(word, new) {
                Ok(_) => return true,
                Err(current) => word = current,
            }

            backoff.pause();
        }
    }

    /// Unlinks `waiter` from the list.
    ///
    /// Returns `true` if this call removed it (the caller owns the node
    /// again), `false` if it was already gone because a notification or
    /// another removal got there first.
    ///
    /// # Safety
    ///
    /// `waiter` must be a node this caller installed and not yet reclaimed.
    pub(crate) unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        let mut backoff = ExponentialBackoff::<16>::default();
        let mut word = self.load(Ordering::Acquire);
        loop {
            let Some(head) = NonNull::new(Self::head(word)) else {
                return false;
            };

            if word & LOCK_BIT != 0 {
                // Another removal is scanning the list; wait it out.
                word = self.load(Ordering::Acquire);
            } else if head == waiter {
                // Head removal is a plain pop.
                // SAFETY: with the lock bit clear, the head node is stable and
                // owned by this list.
                let next = unsafe { head.as_ref() }.next();
                let new = Self::with_head(word, next).wrapping_add(ABA_ADDEND);
                match self.publish(word, new) {
                    Ok(_) => return true,
                    Err(current) => word = current,
                }
            } else {
                // Take the lock bit and splice out of the interior. The head
                // cannot be popped while the lock is held, so the scan below
                // walks a stable chain.
                match self.publish(word, (word | LOCK_BIT).wrapping_add(ABA_ADDEND)) {
                    Ok(_) => {
                        // SAFETY: the lock bit serializes interior edits and
                        // the chain from `head` stays reachable while we hold
                        // it.
                        let removed = unsafe { remove_from_chain(head, waiter) };
                        self.unlock();
                        return removed;
                    }
                    Err(current) => word = current,
                }
            }

            backoff.pause();
        }
    }
}

/// Splices `target` out of the chain starting at `head` (which is known not to
/// be `target`).
///
/// # Safety
///
/// The caller must hold the list's lock bit, and `head` must be the list head
/// captured together with that lock.
unsafe fn remove_from_chain(head: NonNull<Waiter>, target: NonNull<Waiter>) -> bool {
    let mut previous = head;
    loop {
        // SAFETY: chain nodes are live while linked, and the lock bit keeps
        // every link from `head` onward stable.
        let Some(current) = NonNull::new(unsafe { previous.as_ref() }.next()) else {
            return false;
        };
        if current == target {
            // SAFETY: as above; unlinking hands `target` back to the caller.
            unsafe {
                previous.as_ref().set_next(current.as_ref().next());
            }
            return true;
        }
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use core::sync::atomic::Ordering;

    use super::{ABA_ADDEND, USER_FLAG_BIT, WaiterList};
    use crate::backoff::ConstantBackoff;
    use crate::waiter::Waiter;

    fn version(word: u64) -> u64 {
        word / ABA_ADDEND
    }

    unsafe fn add(list: &WaiterList, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe {
            list.add_waiter_unless::<ConstantBackoff, _>(waiter, |word| word & USER_FLAG_BIT != 0)
        }
    }

    #[test]
    fn version_increases_on_every_publish() {
        let list = WaiterList::new(0);
        let waiter = Waiter::create(|| {}, false);

        let before = version(list.load(Ordering::Relaxed));
        // SAFETY: `waiter` outlives its membership in `list`.
        assert!(unsafe { add(&list, waiter) });
        let after_add = version(list.load(Ordering::Relaxed));
        assert!(after_add > before);

        // SAFETY: `waiter` was installed above.
        assert!(unsafe { list.remove_waiter(waiter) });
        let after_remove = version(list.load(Ordering::Relaxed));
        assert!(after_remove > after_add);

        // SAFETY: removal handed the waiter back to us.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn remove_from_empty_list_fails() {
        let list = WaiterList::new(0);
        let waiter = Waiter::create(|| {}, false);
        // SAFETY: the waiter is live; it was never installed, so removal must
        // report absence.
        assert!(!unsafe { list.remove_waiter(waiter) });
        // SAFETY: never installed.
        unsafe { Waiter::destroy(waiter) };
    }

    #[test]
    fn removes_head_and_interior_nodes() {
        let list = WaiterList::new(0);
        let waiters: Vec<_> = (0..3).map(|_| Waiter::create(|| {}, false)).collect();
        for &waiter in &waiters {
            // SAFETY: each waiter outlives its membership in `list`.
            assert!(unsafe { add(&list, waiter) });
        }

        // waiters[2] is the head, waiters[0] the tail.
        // SAFETY: all three are installed.
        unsafe {
            assert!(list.remove_waiter(waiters[1]));
            assert!(!list.remove_waiter(waiters[1]));
            assert!(list.remove_waiter(waiters[2]));
            assert!(list.remove_waiter(waiters[0]));
        }
        assert!(WaiterList::head(list.load(Ordering::Relaxed)).is_null());

        for waiter in waiters {
            // SAFETY: removed above; ownership is back with us.
            unsafe { Waiter::destroy(waiter) };
        }
    }

    #[test]
    fn ready_predicate_suppresses_insertion() {
        let list = WaiterList::new(USER_FLAG_BIT);
        let waiter = Waiter::create(|| {}, false);
        // SAFETY: the waiter is live for the duration of the call.
        assert!(!unsafe { add(&list, waiter) });
        // SAFETY: never installed.
        unsafe { Waiter::destroy(waiter) };
    }
}
