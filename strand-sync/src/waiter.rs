//! Intrusive waiter records and the cell allocator behind them.
//!
//! A [`Waiter`] is a singly-linked callback record installed into a waitable's
//! waiter list. The callback is captured into a fixed-size type-erased cell so
//! that every waiter has identical size and can be recycled through free
//! lists: a thread-local list first, then a process-wide lock-free stack, then
//! a fresh heap allocation. Cells are recycled for the lifetime of the
//! process and never returned to the heap, which is what makes it safe for
//! lock-free list operations to read a node that has just been popped
//! elsewhere.

use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use std::alloc::{Layout, alloc, handle_alloc_error};
use std::cell::Cell;
use std::sync::Mutex;

use crate::lifo_list::{IntrusiveNode, MpmcLifoList};

/// Capacity of the type-erased callback cell inside every [`Waiter`].
pub const INLINE_CALLBACK_SIZE: usize = 64;

#[repr(C, align(16))]
struct CallbackCell([MaybeUninit<u8>; INLINE_CALLBACK_SIZE]);

/// An intrusive callback record, notified when the waitable holding it
/// signals.
///
/// A waiter is exclusively owned by whichever waiter list currently links it;
/// unlinked waiters are owned by their creator. The link field is only written
/// by the inserting thread before publication, or by the thread holding a
/// list's removal lock.
///
/// Waiters created with `transient = true` destroy themselves after their
/// callback runs; persistent waiters are reused across waits and must be
/// released with [`Waiter::destroy`]. Once a waiter is installed, exactly one
/// of a successful [`remove_waiter`](crate::Waitable::remove_waiter) or a
/// notification will consume it; the loser of that race observes `false` or
/// absence.
#[repr(C, align(16))]
pub struct Waiter {
    next: AtomicPtr<Waiter>,
    invoke: unsafe fn(*mut Waiter),
    drop_callback: unsafe fn(*mut Waiter),
    transient: bool,
    callback: CallbackCell,
}

// SAFETY: waiters carry `Send` callbacks and their shared state is limited to
// the atomic link field; the list protocols serialize all other access.
unsafe impl Send for Waiter {}
// SAFETY: as above.
unsafe impl Sync for Waiter {}

impl core::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Waiter")
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("transient", &self.transient)
            .finish_non_exhaustive()
    }
}

impl Waiter {
    /// Creates a waiter invoking `callback` on notification.
    ///
    /// Transient waiters free themselves after the callback returns and must
    /// not be [destroyed](Waiter::destroy) once notified; persistent waiters
    /// stay valid across any number of notifications until destroyed.
    ///
    /// The callback runs on whichever thread signals the waitable. It must be
    /// idempotent against the remove/notify race described on [`Waiter`].
    pub fn create<F>(callback: F, transient: bool) -> NonNull<Waiter>
    where
        F: FnMut() + Send,
    {
        const {
            assert!(
                size_of::<F>() <= INLINE_CALLBACK_SIZE,
                "callback capture exceeds the waiter cell"
            );
            assert!(
                align_of::<F>() <= align_of::<CallbackCell>(),
                "callback capture over-aligned for the waiter cell"
            );
        }

        let node = allocate();
        let waiter = node.as_ptr();
        // SAFETY: `allocate` returned a unique, unlinked cell; field pointers
        // are in bounds and the callback fits per the asserts above.
        unsafe {
            (&raw mut (*waiter).next).write(AtomicPtr::new(ptr::null_mut()));
            (&raw mut (*waiter).invoke).write(invoke::<F>);
            (&raw mut (*waiter).drop_callback).write(drop_callback::<F>);
            (&raw mut (*waiter).transient).write(transient);
            (&raw mut (*waiter).callback).cast::<F>().write(callback);
        }
        node
    }

    /// Invokes the waiter's callback.
    ///
    /// # Safety
    ///
    /// `waiter` must be live, initialized, and not linked into any list. The
    /// caller must not touch a transient waiter afterwards: it frees itself.
    pub unsafe fn notify(waiter: NonNull<Waiter>) {
        // SAFETY: `waiter` is live per the caller contract.
        let invoke = unsafe { waiter.as_ref() }.invoke;
        // SAFETY: `invoke` was set from the matching callback type in
        // `create`.
        unsafe { invoke(waiter.as_ptr()) }
    }

    /// Drops the captured callback and recycles the cell.
    ///
    /// # Safety
    ///
    /// `waiter` must be live and not linked into any list, with no
    /// notification in flight. Never call this on a transient waiter that has
    /// been notified.
    pub unsafe fn destroy(waiter: NonNull<Waiter>) {
        // SAFETY: live per the caller contract; `drop_callback` matches the
        // stored callback type.
        unsafe {
            (waiter.as_ref().drop_callback)(waiter.as_ptr());
        }
        free(waiter);
    }

    pub(crate) fn set_next(&self, next: *mut Waiter) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> *mut Waiter {
        self.next.load(Ordering::Relaxed)
    }
}

// SAFETY: both accessors use the dedicated atomic link field.
unsafe impl IntrusiveNode for Waiter {
    unsafe fn set_next(this: NonNull<Self>, next: *mut Self) {
        // SAFETY: caller guarantees `this` is live.
        unsafe { this.as_ref() }.set_next(next);
    }

    unsafe fn get_next(this: NonNull<Self>) -> *mut Self {
        // SAFETY: caller guarantees `this` is live.
        unsafe { this.as_ref() }.next()
    }
}

unsafe fn invoke<F: FnMut() + Send>(waiter: *mut Waiter) {
    // SAFETY: `waiter` is live and its cell holds an `F`; `transient` is read
    // before the callback so persistent waiters are untouched afterwards,
    // allowing the waking thread to destroy them as soon as the callback's
    // effect is visible.
    unsafe {
        let transient = (*waiter).transient;
        let callback = (&raw mut (*waiter).callback).cast::<F>();
        (*callback)();
        if transient {
            ptr::drop_in_place(callback);
            free(NonNull::new_unchecked(waiter));
        }
    }
}

unsafe fn drop_callback<F: FnMut() + Send>(waiter: *mut Waiter) {
    // SAFETY: `waiter` is live and its cell holds an `F`.
    unsafe {
        ptr::drop_in_place((&raw mut (*waiter).callback).cast::<F>());
    }
}

/// Notifies every waiter on a detached list in LIFO order.
///
/// # Safety
///
/// `head` must be the head of a list that no other thread can reach anymore.
pub(crate) unsafe fn notify_all(head: *mut Waiter) {
    let mut current = head;
    while let Some(waiter) = NonNull::new(current) {
        // Read the link first: transient waiters free themselves on notify.
        // SAFETY: the detached list is exclusively ours per the contract.
        current = unsafe { waiter.as_ref() }.next();
        // SAFETY: as above; each node is notified exactly once.
        unsafe { Waiter::notify(waiter) };
    }
}

thread_local! {
    static LOCAL_FREE_LIST: Cell<*mut Waiter> = const { Cell::new(ptr::null_mut()) };
}

// TODO: overflow long thread-local free lists back into this global stack.
static GLOBAL_FREE_LIST: MpmcLifoList<Waiter> = MpmcLifoList::new();

/// Every cell ever handed out by the heap, kept for the process lifetime.
static ALLOCATION_LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

fn allocate() -> NonNull<Waiter> {
    LOCAL_FREE_LIST.with(|local| {
        if let Some(waiter) = NonNull::new(local.get()) {
            // SAFETY: nodes on the thread-local list are exclusively ours.
            local.set(unsafe { waiter.as_ref() }.next());
            return waiter;
        }
        allocate_global()
    })
}

fn allocate_global() -> NonNull<Waiter> {
    if let Some(waiter) = GLOBAL_FREE_LIST.pop() {
        return waiter;
    }

    let layout = Layout::new::<Waiter>();
    // SAFETY: `Waiter` has non-zero size.
    let raw = unsafe { alloc(layout) }.cast::<Waiter>();
    let Some(waiter) = NonNull::new(raw) else {
        handle_alloc_error(layout);
    };
    ALLOCATION_LOG
        .lock()
        .expect("waiter allocation log poisoned")
        .push(waiter.as_ptr() as usize);
    log::trace!("allocated fresh waiter cell at {waiter:p}");
    waiter
}

fn free(waiter: NonNull<Waiter>) {
    LOCAL_FREE_LIST.with(|local| {
        // SAFETY: the cell is no longer reachable by any list; we own it.
        unsafe { waiter.as_ref() }.set_next(local.get());
        local.set(waiter.as_ptr());
    });
}

#[cfg(test)]
pub(crate) fn allocated_cell_count() -> usize {
    ALLOCATION_LOG
        .lock()
        .expect("waiter allocation log poisoned")
        .len()
}
