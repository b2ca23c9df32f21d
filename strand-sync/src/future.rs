//! Single-shot promise/future channel built on [`Event`].

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::event::Event;
use crate::waitable::{WaitMode, Waitable, wait_for};
use crate::waiter::Waiter;

/// Opaque error payload captured by [`Promise::set_error`].
///
/// Shared: every [`Future::get`] call on a failed future observes the same
/// payload.
#[derive(Clone)]
pub struct PromiseError(Arc<dyn core::error::Error + Send + Sync>);

impl PromiseError {
    /// Wraps an arbitrary error payload.
    pub fn new(error: impl Into<Box<dyn core::error::Error + Send + Sync>>) -> Self {
        Self(Arc::from(error.into()))
    }
}

impl fmt::Debug for PromiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for PromiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl core::error::Error for PromiseError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        self.0.source()
    }
}

/// Shared state between one producer and any number of consumers.
///
/// The payload slots are written exactly once, before the embedded event's
/// unset-to-set transition publishes them; consumers only read after
/// observing the event set.
struct Shared<T> {
    ready: Event,
    value: UnsafeCell<Option<T>>,
    error: UnsafeCell<Option<PromiseError>>,
}

// SAFETY: the single writer runs before the event is set; every reader runs
// after observing it set, so the cells are never accessed concurrently.
unsafe impl<T: Send> Send for Shared<T> {}
// SAFETY: as above; shared `&T` access additionally requires `T: Sync`.
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            ready: Event::new(false),
            value: UnsafeCell::new(None),
            error: UnsafeCell::new(None),
        }
    }
}

/// The producing half of a single-shot channel.
///
/// Move-only: completing the promise consumes it, so a promise cannot be set
/// twice by construction.
///
/// # Example
///
/// ```rust
/// use strand_sync::Promise;
///
/// let promise = Promise::new();
/// let future = promise.future();
/// std::thread::scope(|scope| {
///     scope.spawn(move || promise.set_value(42));
///     assert_eq!(future.get().copied().unwrap(), 42);
/// });
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("ready", &self.shared.ready.is_set())
            .finish_non_exhaustive()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates an unfulfilled promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Returns a future observing this promise.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fulfills the promise with a value, waking all waiting futures.
    pub fn set_value(self, value: T) {
        assert!(!self.shared.ready.is_set(), "promise completed twice");
        // SAFETY: the event is unset, so no reader touches the cell yet and
        // consuming `self` means no second writer can exist.
        unsafe {
            *self.shared.value.get() = Some(value);
        }
        self.shared.ready.set();
    }

    /// Fails the promise with an opaque error payload.
    pub fn set_error(self, error: impl Into<Box<dyn core::error::Error + Send + Sync>>) {
        assert!(!self.shared.ready.is_set(), "promise completed twice");
        // SAFETY: as in `set_value`.
        unsafe {
            *self.shared.error.get() = Some(PromiseError::new(error));
        }
        self.shared.ready.set();
    }
}

/// The consuming half of a single-shot channel.
///
/// Cheap to clone; every clone observes the same completion.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl<T> Future<T> {
    /// Whether the promise has been completed.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_set()
    }

    /// Whether the promise completed with a value.
    pub fn has_value(&self) -> bool {
        // SAFETY: the cells are only read after the ready event is observed
        // set, which orders them after the single write.
        self.is_ready() && unsafe { (*self.shared.error.get()).is_none() }
    }

    /// Whether the promise completed with an error.
    pub fn has_error(&self) -> bool {
        // SAFETY: as in `has_value`.
        self.is_ready() && unsafe { (*self.shared.error.get()).is_some() }
    }

    /// Blocks until the promise is completed.
    pub fn wait(&self, mode: WaitMode) {
        if !self.is_ready() {
            wait_for(self, mode);
        }
    }

    /// Blocks until completion and returns the value or the captured error.
    pub fn get(&self) -> Result<&T, PromiseError> {
        self.wait(WaitMode::default());
        // SAFETY: the event is set, ordering these reads after the single
        // write; the value is never taken out again.
        unsafe {
            match &*self.shared.error.get() {
                Some(error) => Err(error.clone()),
                None => Ok((*self.shared.value.get())
                    .as_ref()
                    .expect("completed future holds neither value nor error")),
            }
        }
    }
}

impl<T> Waitable for Future<T> {
    unsafe fn add_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.shared.ready.add_waiter(waiter) }
    }

    unsafe fn remove_waiter(&self, waiter: NonNull<Waiter>) -> bool {
        // SAFETY: forwarded from the caller.
        unsafe { self.shared.ready.remove_waiter(waiter) }
    }

    fn is_order_dependent(&self) -> bool {
        false
    }
}
