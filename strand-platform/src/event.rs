//! Manual-reset event backed by a mutex and condition variable.

use std::sync::{Condvar, Mutex};

/// A kernel-backed manual-reset event.
///
/// Unlike the lock-free event in `strand-sync`, this one unconditionally
/// suspends on [`ManualResetEvent::wait`]; it exists for code that needs a
/// plain OS-level gate without waiter-list machinery.
#[derive(Debug)]
pub struct ManualResetEvent {
    state: Mutex<bool>,
    signaled: Condvar,
}

impl ManualResetEvent {
    /// Creates an event; `initial` selects the starting signaled state.
    pub fn new(initial: bool) -> Self {
        Self {
            state: Mutex::new(initial),
            signaled: Condvar::new(),
        }
    }

    /// Signals the event, releasing all current and future waiters.
    pub fn set(&self) {
        let mut state = self.state.lock().expect("event mutex poisoned");
        *state = true;
        self.signaled.notify_all();
    }

    /// Returns the event to the unsignaled state.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("event mutex poisoned");
        *state = false;
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let mut state = self.state.lock().expect("event mutex poisoned");
        while !*state {
            state = self.signaled.wait(state).expect("event mutex poisoned");
        }
    }
}
