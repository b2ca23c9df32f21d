//! Meta-scheduler: multiplexes cooperative schedulers onto meta-threads.
//!
//! A [`MetaScheduler`] owns an ordered set of [`Scheduler`]s and a pool of
//! idle meta-threads — resource tickets carrying a processor affinity and
//! per-scheduler run-mode overrides. A thread joins by acquiring its
//! per-thread [`Context`] and calling [`Context::run`], which takes one
//! meta-thread, pins itself, and round-robins the enabled schedulers: each one
//! is driven through a throttler derived from its [`RunMode`], idle schedulers
//! park a waiter on their has-work condition, and the thread sleeps when every
//! scheduler is idle. The `until` waitable ends the loop.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use strand_platform::Semaphore;
use strand_platform::affinity::{CpuSet, set_current_thread_affinity};
use strand_platform::hint;

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::scheduler::{Scheduler, SchedulerState, Throttler};
use crate::waitable::{SemaphoreRef, Waitable};
use crate::waiter::Waiter;

const STATE_POISONED: &str = "meta-scheduler state mutex poisoned";
const POOL_POISONED: &str = "meta-thread pool mutex poisoned";

/// How long one dispatch of a scheduler's `run` may last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Never drive this scheduler on the meta-thread.
    Disabled,
    /// Yield after this many work items.
    Some(u32),
    /// Yield once this much wall-clock time has passed.
    Timed(Duration),
    /// Run until stopped or idle.
    All,
}

/// A scheduler id already present in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("scheduler id {0} already registered")]
pub struct DuplicateSchedulerId(pub u32);

/// The calling thread already owns a context of a different
/// [`MetaScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("thread already owns a context of a different meta-scheduler")]
pub struct ContextOwnerMismatch;

struct SchedulerInfo {
    scheduler: Arc<dyn Scheduler>,
    id: u32,
    default_run_mode: RunMode,
}

/// Ordered scheduler registration for [`MetaScheduler::new`].
#[derive(Default)]
pub struct Config {
    schedulers: Vec<SchedulerInfo>,
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("schedulers", &self.schedulers.len())
            .finish()
    }
}

impl Config {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `scheduler` under `id` with a default run mode.
    ///
    /// Ids must be unique; drive order follows registration order.
    pub fn add_scheduler(
        &mut self,
        scheduler: Arc<dyn Scheduler>,
        id: u32,
        default_run_mode: RunMode,
    ) -> Result<(), DuplicateSchedulerId> {
        if self.schedulers.iter().any(|info| info.id == id) {
            return Err(DuplicateSchedulerId(id));
        }
        self.schedulers.push(SchedulerInfo {
            scheduler,
            id,
            default_run_mode,
        });
        Ok(())
    }
}

/// Configuration of one meta-thread resource ticket.
#[derive(Debug, Default, Clone)]
pub struct MetaThreadConfig {
    processor_affinity: Option<CpuSet>,
    run_mode_overrides: HashMap<u32, RunMode>,
}

impl MetaThreadConfig {
    /// Creates a config with no affinity and no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins contexts holding this meta-thread to `affinity`.
    pub fn set_processor_affinity(&mut self, affinity: CpuSet) {
        self.processor_affinity = Some(affinity);
    }

    /// Overrides the run mode of scheduler `id` on this meta-thread.
    pub fn set_run_mode_override(&mut self, id: u32, run_mode: RunMode) {
        self.run_mode_overrides.insert(id, run_mode);
    }
}

struct MetaThread {
    processor_affinity: Option<CpuSet>,
    run_mode_overrides: HashMap<u32, RunMode>,
}

/// Owner of the scheduler set and the idle meta-thread pool.
pub struct MetaScheduler {
    schedulers: Vec<SchedulerInfo>,
    idle_meta_threads: Mutex<Vec<MetaThread>>,
    meta_thread_available: Condvar,
}

impl core::fmt::Debug for MetaScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetaScheduler")
            .field("schedulers", &self.schedulers.len())
            .finish_non_exhaustive()
    }
}

impl MetaScheduler {
    /// Creates a meta-scheduler for the given scheduler set.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            schedulers: config.schedulers,
            idle_meta_threads: Mutex::new(Vec::new()),
            meta_thread_available: Condvar::new(),
        })
    }

    /// Deposits a new meta-thread into the idle pool.
    pub fn create_meta_thread(&self, config: MetaThreadConfig) {
        let mut idle = self.idle_meta_threads.lock().expect(POOL_POISONED);
        idle.push(MetaThread {
            processor_affinity: config.processor_affinity,
            run_mode_overrides: config.run_mode_overrides,
        });
        // Contexts may already be waiting for a ticket.
        self.meta_thread_available.notify_all();
    }

    /// Returns the calling thread's context, creating it on first use.
    ///
    /// The context is reference-counted per thread: every successful call must
    /// be balanced by dropping the returned handle, and the last drop tears
    /// the context down.
    pub fn acquire_context(self: &Arc<Self>) -> Result<Context, ContextOwnerMismatch> {
        CURRENT_CONTEXT.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &*slot {
                Some(inner) => {
                    if !Arc::ptr_eq(&inner.owner, self) {
                        return Err(ContextOwnerMismatch);
                    }
                    Ok(Context {
                        inner: Rc::clone(inner),
                    })
                }
                None => {
                    let inner = ContextInner::new(Arc::clone(self));
                    *slot = Some(Rc::clone(&inner));
                    Ok(Context { inner })
                }
            }
        })
    }

    fn return_meta_thread(&self, meta_thread: MetaThread) {
        let mut idle = self.idle_meta_threads.lock().expect(POOL_POISONED);
        idle.push(meta_thread);
        self.meta_thread_available.notify_one();
    }
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Rc<ContextInner>>> = const { RefCell::new(None) };
}

/// Returns the calling thread's context state, if it has one.
pub(crate) fn current_context() -> Option<Rc<ContextInner>> {
    CURRENT_CONTEXT.with(|slot| slot.borrow().clone())
}

/// Per-thread state shared with the `wait_for*` combinators.
pub(crate) struct ContextInner {
    owner: Arc<MetaScheduler>,
    wait_semaphore: Semaphore,
    // Persistent waiter posting `wait_semaphore`; owned by this context.
    waiter: Cell<*mut Waiter>,
}

impl ContextInner {
    fn new(owner: Arc<MetaScheduler>) -> Rc<Self> {
        let inner = Rc::new(Self {
            owner,
            wait_semaphore: Semaphore::new(0),
            waiter: Cell::new(ptr::null_mut()),
        });
        // The semaphore address is stable from here on: it lives inside the
        // reference-counted allocation the waiter is destroyed together with.
        let poster = SemaphoreRef::new(&inner.wait_semaphore);
        let waiter = Waiter::create(move || poster.post(), false);
        inner.waiter.set(waiter.as_ptr());
        inner
    }

    pub(crate) fn wait_semaphore(&self) -> &Semaphore {
        &self.wait_semaphore
    }

    pub(crate) fn persistent_waiter(&self) -> NonNull<Waiter> {
        NonNull::new(self.waiter.get()).expect("context waiter is initialized in new")
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(waiter) = NonNull::new(self.waiter.get()) {
            // SAFETY: the waiter is out of every list whenever no wait is in
            // progress on this thread, and the context cannot be dropped
            // mid-wait.
            unsafe { Waiter::destroy(waiter) };
        }
    }
}

/// Handle to the calling thread's meta-scheduler context.
///
/// Dropping the last handle on a thread releases the context and clears the
/// thread-local slot.
pub struct Context {
    inner: Rc<ContextInner>,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Two remaining references means this handle plus the thread-local
        // slot: clear the slot so the context tears down with us.
        if Rc::strong_count(&self.inner) == 2 {
            CURRENT_CONTEXT.with(|slot| slot.borrow_mut().take());
        }
    }
}

/// State shared between the running context and waiter callbacks that fire on
/// foreign threads. Reference-counted so a late callback can never outlive it.
struct RunShared {
    state: Mutex<RunState>,
    state_changed: Condvar,
    stop: AtomicBool,
}

struct RunState {
    stop: bool,
    /// Number of schedulers that should be on the active list.
    active_count: usize,
    last_states: Vec<SchedulerState>,
}

/// Signals used while acquiring a meta-thread from the idle pool.
#[derive(Default)]
struct PoolSignal {
    stop: AtomicBool,
    searching: AtomicBool,
    callback_done: AtomicBool,
}

/// Raw pointers captured by the pool waiter callback.
///
/// The callback may run on any signaling thread; `run` guarantees both
/// referents outlive the waiter by removing it or spinning on `callback_done`
/// before they go out of scope.
#[derive(Clone, Copy)]
struct PoolSignalRef {
    signal: *const PoolSignal,
    owner: *const MetaScheduler,
}

// SAFETY: see the type docs; the referents are kept alive until the callback
// finishes.
unsafe impl Send for PoolSignalRef {}

impl PoolSignalRef {
    fn fire(self) {
        // SAFETY: see the type docs.
        let (signal, owner) = unsafe { (&*self.signal, &*self.owner) };
        signal.stop.store(true, Ordering::Release);
        if signal.searching.load(Ordering::Acquire) {
            let _idle = owner.idle_meta_threads.lock().expect(POOL_POISONED);
            owner.meta_thread_available.notify_all();
        }
        signal.callback_done.store(true, Ordering::Release);
    }
}

struct Slot<'run> {
    scheduler: &'run dyn Scheduler,
    run_mode: RunMode,
    waiter: NonNull<Waiter>,
}

impl Context {
    /// Drives the schedulers until `until` signals.
    ///
    /// Acquires one idle meta-thread (waiting for one if necessary), applies
    /// its processor affinity, and multiplexes every enabled scheduler on the
    /// calling thread. Returns once `until` fires, restoring the previous
    /// affinity and returning the meta-thread to the idle pool.
    pub fn run(&self, until: &dyn Waitable) {
        self.inner.run(until);
    }
}

impl ContextInner {
    fn run(&self, until: &dyn Waitable) {
        let owner = &*self.owner;

        let Some(meta_thread) = acquire_meta_thread(owner, until) else {
            return;
        };

        let shared = Arc::new(RunShared {
            state: Mutex::new(RunState {
                stop: false,
                active_count: 0,
                last_states: Vec::new(),
            }),
            state_changed: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        // Stop waiter: flips the flags and wakes the state condvar.
        let stop_waiter = Waiter::create(
            {
                let shared = Arc::clone(&shared);
                move || {
                    shared.stop.store(true, Ordering::Release);
                    let mut state = shared.state.lock().expect(STATE_POISONED);
                    state.stop = true;
                    shared.state_changed.notify_all();
                }
            },
            false,
        );
        // SAFETY: the waiter holds its own reference to `shared` and is
        // reclaimed in the teardown below.
        if !unsafe { until.add_waiter(stop_waiter) } {
            // Already signaled.
            // SAFETY: never armed.
            unsafe { Waiter::destroy(stop_waiter) };
            owner.return_meta_thread(meta_thread);
            return;
        }

        let saved_affinity = meta_thread.processor_affinity.and_then(|affinity| {
            match set_current_thread_affinity(affinity) {
                Ok(previous) => Some(previous),
                Err(error) => {
                    log::warn!("failed to apply meta-thread affinity: {error}");
                    None
                }
            }
        });

        // Build one slot per enabled scheduler; each starts active and gets a
        // persistent has-work waiter flipping it back to Working.
        let mut slots: Vec<Slot<'_>> = Vec::new();
        for info in &owner.schedulers {
            let run_mode = meta_thread
                .run_mode_overrides
                .get(&info.id)
                .copied()
                .unwrap_or(info.default_run_mode);
            if run_mode == RunMode::Disabled {
                log::debug!("scheduler {} disabled on this meta-thread", info.id);
                continue;
            }

            let index = slots.len();
            let waiter = Waiter::create(
                {
                    let shared = Arc::clone(&shared);
                    move || {
                        let mut state = shared.state.lock().expect(STATE_POISONED);
                        if state.last_states[index] == SchedulerState::Idle {
                            state.last_states[index] = SchedulerState::Working;
                            state.active_count += 1;
                        }
                        shared.state_changed.notify_all();
                    }
                },
                false,
            );
            slots.push(Slot {
                scheduler: &*info.scheduler,
                run_mode,
                waiter,
            });
        }

        {
            let mut state = shared.state.lock().expect(STATE_POISONED);
            state.active_count = slots.len();
            state.last_states = vec![SchedulerState::Working; slots.len()];
        }

        let mut active: Vec<usize> = (0..slots.len()).collect();
        let mut idle: Vec<usize> = Vec::new();
        let mut polling_count = 0usize;

        loop {
            {
                let state = shared.state.lock().expect(STATE_POISONED);
                if state.stop {
                    break;
                }
                // Reclaim idle schedulers whose has-work callback fired.
                if state.active_count != active.len() {
                    idle.retain(|&index| {
                        if state.last_states[index] == SchedulerState::Working {
                            active.push(index);
                            false
                        } else {
                            true
                        }
                    });
                }
            }

            let mut position = 0;
            while position < active.len() {
                let index = active[position];
                let slot = &slots[index];
                let new_state = drive(slot, &shared.stop);

                let mut state = shared.state.lock().expect(STATE_POISONED);
                let previous = state.last_states[index];
                match new_state {
                    SchedulerState::Idle => {
                        // Park on the has-work condition; an immediately
                        // signaled condition keeps the scheduler active.
                        // SAFETY: the slot waiter is reclaimed in the teardown
                        // below, after removal or callback completion.
                        if unsafe {
                            slot.scheduler
                                .context()
                                .has_work_condition()
                                .add_waiter(slot.waiter)
                        } {
                            state.last_states[index] = SchedulerState::Idle;
                            state.active_count -= 1;
                            if previous == SchedulerState::Polling {
                                polling_count -= 1;
                            }
                            drop(state);
                            active.remove(position);
                            idle.push(index);
                            continue;
                        }
                        state.last_states[index] = SchedulerState::Working;
                        if previous == SchedulerState::Polling {
                            polling_count -= 1;
                        }
                    }
                    SchedulerState::Working | SchedulerState::Polling => {
                        state.last_states[index] = new_state;
                        if previous == SchedulerState::Polling && new_state != SchedulerState::Polling
                        {
                            polling_count -= 1;
                        }
                        if previous != SchedulerState::Polling && new_state == SchedulerState::Polling
                        {
                            polling_count += 1;
                        }
                    }
                }
                drop(state);
                position += 1;
            }

            if active.is_empty() {
                // Everything is parked; sleep until a has-work callback or the
                // stop waiter wakes us.
                let mut state = shared.state.lock().expect(STATE_POISONED);
                while state.active_count == 0 && !state.stop {
                    state = shared.state_changed.wait(state).expect(STATE_POISONED);
                }
            } else if polling_count == active.len() {
                // Every active scheduler is busy-polling; be a good neighbor.
                hint::pause();
                hint::yield_now();
            }
        }

        // Teardown: reclaim the has-work waiters of parked schedulers.
        for &index in &idle {
            let slot = &slots[index];
            // SAFETY: the waiter was armed when the slot went onto the idle
            // list.
            if !unsafe {
                slot.scheduler
                    .context()
                    .has_work_condition()
                    .remove_waiter(slot.waiter)
            } {
                // The callback fired instead; wait for it to finish, observed
                // by the state leaving Idle under the lock.
                let mut state = shared.state.lock().expect(STATE_POISONED);
                while state.last_states[index] == SchedulerState::Idle {
                    state = shared.state_changed.wait(state).expect(STATE_POISONED);
                }
            }
        }
        for slot in &slots {
            // SAFETY: removed above or never armed; no callback can be in
            // flight once its completion was observed under the state lock.
            unsafe { Waiter::destroy(slot.waiter) };
        }

        // SAFETY: the stop waiter was armed after meta-thread acquisition.
        if !unsafe { until.remove_waiter(stop_waiter) } {
            let mut state = shared.state.lock().expect(STATE_POISONED);
            while !state.stop {
                state = shared.state_changed.wait(state).expect(STATE_POISONED);
            }
        }
        // SAFETY: removed, or its callback completed per the wait above.
        unsafe { Waiter::destroy(stop_waiter) };

        if let Some(previous) = saved_affinity
            && let Err(error) = set_current_thread_affinity(previous)
        {
            log::warn!("failed to restore thread affinity: {error}");
        }

        owner.return_meta_thread(meta_thread);
    }
}

/// Blocks until an idle meta-thread is available or `until` fires; `None`
/// means `until` won.
fn acquire_meta_thread(owner: &MetaScheduler, until: &dyn Waitable) -> Option<MetaThread> {
    let pool_signal = PoolSignal {
        searching: AtomicBool::new(true),
        ..PoolSignal::default()
    };
    let refs = PoolSignalRef {
        signal: &pool_signal,
        owner,
    };
    let pool_waiter = Waiter::create(move || refs.fire(), false);

    let mut meta_thread = None;
    // SAFETY: the waiter is removed below, or spun on until its callback
    // completes, before `pool_signal` leaves scope.
    if unsafe { until.add_waiter(pool_waiter) } {
        {
            let mut idle = owner.idle_meta_threads.lock().expect(POOL_POISONED);
            loop {
                if pool_signal.stop.load(Ordering::Acquire) {
                    break;
                }
                if let Some(ticket) = idle.pop() {
                    meta_thread = Some(ticket);
                    break;
                }
                idle = owner.meta_thread_available.wait(idle).expect(POOL_POISONED);
            }
            pool_signal.searching.store(false, Ordering::Release);
        }

        // SAFETY: armed above.
        if !unsafe { until.remove_waiter(pool_waiter) } {
            let mut backoff = ExponentialBackoff::<16>::default();
            while !pool_signal.callback_done.load(Ordering::Acquire) {
                backoff.pause();
            }
        }
    }
    // SAFETY: never armed, removed, or its callback has completed.
    unsafe { Waiter::destroy(pool_waiter) };

    if pool_signal.stop.load(Ordering::Acquire) {
        // `until` fired during acquisition; hand any ticket straight back.
        if let Some(ticket) = meta_thread {
            owner.return_meta_thread(ticket);
        }
        return None;
    }
    meta_thread
}

fn drive(slot: &Slot<'_>, stop: &AtomicBool) -> SchedulerState {
    let context = slot.scheduler.context();
    match slot.run_mode {
        RunMode::Disabled => unreachable!("disabled schedulers are never driven"),
        RunMode::All => context.run(&mut RunAllThrottler { stop }),
        RunMode::Some(count) => context.run(&mut RunSomeThrottler {
            remaining: count,
            stop,
        }),
        RunMode::Timed(duration) => context.run(&mut RunTimedThrottler {
            deadline: Instant::now() + duration,
            stop,
        }),
    }
}

struct RunAllThrottler<'run> {
    stop: &'run AtomicBool,
}

impl Throttler for RunAllThrottler<'_> {
    fn should_yield(&mut self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

struct RunSomeThrottler<'run> {
    remaining: u32,
    stop: &'run AtomicBool,
}

impl Throttler for RunSomeThrottler<'_> {
    fn should_yield(&mut self) -> bool {
        if self.stop.load(Ordering::Acquire) || self.remaining == 0 {
            return true;
        }
        self.remaining -= 1;
        false
    }
}

struct RunTimedThrottler<'run> {
    deadline: Instant,
    stop: &'run AtomicBool,
}

impl Throttler for RunTimedThrottler<'_> {
    fn should_yield(&mut self) -> bool {
        self.stop.load(Ordering::Acquire) || Instant::now() >= self.deadline
    }
}
