//! Simple thread pool for coarse-grained tasks. Not designed for performance.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};

use strand_platform::thread::{self, Thread};

use crate::future::{Future, Promise};

const POOL_POISONED: &str = "thread pool mutex poisoned";

/// Error stored in a task's future when the task panicked.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("thread pool task panicked")]
pub struct TaskPanicked;

type WorkItem = Box<dyn FnOnce() + Send>;

struct PoolState {
    stop: bool,
    work: VecDeque<WorkItem>,
    idle_thread_count: u32,
}

struct PoolShared {
    state: Mutex<PoolState>,
    has_work: Condvar,
}

/// A lazily-growing pool of worker threads.
///
/// Threads are spawned only while work is queued, no worker is idle, and the
/// cap has not been reached. Dropping the pool stops the workers, joins them,
/// and runs any still-queued work inline so every returned [`Future`]
/// completes.
///
/// # Example
///
/// ```rust
/// use strand_sync::ThreadPool;
///
/// let pool = ThreadPool::new(2);
/// let future = pool.post(|| 6 * 7).unwrap();
/// assert_eq!(future.get().copied().unwrap(), 42);
/// ```
pub struct ThreadPool {
    max_thread_count: u32,
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<Thread>>,
}

impl core::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("max_thread_count", &self.max_thread_count)
            .finish_non_exhaustive()
    }
}

impl ThreadPool {
    /// Creates a pool that grows up to `max_thread_count` workers.
    pub fn new(max_thread_count: u32) -> Self {
        Self {
            max_thread_count,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    stop: false,
                    work: VecDeque::new(),
                    idle_thread_count: 0,
                }),
                has_work: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Queues `task` and returns a future for its result.
    ///
    /// A panicking task completes its future with [`TaskPanicked`] instead of
    /// leaving it forever pending.
    pub fn post<F, R>(&self, task: F) -> Result<Future<R>, thread::SpawnError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.add_work_item(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => promise.set_value(value),
                Err(_panic) => promise.set_error(TaskPanicked),
            }
        }))?;
        Ok(future)
    }

    /// Number of worker threads currently alive.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().expect(POOL_POISONED).len()
    }

    fn add_work_item(&self, work: WorkItem) -> Result<(), thread::SpawnError> {
        let mut threads = self.threads.lock().expect(POOL_POISONED);
        let mut state = self.shared.state.lock().expect(POOL_POISONED);
        state.work.push_back(work);

        if state.idle_thread_count == 0 && threads.len() < self.max_thread_count as usize {
            let worker = thread::spawn({
                let shared = Arc::clone(&self.shared);
                move || worker_loop(&shared)
            })?;
            log::debug!("thread pool grew to {} workers", threads.len() + 1);
            threads.push(worker);
        } else {
            self.shared.has_work.notify_one();
        }
        Ok(())
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let mut state = shared.state.lock().expect(POOL_POISONED);
        if state.stop {
            return;
        }
        state.idle_thread_count += 1;

        while state.work.is_empty() {
            state = shared.has_work.wait(state).expect(POOL_POISONED);
            if state.stop {
                state.idle_thread_count -= 1;
                return;
            }
        }

        let work = state
            .work
            .pop_front()
            .expect("non-empty work queue just observed");
        state.idle_thread_count -= 1;
        drop(state);

        // Panics are contained per item so a bad task cannot take the worker
        // down with it.
        let _ = catch_unwind(AssertUnwindSafe(work));
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect(POOL_POISONED);
            state.stop = true;
            self.shared.has_work.notify_all();
        }

        for worker in self.threads.lock().expect(POOL_POISONED).drain(..) {
            worker.join();
        }

        // Complete whatever never got picked up.
        let remaining: Vec<WorkItem> = {
            let mut state = self.shared.state.lock().expect(POOL_POISONED);
            state.work.drain(..).collect()
        };
        for work in remaining {
            let _ = catch_unwind(AssertUnwindSafe(work));
        }
    }
}
