//! Composable waitable synchronization primitives and a cooperative
//! meta-scheduler.
//!
//! Everything in this crate is built on one 64-bit atomic word packing a
//! waiter-list pointer, a primitive-specific flag, a removal lock bit, and a
//! version counter. [`Event`], [`Mutex`] and [`Semaphore`] are thin state
//! machines over that word; all of them implement [`Waitable`], so they can
//! be combined freely with [`wait_for`], [`wait_for_all`] and
//! [`wait_for_any`]. [`Promise`]/[`Future`] deliver one value or error
//! through an embedded event, and the [`meta_scheduler`] multiplexes
//! cooperative [`scheduler::Scheduler`]s onto a pool of meta-threads.
//!
//! # Example
//!
//! ```rust
//! use strand_sync::{Event, Promise, WaitMode, Waitable, wait_for_any};
//!
//! let ready = Event::new(false);
//! let promise = Promise::new();
//! let future = promise.future();
//!
//! std::thread::scope(|scope| {
//!     scope.spawn(|| promise.set_value("hello"));
//!
//!     // Only the future can fire here, so it must be in the signaled set.
//!     let signaled = wait_for_any(&[&ready as &dyn Waitable, &future], WaitMode::block(0));
//!     assert_eq!(signaled, [1]);
//! });
//! assert_eq!(*future.get().unwrap(), "hello");
//! ```

pub mod backoff;
pub mod event;
pub mod future;
pub mod lifo_list;
pub mod lifo_queue;
pub mod meta_scheduler;
pub mod mutex;
pub mod scheduler;
pub mod semaphore;
pub mod spin_barrier;
pub mod thread_pool;
pub mod versioned_data;
pub mod waitable;
pub mod waiter;

mod waiter_list;

pub use self::event::Event;
pub use self::future::{Future, Promise, PromiseError};
pub use self::lifo_list::{IntrusiveNode, MpmcLifoList};
pub use self::lifo_queue::MpmcLifoQueue;
pub use self::meta_scheduler::{Config, Context, MetaScheduler, MetaThreadConfig, RunMode};
pub use self::mutex::Mutex;
pub use self::semaphore::Semaphore;
pub use self::spin_barrier::SpinBarrier;
pub use self::thread_pool::ThreadPool;
pub use self::versioned_data::VersionedData;
pub use self::waitable::{WaitMode, Waitable, wait_for, wait_for_all, wait_for_any};
pub use self::waiter::Waiter;
