//! Cross-thread event behavior.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ntest_timeout::timeout;
use strand_sync::{Event, WaitMode, Waitable, Waiter, wait_for};

#[test]
#[timeout(10000)]
fn set_wakes_a_blocked_waiter_exactly_once() {
    let event = Event::new(false);
    let wakes = AtomicU32::new(0);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            wait_for(&event, WaitMode::block(0));
            assert!(event.is_set());
            wakes.fetch_add(1, Ordering::Relaxed);
        });
        std::thread::sleep(Duration::from_millis(50));
        event.set();
    });

    assert_eq!(wakes.load(Ordering::Relaxed), 1);
}

#[test]
#[timeout(10000)]
fn waiters_from_many_threads_all_wake() {
    const THREADS: usize = 8;

    let event = Event::new(false);
    let wakes = AtomicU32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                wait_for(&event, WaitMode::block(0));
                wakes.fetch_add(1, Ordering::Relaxed);
            });
        }
        std::thread::sleep(Duration::from_millis(50));
        event.set();
    });

    assert_eq!(wakes.load(Ordering::Relaxed), THREADS as u32);
}

#[test]
#[timeout(10000)]
fn wait_on_set_event_returns_immediately() {
    let event = Event::new(true);
    wait_for(&event, WaitMode::block(0));
    // Polling mode must not suspend either.
    wait_for(&event, WaitMode::poll());
}

/// Concurrent `add_waiter`/`remove_waiter`/`set`: every armed waiter is either
/// removed or notified, never both and never neither.
#[test]
#[timeout(60000)]
fn concurrent_add_remove_set_accounts_for_every_waiter() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    for _ in 0..ROUNDS {
        let event = Event::new(false);
        let notified = AtomicU32::new(0);
        let armed = AtomicU32::new(0);
        let removed = AtomicU32::new(0);
        // Waiters consumed by a notification; reclaimed after the race ends.
        let lost: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    let waiter = Waiter::create(
                        || {
                            notified.fetch_add(1, Ordering::Relaxed);
                        },
                        false,
                    );

                    // SAFETY: the waiter is destroyed below, or after the
                    // scope once its notification has completed.
                    if unsafe { event.add_waiter(waiter) } {
                        armed.fetch_add(1, Ordering::Relaxed);
                        std::thread::yield_now();
                        // SAFETY: armed above.
                        if unsafe { event.remove_waiter(waiter) } {
                            removed.fetch_add(1, Ordering::Relaxed);
                            // SAFETY: removal handed it back to us.
                            unsafe { Waiter::destroy(waiter) };
                        } else {
                            lost.lock().unwrap().push(waiter.as_ptr() as usize);
                        }
                    } else {
                        // SAFETY: never armed.
                        unsafe { Waiter::destroy(waiter) };
                    }
                });
            }
            scope.spawn(|| {
                std::thread::yield_now();
                event.set();
            });
        });

        // All threads joined: the set call and every callback have completed.
        assert_eq!(
            notified.load(Ordering::Relaxed) + removed.load(Ordering::Relaxed),
            armed.load(Ordering::Relaxed),
        );

        for address in lost.into_inner().unwrap() {
            let waiter = core::ptr::NonNull::new(address as *mut Waiter).unwrap();
            // SAFETY: the notification completed before the scope ended;
            // ownership is back with us.
            unsafe { Waiter::destroy(waiter) };
        }
    }
}
