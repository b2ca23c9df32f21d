//! Cross-thread semaphore behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ntest_timeout::timeout;
use strand_sync::{Semaphore, WaitMode, wait_for};

fn settle() {
    std::thread::sleep(Duration::from_millis(100));
}

/// Initial count 2, seven waits: five park. Three posts wake exactly three,
/// two stay parked, and the count is back to zero.
#[test]
#[timeout(20000)]
fn posts_wake_exactly_as_many_parked_waiters() {
    let semaphore = Semaphore::new(2);
    let completions = AtomicU32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..7 {
            scope.spawn(|| {
                wait_for(&semaphore, WaitMode::block(0));
                completions.fetch_add(1, Ordering::Relaxed);
            });
        }

        // Two immediate units are consumed, five waiters park.
        while completions.load(Ordering::Relaxed) < 2 {
            std::thread::yield_now();
        }
        settle();
        assert_eq!(completions.load(Ordering::Relaxed), 2);

        for _ in 0..3 {
            semaphore.post();
        }
        while completions.load(Ordering::Relaxed) < 5 {
            std::thread::yield_now();
        }
        settle();
        // Exactly three woke; two are still parked.
        assert_eq!(completions.load(Ordering::Relaxed), 5);

        // The count is zero: exactly two more posts release the rest.
        semaphore.post();
        semaphore.post();
    });

    assert_eq!(completions.load(Ordering::Relaxed), 7);
}

/// `Semaphore(0)` and one post wakes exactly one blocked waiter.
#[test]
#[timeout(10000)]
fn single_post_wakes_single_waiter() {
    let semaphore = Semaphore::new(0);
    let completions = AtomicU32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                wait_for(&semaphore, WaitMode::block(0));
                completions.fetch_add(1, Ordering::Relaxed);
            });
        }

        settle();
        assert_eq!(completions.load(Ordering::Relaxed), 0);

        semaphore.post();
        while completions.load(Ordering::Relaxed) < 1 {
            std::thread::yield_now();
        }
        settle();
        assert_eq!(completions.load(Ordering::Relaxed), 1);

        semaphore.post();
    });

    assert_eq!(completions.load(Ordering::Relaxed), 2);
}

/// A unit posted while nobody is parked is banked and consumed by the next
/// wait without blocking.
#[test]
#[timeout(10000)]
fn banked_units_satisfy_later_waits() {
    let semaphore = Semaphore::new(0);
    for _ in 0..3 {
        semaphore.post();
    }
    for _ in 0..3 {
        wait_for(&semaphore, WaitMode::block(0));
    }
}
