//! Processor pause and thread yield hints.

/// Issues a single processor spin-wait hint (`pause` on x86, `yield` on AArch64).
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Issues `count` consecutive spin-wait hints.
#[inline]
pub fn pause_n(count: u32) {
    for _ in 0..count {
        core::hint::spin_loop();
    }
}

/// Yields the rest of the current OS time slice to another ready thread.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}
