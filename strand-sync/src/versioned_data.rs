//! Versioned shared value with cheap change detection.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// A mutex-protected value with a monotonically increasing version.
///
/// Readers keep their last seen version and only take the lock when
/// [`VersionedData::has_changed`] says there is something new, which keeps
/// rarely-changing shared configuration off the hot path.
#[derive(Debug, Default)]
pub struct VersionedData<T> {
    version: AtomicU32,
    data: Mutex<T>,
}

impl<T> VersionedData<T> {
    /// Wraps `data` at version 0.
    pub fn new(data: T) -> Self {
        Self {
            version: AtomicU32::new(0),
            data: Mutex::new(data),
        }
    }

    /// Whether the value has changed since `last_seen_version`.
    pub fn has_changed(&self, last_seen_version: u32) -> bool {
        self.version.load(Ordering::Acquire) != last_seen_version
    }

    /// Mutates the value and bumps the version.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let mut data = self.data.lock().expect("versioned data mutex poisoned");
        mutate(&mut data);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Reads the value only if it changed since `*last_seen_version`, updating
    /// the caller's version on read.
    pub fn read_if_different(&self, last_seen_version: &mut u32, read: impl FnOnce(&T)) {
        if !self.has_changed(*last_seen_version) {
            return;
        }
        let data = self.data.lock().expect("versioned data mutex poisoned");
        read(&data);
        *last_seen_version = self.version.load(Ordering::Acquire);
    }
}

#[cfg(test)]
mod tests {
    use super::VersionedData;

    #[test]
    fn reads_only_on_change() {
        let data = VersionedData::new(0u32);
        let mut seen = 0;

        let mut reads = 0;
        data.read_if_different(&mut seen, |_| reads += 1);
        assert_eq!(reads, 0);

        data.update(|value| *value = 7);
        assert!(data.has_changed(seen));

        let mut observed = 0;
        data.read_if_different(&mut seen, |value| observed = *value);
        assert_eq!(observed, 7);
        assert!(!data.has_changed(seen));
    }
}
