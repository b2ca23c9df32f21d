//! Processor affinity masks.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitXor, Not};

/// A set of logical processor ids, stored as a 64-bit mask.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSet {
    mask: u64,
}

impl CpuSet {
    /// Highest processor id representable in the mask.
    pub const MAX_PROCESSOR_ID: u32 = 63;

    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { mask: 0 }
    }

    /// Creates a set holding exactly `processor_id`.
    pub const fn single(processor_id: u32) -> Self {
        let mut set = Self::new();
        set.mask |= 1 << processor_id;
        set
    }

    /// Creates a set from a raw bitmask.
    pub const fn from_mask(mask: u64) -> Self {
        Self { mask }
    }

    /// Returns the raw bitmask.
    pub const fn mask(self) -> u64 {
        self.mask
    }

    /// Adds `processor_id` to the set.
    pub fn set(&mut self, processor_id: u32) {
        assert!(processor_id <= Self::MAX_PROCESSOR_ID);
        self.mask |= 1 << processor_id;
    }

    /// Removes `processor_id` from the set.
    pub fn clear(&mut self, processor_id: u32) {
        assert!(processor_id <= Self::MAX_PROCESSOR_ID);
        self.mask &= !(1 << processor_id);
    }

    /// Whether `processor_id` is in the set.
    pub const fn is_set(self, processor_id: u32) -> bool {
        processor_id <= Self::MAX_PROCESSOR_ID && self.mask & (1 << processor_id) != 0
    }

    /// Whether the set contains no processors.
    pub const fn is_empty(self) -> bool {
        self.mask == 0
    }

    /// Returns the highest processor id in the set, if any.
    pub const fn highest_set(self) -> Option<u32> {
        if self.mask == 0 {
            None
        } else {
            Some(63 - self.mask.leading_zeros())
        }
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({:#x})", self.mask)
    }
}

impl BitOr for CpuSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            mask: self.mask | rhs.mask,
        }
    }
}

impl BitAnd for CpuSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self {
            mask: self.mask & rhs.mask,
        }
    }
}

impl BitXor for CpuSet {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        Self {
            mask: self.mask ^ rhs.mask,
        }
    }
}

impl Not for CpuSet {
    type Output = Self;

    fn not(self) -> Self {
        Self { mask: !self.mask }
    }
}

/// Error applying or querying a processor affinity mask.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// Affinity control is not implemented for this target OS.
    #[error("processor affinity is not supported on this platform")]
    Unsupported,
    /// The kernel rejected the request.
    #[error("affinity syscall failed")]
    Os(#[from] std::io::Error),
}

/// Pins the current thread to `affinity` and returns the previous mask.
pub fn set_current_thread_affinity(affinity: CpuSet) -> Result<CpuSet, AffinityError> {
    let previous = get_current_thread_affinity()?;
    imp::set(affinity)?;
    Ok(previous)
}

/// Returns the current thread's affinity mask.
pub fn get_current_thread_affinity() -> Result<CpuSet, AffinityError> {
    imp::get()
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{AffinityError, CpuSet};

    pub(super) fn set(affinity: CpuSet) -> Result<(), AffinityError> {
        // SAFETY: `cpu_set_t` is plain data; zeroed is a valid empty set.
        let mut native: libc::cpu_set_t = unsafe { core::mem::zeroed() };
        for processor_id in 0..=CpuSet::MAX_PROCESSOR_ID {
            if affinity.is_set(processor_id) {
                // SAFETY: `processor_id` is within `cpu_set_t` capacity.
                unsafe { libc::CPU_SET(processor_id as usize, &mut native) };
            }
        }
        // SAFETY: `native` is a valid initialized cpu_set_t.
        let rc = unsafe {
            libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &native)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub(super) fn get() -> Result<CpuSet, AffinityError> {
        // SAFETY: `cpu_set_t` is plain data; zeroed is a valid empty set.
        let mut native: libc::cpu_set_t = unsafe { core::mem::zeroed() };
        // SAFETY: `native` is valid for writes of `cpu_set_t` size.
        let rc = unsafe {
            libc::sched_getaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &mut native)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut set = CpuSet::new();
        for processor_id in 0..=CpuSet::MAX_PROCESSOR_ID {
            // SAFETY: `processor_id` is within `cpu_set_t` capacity.
            if unsafe { libc::CPU_ISSET(processor_id as usize, &native) } {
                set.set(processor_id);
            }
        }
        Ok(set)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::{AffinityError, CpuSet};

    pub(super) fn set(_affinity: CpuSet) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }

    pub(super) fn get() -> Result<CpuSet, AffinityError> {
        Err(AffinityError::Unsupported)
    }
}
