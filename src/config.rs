//! Configuration and sizing constants for the allocator.

use crate::policy::PlacementPolicy;

/// Payload alignment guaranteed for every pointer handed to callers.
///
/// Derived from the widest scalar the target supports so that any
/// fundamental type can live at the start of a payload.
pub const ALIGNMENT: usize = {
    let wide = core::mem::align_of::<u128>();
    let word = core::mem::align_of::<usize>();
    if wide > word { wide } else { word }
};

/// Smallest payload a block may carry.
pub const MIN_PAYLOAD_SIZE: usize = ALIGNMENT;

/// Default size for arenas created by [`HeapConfig::default`], in bytes.
pub const DEFAULT_ARENA_SIZE: usize = 128 * 1024;

/// Default request size at which an arena gets its own page mapping
/// instead of being carved from the break pool.
pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;

/// Hard floor for the mmap threshold (one system page).
pub const MIN_MMAP_THRESHOLD: usize = 4096;

/// Default reservation for the break pool backing sub-threshold arenas.
pub const DEFAULT_BREAK_POOL_CAPACITY: usize = 64 * 1024 * 1024;

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(ALIGNMENT >= 8);

/// Construction-time configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Size of the initial arena (clamped up to the minimum arena size).
    pub arena_size: usize,

    /// Placement policy the heap starts with.
    pub policy: PlacementPolicy,

    /// Requests at or above this size get a dedicated page mapping.
    pub mmap_threshold: usize,

    /// Total reservation for the break pool that backs smaller arenas.
    pub break_pool_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            policy: PlacementPolicy::FirstFit,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            break_pool_capacity: DEFAULT_BREAK_POOL_CAPACITY,
        }
    }
}

impl HeapConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial arena size.
    #[must_use]
    pub fn with_arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    /// Sets the starting placement policy.
    #[must_use]
    pub fn with_policy(mut self, policy: PlacementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the mmap threshold (floored at [`MIN_MMAP_THRESHOLD`] when the
    /// heap is built).
    #[must_use]
    pub fn with_mmap_threshold(mut self, bytes: usize) -> Self {
        self.mmap_threshold = bytes;
        self
    }

    /// Sets the break pool reservation.
    #[must_use]
    pub fn with_break_pool_capacity(mut self, bytes: usize) -> Self {
        self.break_pool_capacity = bytes;
        self
    }
}

/// Live, mutable runtime settings guarded by the heap's config lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuntimeConfig {
    pub(crate) policy: PlacementPolicy,
    pub(crate) mmap_threshold: usize,
}

impl RuntimeConfig {
    pub(crate) fn new(policy: PlacementPolicy, mmap_threshold: usize) -> Self {
        Self {
            policy,
            mmap_threshold: mmap_threshold.max(MIN_MMAP_THRESHOLD),
        }
    }
}
