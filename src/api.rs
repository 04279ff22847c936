//! Process-global allocator façade.
//!
//! Thin malloc-style free functions over one lazily installed [`Heap`].
//! Engine errors are flattened the way a platform allocator behaves:
//! allocation-family calls return null and `free` is a no-op, with the
//! diagnostic already emitted by the engine. Lifecycle and control calls
//! keep their `HeapResult` so misuse (double init, use before init)
//! stays visible.

use std::ptr;

use parking_lot::Mutex;

use crate::arena::{ArenaSnapshot, HeapStatsSnapshot};
use crate::config::HeapConfig;
use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::policy::PlacementPolicy;

static GLOBAL: Mutex<Option<Heap>> = Mutex::new(None);

fn with_heap<R>(f: impl FnOnce(&Heap) -> R) -> HeapResult<R> {
    let slot = GLOBAL.lock();
    match slot.as_ref() {
        Some(heap) => Ok(f(heap)),
        None => Err(HeapError::NotInitialized),
    }
}

/// Installs the global heap with the given first-arena size and policy.
///
/// # Errors
///
/// [`HeapError::AlreadyInitialized`] when a global heap exists, or any
/// error from [`Heap::new`].
pub fn init(arena_size: usize, policy: PlacementPolicy) -> HeapResult<()> {
    let mut slot = GLOBAL.lock();
    if slot.is_some() {
        return Err(HeapError::AlreadyInitialized);
    }
    let heap = Heap::new(
        HeapConfig::new()
            .with_arena_size(arena_size)
            .with_policy(policy),
    )?;
    *slot = Some(heap);
    Ok(())
}

/// Tears down the global heap, destroying every arena.
///
/// # Errors
///
/// [`HeapError::NotInitialized`] when no global heap exists.
pub fn finalize() -> HeapResult<()> {
    match GLOBAL.lock().take() {
        Some(heap) => {
            drop(heap);
            Ok(())
        }
        None => Err(HeapError::NotInitialized),
    }
}

/// Allocates `size` bytes; null on failure or when `size == 0`.
#[must_use]
pub fn allocate(size: usize) -> *mut u8 {
    with_heap(|heap| {
        heap.allocate(size)
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    })
    .unwrap_or(ptr::null_mut())
}

/// Allocates a zeroed region of `count * size` bytes; null on overflow or
/// failure.
#[must_use]
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    with_heap(|heap| {
        heap.allocate_zeroed(count, size)
            .map_or(ptr::null_mut(), |p| p.as_ptr())
    })
    .unwrap_or(ptr::null_mut())
}

/// Resizes the allocation at `ptr`; null on failure (the old pointer
/// stays valid) and after a `size == 0` release.
///
/// # Safety
///
/// Same contract as [`Heap::resize`].
#[must_use]
pub unsafe fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    with_heap(|heap| {
        // SAFETY: forwarded caller contract.
        unsafe { heap.resize(ptr, size) }.map_or(ptr::null_mut(), |p| p.as_ptr())
    })
    .unwrap_or(ptr::null_mut())
}

/// Frees the allocation at `ptr`; null and invalid pointers are diagnosed
/// no-ops.
///
/// # Safety
///
/// Same contract as [`Heap::free`].
pub unsafe fn free(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    let _ = with_heap(|heap| unsafe { heap.free(ptr) });
}

/// Switches the global placement policy.
pub fn set_policy(policy: PlacementPolicy) -> HeapResult<()> {
    with_heap(|heap| heap.set_policy(policy))
}

/// Current global placement policy.
pub fn policy() -> HeapResult<PlacementPolicy> {
    with_heap(Heap::policy)
}

/// Sets the global mmap threshold (floored at one page).
pub fn set_mmap_threshold(bytes: usize) -> HeapResult<()> {
    with_heap(|heap| heap.set_mmap_threshold(bytes))
}

/// Current global mmap threshold.
pub fn mmap_threshold() -> HeapResult<usize> {
    with_heap(Heap::mmap_threshold)
}

/// Per-arena snapshots of the global heap.
pub fn snapshots() -> HeapResult<Vec<ArenaSnapshot>> {
    with_heap(Heap::snapshots)
}

/// Aggregated statistics of the global heap.
pub fn stats() -> HeapResult<HeapStatsSnapshot> {
    with_heap(Heap::aggregate_stats)
}

/// Renders the global heap's per-arena report.
pub fn dump() -> HeapResult<String> {
    with_heap(|heap| {
        let mut out = String::new();
        let _ = heap.dump(&mut out);
        out
    })
}
