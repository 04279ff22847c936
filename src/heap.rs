//! The heap engine: cross-arena allocation, resize, free, growth, and
//! reclamation.
//!
//! A [`Heap`] is a complete allocator. It owns the arena list and break
//! pool behind one mutex and the runtime policy/threshold behind another.
//! Multiple heaps can coexist; the process-global façade in [`crate::api`]
//! wraps one of them.

use std::fmt;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::arena::{
    self, Arena, ArenaList, ArenaSnapshot, DestroyOutcome, HeapStatsSnapshot, ARENA_HEADER_SIZE,
    ARENA_MIN_SIZE,
};
use crate::block::{self, BlockHeader, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_MIN_SIZE};
use crate::config::{HeapConfig, RuntimeConfig, ALIGNMENT, MIN_MMAP_THRESHOLD};
use crate::error::{BlockIntegrityError, HeapError, HeapResult};
use crate::platform::unmap_region;
use crate::policy::{self, PlacementPolicy};
use crate::utils::align_up;

/// Requests past this cannot be laid out on the platform; alignment
/// rounding would wrap.
const MAX_REQUEST_SIZE: usize = isize::MAX as usize - (ALIGNMENT - 1);

/// An arena-based allocator with malloc/free/realloc/calloc semantics.
///
/// Payload pointers returned by [`allocate`](Self::allocate) are
/// [`ALIGNMENT`]-aligned and remain valid until passed to
/// [`free`](Self::free) or relocated by [`resize`](Self::resize).
pub struct Heap {
    /// Arena list and break pool. Held across any traversal or mutation
    /// of the list and for as long as an arena pointer is dereferenced;
    /// arenas are unlinked and unmapped only under it.
    arenas: Mutex<ArenaList>,
    /// Placement policy and mmap threshold.
    config: Mutex<RuntimeConfig>,
}

// SAFETY: the raw pointers inside `arenas` are only dereferenced while the
// list mutex is held, and only that mutex's holder can unlink or unmap an
// arena, so no operation can observe a dangling arena. Intra-arena state
// is additionally serialized by the per-arena locks, always acquired with
// the list mutex already held.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Builds a heap and creates its first arena.
    ///
    /// The arena size is clamped up to [`ARENA_MIN_SIZE`]; the mmap
    /// threshold is floored at [`MIN_MMAP_THRESHOLD`].
    pub fn new(config: HeapConfig) -> HeapResult<Self> {
        let mut arena_size = config.arena_size;
        if arena_size < ARENA_MIN_SIZE {
            warn!(
                requested = arena_size,
                minimum = ARENA_MIN_SIZE,
                "arena size below minimum, clamping"
            );
            arena_size = ARENA_MIN_SIZE;
        }

        let heap = Self {
            arenas: Mutex::new(ArenaList::new(config.break_pool_capacity)),
            config: Mutex::new(RuntimeConfig::new(config.policy, config.mmap_threshold)),
        };

        let threshold = heap.config.lock().mmap_threshold;
        heap.arenas.lock().create(arena_size, threshold)?;

        debug!(arena_size, policy = %config.policy, "heap initialized");
        Ok(heap)
    }

    /// Builds a heap with the default configuration.
    pub fn with_defaults() -> HeapResult<Self> {
        Self::new(HeapConfig::default())
    }

    // ------------------------------------------------------------------
    // Allocation quartet
    // ------------------------------------------------------------------

    /// Allocates `size` bytes and returns an aligned payload pointer.
    ///
    /// Searches existing arenas in list order; when none has a fitting
    /// free block, grows the heap by one arena sized for the request.
    pub fn allocate(&self, size: usize) -> HeapResult<NonNull<u8>> {
        if size == 0 {
            return Err(HeapError::invalid_argument("zero-size allocation"));
        }
        if size > MAX_REQUEST_SIZE {
            return Err(HeapError::invalid_argument(
                "allocation size exceeds the platform maximum",
            ));
        }

        let aligned = align_up(size, ALIGNMENT);
        let (policy, threshold) = {
            let config = self.config.lock();
            (config.policy, config.mmap_threshold)
        };

        // The list mutex stays held for the whole walk: arena pointers are
        // only valid while nothing can unlink and unmap them, and every
        // path that destroys an arena takes this mutex first.
        let mut list = self.arenas.lock();

        for arena in list.arenas() {
            // SAFETY: the held list mutex keeps the arena alive; its
            // contents are touched under the per-arena lock inside the
            // callees.
            unsafe {
                if arena::find_free_block(arena.as_ptr(), aligned, policy).is_some() {
                    // The candidate is re-resolved by a fresh scan under
                    // the arena lock before anything is handed out.
                    if let Some(payload) = self.allocate_in(arena, aligned, size, policy) {
                        return Ok(payload);
                    }
                }
            }
        }

        // No arena could satisfy the request: grow by one arena sized for
        // it, then carve from the fresh covering block.
        let needed = (aligned + BLOCK_HEADER_SIZE + ARENA_HEADER_SIZE).max(ARENA_MIN_SIZE);
        let arena = list.create(needed, threshold)?;

        // SAFETY: as above.
        match unsafe { self.allocate_in(arena, aligned, size, policy) } {
            Some(payload) => Ok(payload),
            None => Err(HeapError::Exhausted { requested: size }),
        }
    }

    /// Allocates `count * size` bytes and zeroes the payload.
    ///
    /// Returns a diagnosed error when the multiplication overflows. On
    /// success the call is accounted as a zeroed allocation rather than a
    /// plain one.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> HeapResult<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| HeapError::size_overflow(count, size))?;

        let payload = self.allocate(total)?;

        // SAFETY: `payload` is a fresh allocation of at least `total`
        // writable bytes; the owning arena is resolved and touched under
        // the list mutex.
        unsafe {
            ptr::write_bytes(payload.as_ptr(), 0, total);

            if let Some(block) = block::header_of(payload.as_ptr()) {
                let arena_id = (*block.as_ptr()).arena_id;
                let list = self.arenas.lock();
                if let Some(owner) = list.find_by_id(arena_id) {
                    let _guard = arena::lock(owner.as_ptr());
                    let stats = &mut (*owner.as_ptr()).stats;
                    stats.alloc_calls = stats.alloc_calls.saturating_sub(1);
                    stats.zalloc_calls += 1;
                }
            }
        }

        Ok(payload)
    }

    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// A null `ptr` behaves as [`allocate`](Self::allocate); `size == 0`
    /// behaves as [`free`](Self::free) and reports an invalid-argument
    /// error (the façade's null). Shrinking happens in place, splitting
    /// off the tail when it forms a viable block; growing moves the
    /// payload. On failure to grow, the old pointer stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer from this heap, and
    /// must not be used again after a successful relocation.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> HeapResult<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr)? };
            return Err(HeapError::invalid_argument(
                "zero-size resize frees the allocation",
            ));
        }

        if size > MAX_REQUEST_SIZE {
            return Err(HeapError::invalid_argument(
                "allocation size exceeds the platform maximum",
            ));
        }

        let Some(block) = block::header_of(ptr) else {
            return Err(HeapError::invalid_argument("null payload pointer"));
        };

        // SAFETY: the list mutex is held while the header is validated and
        // the arena resolved, so neither can be unmapped underneath; the
        // caller vouches for the pointer's provenance.
        let copy_len = unsafe {
            let list = self.arenas.lock();

            block::validate(block.as_ptr()).map_err(|e| HeapError::corruption(ptr as usize, e))?;
            if (*block.as_ptr()).free != 0 {
                return Err(HeapError::corruption(
                    ptr as usize,
                    BlockIntegrityError::AlreadyFree,
                ));
            }

            let arena_id = (*block.as_ptr()).arena_id;
            let arena = list
                .find_by_id(arena_id)
                .ok_or_else(|| HeapError::foreign_pointer(ptr as usize, arena_id))?;

            let aligned = align_up(size, ALIGNMENT);
            let _guard = arena::lock(arena.as_ptr());
            (*arena.as_ptr()).stats.realloc_calls += 1;

            let old_size = (*block.as_ptr()).size;
            if old_size >= aligned {
                self.shrink_in_place(arena.as_ptr(), block, aligned, size);
                return Ok(NonNull::new_unchecked(ptr));
            }
            (*block.as_ptr()).requested_size.min(size)
        };

        // Grow path: no attempt to absorb a free successor in place;
        // allocate fresh, copy, release. The locks are dropped first
        // (`allocate` re-takes them); the old arena cannot be reclaimed
        // meanwhile because it still holds this allocated block.
        let new_payload = self.allocate(size)?;
        // SAFETY: the old payload stays live until freed below; the
        // regions cannot overlap, the new block came from a free block.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_payload.as_ptr(), copy_len);
            self.free(ptr)?;
        }
        Ok(new_payload)
    }

    /// Returns the allocation at `ptr` to its arena, coalescing with free
    /// neighbours and reclaiming the arena when it becomes one covering
    /// free block.
    ///
    /// Null is a no-op. Corrupt and foreign pointers are diagnosed and
    /// leave the heap untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer from this heap; it
    /// must not be used after this call.
    pub unsafe fn free(&self, ptr: *mut u8) -> HeapResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let Some(block) = block::header_of(ptr) else {
            return Ok(());
        };

        // SAFETY: the list mutex is held from validation through the
        // reclamation decision, so the block's arena cannot be unmapped
        // underneath; the caller vouches for the pointer's provenance.
        let region = unsafe {
            let mut list = self.arenas.lock();

            block::validate(block.as_ptr()).map_err(|e| HeapError::corruption(ptr as usize, e))?;
            if (*block.as_ptr()).free != 0 {
                return Err(HeapError::corruption(
                    ptr as usize,
                    BlockIntegrityError::AlreadyFree,
                ));
            }

            let arena_id = (*block.as_ptr()).arena_id;
            let arena = list
                .find_by_id(arena_id)
                .ok_or_else(|| HeapError::foreign_pointer(ptr as usize, arena_id))?;

            let reclaim = {
                let _guard = arena::lock(arena.as_ptr());

                let freed_size = (*block.as_ptr()).size;
                let requested = (*block.as_ptr()).requested_size;

                let stats = &mut (*arena.as_ptr()).stats;
                stats.free_calls += 1;
                stats.used_bytes -= freed_size;
                stats.free_bytes += freed_size;
                stats.allocated_block_count -= 1;
                stats.free_block_count += 1;
                stats.wasted_bytes -= freed_size - requested;

                (*block.as_ptr()).free = 1;
                (*block.as_ptr()).requested_size = 0;

                let (merged, absorbed) = block::coalesce(arena.as_ptr(), block);

                // Every absorbed header turns back into free payload.
                let stats = &mut (*arena.as_ptr()).stats;
                stats.free_bytes += absorbed * BLOCK_HEADER_SIZE;
                stats.free_block_count -= absorbed;

                let merged_size = (*merged.as_ptr()).size;
                if merged_size > stats.largest_free_block {
                    stats.largest_free_block = merged_size;
                }

                (*arena.as_ptr()).block_count == 1
                    && (*arena.as_ptr()).free_list_head == Some(merged)
                    && (*merged.as_ptr()).phys_prev.is_none()
                    && (*merged.as_ptr()).phys_next.is_none()
                    && merged_size + BLOCK_HEADER_SIZE
                        == (*arena.as_ptr()).size - ARENA_HEADER_SIZE
            };

            if reclaim {
                match list.destroy(arena) {
                    DestroyOutcome::Unmapped { addr, len } => Some((addr, len)),
                    DestroyOutcome::Retracted | DestroyOutcome::Cleared => None,
                }
            } else {
                None
            }
        };

        // The mapping is returned to the OS after the list mutex is
        // released; the arena is already unlinked.
        if let Some((addr, len)) = region {
            if let Err(source) = unmap_region(addr, len) {
                warn!(%source, "arena unmap failed");
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Policy and threshold control
    // ------------------------------------------------------------------

    /// Current placement policy.
    pub fn policy(&self) -> PlacementPolicy {
        self.config.lock().policy
    }

    /// Switches the placement policy for subsequent allocations.
    pub fn set_policy(&self, policy: PlacementPolicy) {
        self.config.lock().policy = policy;
    }

    /// Current mmap threshold in bytes.
    pub fn mmap_threshold(&self) -> usize {
        self.config.lock().mmap_threshold
    }

    /// Sets the mmap threshold, floored at [`MIN_MMAP_THRESHOLD`].
    pub fn set_mmap_threshold(&self, bytes: usize) {
        let floored = bytes.max(MIN_MMAP_THRESHOLD);
        if floored != bytes {
            warn!(bytes, floored, "mmap threshold below one page, flooring");
        }
        self.config.lock().mmap_threshold = floored;
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Consistent snapshots of every arena, in list order.
    pub fn snapshots(&self) -> Vec<ArenaSnapshot> {
        let list = self.arenas.lock();
        list.arenas()
            .into_iter()
            // SAFETY: the list mutex is held, so no arena can be destroyed
            // while it is being snapshotted.
            .map(|arena| unsafe { arena::snapshot(arena.as_ptr()) })
            .collect()
    }

    /// Heap-wide statistics summed over all arenas.
    pub fn aggregate_stats(&self) -> HeapStatsSnapshot {
        let mut total = HeapStatsSnapshot::default();
        for snapshot in self.snapshots() {
            total.accumulate(&snapshot);
        }
        total
    }

    /// Writes a per-arena report (state, statistics, free-list walk).
    pub fn dump<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for snapshot in self.snapshots() {
            write!(out, "{snapshot}")?;
        }
        Ok(())
    }

    /// Destroys every arena and releases the break pool.
    ///
    /// All outstanding payload pointers become invalid. The heap remains
    /// usable: the next allocation grows a fresh arena.
    pub fn finalize(&self) {
        let regions = self.arenas.lock().drain_all();
        for (addr, len) in regions {
            if let Err(source) = unmap_region(addr, len) {
                warn!(%source, "arena unmap failed during finalize");
            }
        }
        debug!("heap finalized");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Carves an allocation out of one arena under its lock: policy scan,
    /// split or whole-block handoff, statistics.
    ///
    /// Returns `None` when the scan under the lock finds no fitting free
    /// block.
    ///
    /// # Safety
    ///
    /// The caller holds the list mutex (keeping `arena` alive) and must
    /// not hold the arena's own lock.
    unsafe fn allocate_in(
        &self,
        arena: NonNull<Arena>,
        aligned: usize,
        requested: usize,
        policy: PlacementPolicy,
    ) -> Option<NonNull<u8>> {
        let arena = arena.as_ptr();
        // SAFETY: lock held for the whole carve; all block pointers stay
        // inside this arena.
        unsafe {
            let _guard = arena::lock(arena);

            let candidate = policy::find_candidate(arena, aligned, policy)?;
            if policy == PlacementPolicy::NextFit {
                policy::advance_next_fit_cursor(arena, candidate);
            }

            let (chosen, was_split) = match block::split(arena, candidate, aligned) {
                Some(leading) => (leading, true),
                None => {
                    // Remainder would be below a minimum block: hand the
                    // whole block out.
                    block::remove_from_free_list(arena, candidate);
                    (candidate, false)
                }
            };

            (*chosen.as_ptr()).free = 0;
            (*chosen.as_ptr()).requested_size = requested;
            (*chosen.as_ptr()).magic = BLOCK_MAGIC;

            let chosen_size = (*chosen.as_ptr()).size;
            let stats = &mut (*arena).stats;
            stats.alloc_calls += 1;
            stats.used_bytes += chosen_size;
            stats.allocated_block_count += 1;
            stats.wasted_bytes += chosen_size - requested;
            if was_split {
                // The remainder's header came out of free payload.
                stats.free_bytes -= chosen_size + BLOCK_HEADER_SIZE;
            } else {
                stats.free_bytes -= chosen_size;
                stats.free_block_count -= 1;
            }

            Some(block::payload_of(chosen))
        }
    }

    /// Shrinks an allocated block in place, releasing the tail when it
    /// forms a viable free block. Caller holds the arena lock.
    ///
    /// # Safety
    ///
    /// `arena` is live and locked by the caller; `block` is an allocated
    /// block of that arena; `aligned >= MIN_PAYLOAD_SIZE` and
    /// `block.size >= aligned`.
    unsafe fn shrink_in_place(
        &self,
        arena: *mut Arena,
        block: NonNull<BlockHeader>,
        aligned: usize,
        requested: usize,
    ) {
        // SAFETY: exclusive access under the held arena lock.
        unsafe {
            let old_size = (*block.as_ptr()).size;
            let old_requested = (*block.as_ptr()).requested_size;

            if old_size >= aligned + BLOCK_MIN_SIZE {
                if block::split(arena, block, aligned).is_some() {
                    let remainder = (*block.as_ptr())
                        .phys_next
                        .expect("split produced a remainder");
                    let remainder_size = (*remainder.as_ptr()).size;

                    let stats = &mut (*arena).stats;
                    stats.used_bytes -= old_size - aligned;
                    stats.free_bytes += remainder_size;
                    stats.free_block_count += 1;

                    // The tail may touch a free successor; merge so no two
                    // adjacent free blocks survive the shrink.
                    let (merged, absorbed) = block::coalesce(arena, remainder);

                    let stats = &mut (*arena).stats;
                    stats.free_bytes += absorbed * BLOCK_HEADER_SIZE;
                    stats.free_block_count -= absorbed;
                    let merged_size = (*merged.as_ptr()).size;
                    if merged_size > stats.largest_free_block {
                        stats.largest_free_block = merged_size;
                    }

                    stats.wasted_bytes -= old_size - old_requested;
                    stats.wasted_bytes += aligned - requested;
                } else {
                    debug_assert!(false, "split precondition was checked");
                }
            } else {
                // Tail too small to stand alone: keep the block size,
                // re-account the internal fragmentation once.
                let stats = &mut (*arena).stats;
                stats.wasted_bytes -= old_size - old_requested;
                stats.wasted_bytes += old_size - requested;
            }

            (*block.as_ptr()).requested_size = requested;
        }
    }

}

impl Drop for Heap {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.aggregate_stats();
        f.debug_struct("Heap")
            .field("arenas", &stats.arena_count)
            .field("policy", &self.policy())
            .field("used_bytes", &stats.used_bytes)
            .field("free_bytes", &stats.free_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        // Pool-backed single page arena keeps these tests inside one
        // arena.
        Heap::new(
            HeapConfig::new()
                .with_arena_size(4096)
                .with_mmap_threshold(1 << 20),
        )
        .expect("heap")
    }

    #[test]
    fn allocate_in_respects_split_threshold() {
        let heap = small_heap();
        let first = heap.allocate(64).expect("first allocation");

        let snapshots = heap.snapshots();
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.blocks[0].size, 64);
        assert!(!snapshot.blocks[0].free);
        assert!(snapshot.blocks[1].free);

        // SAFETY: pointer just allocated from this heap.
        unsafe { heap.free(first.as_ptr()).expect("free") };
    }

    #[test]
    fn whole_block_handoff_when_remainder_is_too_small() {
        let heap = small_heap();
        let snapshots = heap.snapshots();
        let snapshot = &snapshots[0];
        let covering = snapshot.stats.largest_free_block;

        // One byte over the split refusal line: the whole block is handed
        // out and the arena has no free space left.
        let size = covering - BLOCK_MIN_SIZE + 1;
        let ptr = heap.allocate(size).expect("near-covering allocation");

        let snapshots = heap.snapshots();
        let snapshot = &snapshots[0];
        assert_eq!(snapshot.stats.free_block_count, 0);
        assert_eq!(snapshot.stats.free_bytes, 0);
        assert_eq!(snapshot.blocks.len(), 1);
        assert_eq!(snapshot.blocks[0].size, covering);

        // SAFETY: pointer just allocated from this heap.
        unsafe { heap.free(ptr.as_ptr()).expect("free") };
    }

    #[test]
    fn debug_format_is_cheap_and_total() {
        let heap = small_heap();
        let text = format!("{heap:?}");
        assert!(text.contains("Heap"));
        assert!(text.contains("policy"));
    }
}
