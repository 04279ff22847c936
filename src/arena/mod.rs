//! Arenas: contiguous OS-backed regions, each an independent heap with its
//! own free list, lock, and statistics.
//!
//! An [`Arena`] header lives in place at the start of its region, followed
//! by alignment padding and the block area. Arenas form a singly linked
//! list owned by [`ArenaList`], which also owns the break pool and the
//! monotonic id counter; the heap guards the whole list behind one mutex.
//!
//! # Safety
//!
//! Arena headers are reached through raw pointers. The rule throughout:
//! intra-arena state (free list, cursor, statistics, block headers) is
//! touched only while holding that arena's in-place lock; list structure
//! (`next` links, creation, destruction) only while holding the heap's
//! list mutex.

mod stats;

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::RawMutex;
use tracing::{debug, error};

pub use stats::{ArenaSnapshot, ArenaStatsSnapshot, BlockInfo, FreeBlockInfo, HeapStatsSnapshot};

pub(crate) use stats::ArenaStats;

use crate::block::{self, BlockHeader, BLOCK_MIN_SIZE};
use crate::config::ALIGNMENT;
use crate::error::{HeapError, HeapResult};
use crate::platform::{map_region, page_size, unmap_region, BreakPool};
use crate::policy::{self, PlacementPolicy};
use crate::utils::{align_down, align_up};

/// Size of the in-place arena header, rounded up to [`ALIGNMENT`].
pub const ARENA_HEADER_SIZE: usize = align_up(core::mem::size_of::<Arena>(), ALIGNMENT);

/// Smallest region that can hold an arena header, one minimum block, and
/// worst-case alignment padding.
pub const ARENA_MIN_SIZE: usize = ARENA_HEADER_SIZE + BLOCK_MIN_SIZE + (ALIGNMENT - 1);

/// How an arena's region was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArenaBacking {
    /// Carved from the break pool (requests below the mmap threshold).
    Pooled = 0,
    /// Owns a dedicated page mapping.
    Mapped = 1,
}

/// In-place arena header.
#[repr(C)]
pub(crate) struct Arena {
    pub(crate) id: u64,
    pub(crate) start: *mut u8,
    pub(crate) end: *mut u8,
    /// Total region size, header included.
    pub(crate) size: usize,
    /// The size originally asked of `create`; kept for debugging only.
    pub(crate) requested_size: usize,
    pub(crate) backing: ArenaBacking,
    /// Guards the free list, cursor, block headers, and statistics.
    /// Const-initializable and needs no teardown, which an in-place
    /// header requires.
    pub(crate) lock: RawMutex,
    /// Free list head, ascending address order.
    pub(crate) free_list_head: Option<NonNull<BlockHeader>>,
    /// Last free block inspected by next-fit.
    pub(crate) next_fit_cursor: Option<NonNull<BlockHeader>>,
    /// Number of blocks on the physical chain.
    pub(crate) block_count: usize,
    pub(crate) stats: ArenaStats,
    /// Next arena on the global list.
    pub(crate) next: Option<NonNull<Arena>>,
}

/// RAII guard for an arena's in-place lock.
pub(crate) struct ArenaGuard<'a> {
    raw: &'a RawMutex,
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard is only constructed by `lock`, which acquired
        // this mutex on the current thread.
        unsafe { self.raw.unlock() };
    }
}

/// Acquires an arena's lock.
///
/// # Safety
///
/// `arena` must point at a live arena header that outlives the guard.
pub(crate) unsafe fn lock<'a>(arena: *mut Arena) -> ArenaGuard<'a> {
    // SAFETY: only the lock field is borrowed; all other access to the
    // arena goes through raw pointers, so no aliasing reference is formed.
    let raw = unsafe { &(*arena).lock };
    raw.lock();
    ArenaGuard { raw }
}

/// Lays an arena header and one covering free block into `addr`.
///
/// Returns `None` (with a diagnostic) when the region cannot hold the
/// header plus a minimum block.
///
/// # Safety
///
/// `addr` must point at `size` writable bytes aligned to [`ALIGNMENT`],
/// exclusively owned by the caller.
pub(crate) unsafe fn init(
    addr: *mut u8,
    size: usize,
    backing: ArenaBacking,
    id: u64,
) -> Option<NonNull<Arena>> {
    if addr.is_null() {
        return None;
    }

    let raw = addr as usize + ARENA_HEADER_SIZE;
    let aligned = align_up(raw, ALIGNMENT);
    let overhead = aligned - addr as usize;

    if size < overhead + BLOCK_MIN_SIZE {
        error!(size, overhead, "arena region too small to initialize");
        return None;
    }

    let arena = addr.cast::<Arena>();
    // SAFETY: addr is exclusively owned, writable for `size` bytes, and
    // the first-block layout was bounds-checked above.
    unsafe {
        ptr::write(
            arena,
            Arena {
                id,
                start: addr,
                end: addr.add(size),
                size,
                requested_size: 0,
                backing,
                lock: RawMutex::INIT,
                free_list_head: None,
                next_fit_cursor: None,
                block_count: 0,
                stats: ArenaStats::default(),
                next: None,
            },
        );

        let total_block = size - overhead;
        let usable = align_down(total_block, ALIGNMENT);
        let first = block::init(addr.add(overhead), usable)?;
        (*first.as_ptr()).arena_id = id;

        (*arena).free_list_head = Some(first);
        (*arena).next_fit_cursor = Some(first);
        (*arena).block_count = 1;

        let stats = &mut (*arena).stats;
        stats.total_bytes = size;
        stats.free_bytes = (*first.as_ptr()).size;
        stats.largest_free_block = (*first.as_ptr()).size;
        stats.free_block_count = 1;
    }

    NonNull::new(arena)
}

/// Resets an arena to a single covering free block, zeroing everything
/// after the header. The caller already holds the arena lock.
///
/// Used when a pooled arena cannot be returned because it is not at the
/// current break.
///
/// # Safety
///
/// `arena` is live and locked by the caller.
pub(crate) unsafe fn clear_locked(arena: *mut Arena) {
    // SAFETY: exclusive access under the held lock; all offsets stay
    // inside the arena region.
    unsafe {
        let start = (*arena).start;
        let size = (*arena).size;

        (*arena).free_list_head = None;
        (*arena).next_fit_cursor = None;
        (*arena).block_count = 0;
        (*arena).stats.reset();

        ptr::write_bytes(start.add(ARENA_HEADER_SIZE), 0, size - ARENA_HEADER_SIZE);

        let raw = start as usize + ARENA_HEADER_SIZE;
        let overhead = align_up(raw, ALIGNMENT) - start as usize;
        let usable = align_down(size - overhead, ALIGNMENT);

        if let Some(first) = block::init(start.add(overhead), usable) {
            (*first.as_ptr()).arena_id = (*arena).id;
            (*arena).free_list_head = Some(first);
            (*arena).next_fit_cursor = Some(first);
            (*arena).block_count = 1;

            let stats = &mut (*arena).stats;
            stats.total_bytes = size;
            stats.free_bytes = (*first.as_ptr()).size;
            stats.largest_free_block = (*first.as_ptr()).size;
            stats.free_block_count = 1;
        }

        debug!(id = (*arena).id, "arena cleared");
    }
}

/// Acquires the arena lock and scans its free list for a candidate.
///
/// # Safety
///
/// `arena` is live; the caller must not already hold its lock.
pub(crate) unsafe fn find_free_block(
    arena: *mut Arena,
    payload_size: usize,
    policy: PlacementPolicy,
) -> Option<NonNull<BlockHeader>> {
    // SAFETY: lock held for the duration of the scan.
    unsafe {
        let _guard = lock(arena);
        policy::find_candidate(arena, payload_size, policy)
    }
}

/// Takes a consistent snapshot of one arena under its lock.
///
/// # Safety
///
/// `arena` is live; the caller must not already hold its lock.
pub(crate) unsafe fn snapshot(arena: *mut Arena) -> ArenaSnapshot {
    // SAFETY: lock held; chain and list links stay inside the region.
    unsafe {
        let _guard = lock(arena);

        let start_ptr = (*arena).start;
        let start = start_ptr as usize;
        let first_block = align_up(start + ARENA_HEADER_SIZE, ALIGNMENT);

        let mut blocks = Vec::with_capacity((*arena).block_count);
        let mut cursor = if (*arena).block_count > 0 {
            Some(NonNull::new_unchecked(
                start_ptr.add(first_block - start).cast::<BlockHeader>(),
            ))
        } else {
            None
        };
        while let Some(cur) = cursor {
            blocks.push(BlockInfo {
                addr: cur.as_ptr() as usize,
                size: (*cur.as_ptr()).size,
                requested_size: (*cur.as_ptr()).requested_size,
                free: (*cur.as_ptr()).free == 1,
            });
            cursor = (*cur.as_ptr()).phys_next;
        }

        let mut free_blocks = Vec::new();
        let mut largest = 0usize;
        let mut cursor = (*arena).free_list_head;
        while let Some(cur) = cursor {
            let size = (*cur.as_ptr()).size;
            largest = largest.max(size);
            free_blocks.push(FreeBlockInfo {
                addr: cur.as_ptr() as usize,
                size,
            });
            cursor = (*cur.as_ptr()).next;
        }

        let live = (*arena).stats;
        ArenaSnapshot {
            id: (*arena).id,
            backing: (*arena).backing,
            start,
            end: (*arena).end as usize,
            size: (*arena).size,
            first_block,
            block_count: (*arena).block_count,
            stats: ArenaStatsSnapshot {
                total_bytes: live.total_bytes,
                used_bytes: live.used_bytes,
                free_bytes: live.free_bytes,
                largest_free_block: largest,
                free_block_count: live.free_block_count,
                allocated_block_count: live.allocated_block_count,
                wasted_bytes: live.wasted_bytes,
                alloc_calls: live.alloc_calls,
                free_calls: live.free_calls,
                realloc_calls: live.realloc_calls,
                zalloc_calls: live.zalloc_calls,
            },
            blocks,
            free_blocks,
        }
    }
}

/// What `ArenaList::destroy` did, and what remains for the caller.
pub(crate) enum DestroyOutcome {
    /// Arena unlinked; the caller unmaps the region after releasing the
    /// list lock.
    Unmapped { addr: *mut u8, len: usize },
    /// Arena unlinked and its region returned to the break pool.
    Retracted,
    /// Arena could not be released (not at the break); it was cleared in
    /// place and stays on the list.
    Cleared,
}

/// Arena ids are process-unique so a pointer freed into the wrong heap is
/// caught as foreign instead of matching an unrelated arena.
static ARENA_IDS: AtomicU64 = AtomicU64::new(1);

/// The global arena list: head pointer and the break pool.
///
/// Owned by the heap behind a single mutex; every method here assumes that
/// mutex is held.
pub(crate) struct ArenaList {
    pub(crate) head: Option<NonNull<Arena>>,
    pool: BreakPool,
}

// SAFETY: the raw arena pointers are only dereferenced under the heap's
// list mutex (list structure) or the per-arena locks (contents).
unsafe impl Send for ArenaList {}

impl ArenaList {
    pub(crate) fn new(pool_capacity: usize) -> Self {
        Self {
            head: None,
            pool: BreakPool::new(pool_capacity),
        }
    }

    /// Arenas in list order (most recently created first).
    pub(crate) fn arenas(&self) -> Vec<NonNull<Arena>> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(arena) = cursor {
            out.push(arena);
            // SAFETY: list links are maintained under the list mutex the
            // caller holds.
            cursor = unsafe { (*arena.as_ptr()).next };
        }
        out
    }

    /// Finds an arena by id.
    pub(crate) fn find_by_id(&self, id: u64) -> Option<NonNull<Arena>> {
        let mut cursor = self.head;
        while let Some(arena) = cursor {
            // SAFETY: as in `arenas`.
            unsafe {
                if (*arena.as_ptr()).id == id {
                    return Some(arena);
                }
                cursor = (*arena.as_ptr()).next;
            }
        }
        None
    }

    /// Creates an arena for `requested` bytes and prepends it to the list.
    ///
    /// The region size is `requested` rounded up to the page size.
    /// Requests at or above `mmap_threshold` get a dedicated mapping;
    /// smaller ones are carved from the break pool.
    pub(crate) fn create(
        &mut self,
        requested: usize,
        mmap_threshold: usize,
    ) -> HeapResult<NonNull<Arena>> {
        let page = page_size();
        let mut alloc_size = align_up(requested, page);

        let (addr, backing) = if requested >= mmap_threshold {
            let addr = map_region(alloc_size).map_err(|e| HeapError::os_failure("arena map", e))?;
            (addr, ArenaBacking::Mapped)
        } else {
            if alloc_size < ARENA_MIN_SIZE {
                alloc_size = align_up(ARENA_MIN_SIZE, page);
            }
            let addr = self.pool.extend(alloc_size)?;
            (addr, ArenaBacking::Pooled)
        };

        let id = ARENA_IDS.fetch_add(1, Ordering::Relaxed);
        // SAFETY: addr is a fresh page-aligned region of alloc_size bytes,
        // exclusively ours.
        let Some(arena) = (unsafe { init(addr, alloc_size, backing, id) }) else {
            match backing {
                ArenaBacking::Mapped => {
                    let _ = unmap_region(addr, alloc_size);
                }
                ArenaBacking::Pooled => self.pool.retract(alloc_size),
            }
            return Err(HeapError::invalid_argument(
                "arena region below the minimum viable size",
            ));
        };

        // SAFETY: the new arena is not yet visible to any other thread.
        unsafe {
            (*arena.as_ptr()).requested_size = requested;
            (*arena.as_ptr()).next = self.head;
        }
        self.head = Some(arena);

        debug!(id, size = alloc_size, ?backing, "arena created");
        Ok(arena)
    }

    fn unlink(&mut self, arena: NonNull<Arena>) {
        // SAFETY: list links maintained under the list mutex.
        unsafe {
            if self.head == Some(arena) {
                self.head = (*arena.as_ptr()).next;
                return;
            }
            let mut cursor = self.head;
            while let Some(cur) = cursor {
                if (*cur.as_ptr()).next == Some(arena) {
                    (*cur.as_ptr()).next = (*arena.as_ptr()).next;
                    return;
                }
                cursor = (*cur.as_ptr()).next;
            }
        }
    }

    /// Destroys one arena, or clears it when its region cannot be
    /// returned.
    pub(crate) fn destroy(&mut self, arena: NonNull<Arena>) -> DestroyOutcome {
        // SAFETY: list mutex held by the caller; the arena is live.
        unsafe {
            let id = (*arena.as_ptr()).id;
            let size = (*arena.as_ptr()).size;

            match (*arena.as_ptr()).backing {
                ArenaBacking::Mapped => {
                    self.unlink(arena);
                    debug!(id, size, "arena destroyed (unmapping)");
                    DestroyOutcome::Unmapped {
                        addr: (*arena.as_ptr()).start,
                        len: size,
                    }
                }
                ArenaBacking::Pooled => {
                    if (*arena.as_ptr()).end == self.pool.break_top() {
                        self.unlink(arena);
                        self.pool.retract(size);
                        debug!(id, size, "arena destroyed (break retracted)");
                        DestroyOutcome::Retracted
                    } else {
                        let _guard = lock(arena.as_ptr());
                        clear_locked(arena.as_ptr());
                        DestroyOutcome::Cleared
                    }
                }
            }
        }
    }

    /// Tears down every arena: pooled regions go with the break pool,
    /// mapped regions are returned for the caller to unmap after the list
    /// lock is released.
    pub(crate) fn drain_all(&mut self) -> Vec<(*mut u8, usize)> {
        let mut regions = Vec::new();
        let mut cursor = self.head;
        while let Some(arena) = cursor {
            // SAFETY: list mutex held; arenas stay valid until their
            // backing is released, which happens after this walk.
            unsafe {
                cursor = (*arena.as_ptr()).next;
                if (*arena.as_ptr()).backing == ArenaBacking::Mapped {
                    regions.push(((*arena.as_ptr()).start, (*arena.as_ptr()).size));
                }
            }
        }
        self.head = None;
        self.pool.release();
        regions
    }

}
