//! Block manager: in-place headers, the address-ordered free list, split,
//! coalesce, and sentinel validation.
//!
//! Every block is a [`BlockHeader`] written directly into arena memory,
//! followed by its payload. Two intrusive doubly linked lists run through
//! the headers: the free list (`next`/`prev`, free blocks only, ascending
//! address order) and the physical chain (`phys_prev`/`phys_next`, every
//! block, address order). All pointer arithmetic between headers and
//! payloads lives in this module.
//!
//! # Safety
//!
//! Functions taking raw arena or block pointers require that the pointers
//! come from a live arena and that the caller holds that arena's lock.
//! Field access goes through raw pointers so no long-lived references are
//! formed over memory that other blocks alias.

use std::ptr::{self, NonNull};

use tracing::trace;

use crate::arena::Arena;
use crate::config::{ALIGNMENT, MIN_PAYLOAD_SIZE};
use crate::error::BlockIntegrityError;
use crate::utils::{align_up, is_aligned};

/// Sentinel stored in every block header.
pub const BLOCK_MAGIC: u32 = 0x00C0_FFEE;

/// Size of the in-place block header, rounded up to [`ALIGNMENT`] so the
/// payload that follows it is aligned too.
pub const BLOCK_HEADER_SIZE: usize = align_up(core::mem::size_of::<BlockHeader>(), ALIGNMENT);

/// Smallest viable block: a header plus the minimum payload.
pub const BLOCK_MIN_SIZE: usize = BLOCK_HEADER_SIZE + MIN_PAYLOAD_SIZE;

/// In-place header preceding every payload.
#[repr(C)]
pub struct BlockHeader {
    /// Payload capacity in bytes, excluding the header. Always a multiple
    /// of [`ALIGNMENT`].
    pub(crate) size: usize,
    /// The caller's original request; 0 while the block is free. The gap
    /// between `size` and `requested_size` is internal fragmentation.
    pub(crate) requested_size: usize,
    /// 1 = on the free list, 0 = handed to a caller. Stored wide so a
    /// corrupted flag is detectable instead of undefined.
    pub(crate) free: u32,
    /// [`BLOCK_MAGIC`] while the header is intact.
    pub(crate) magic: u32,
    /// Id of the owning arena.
    pub(crate) arena_id: u64,
    /// Free-list links; `None` for allocated blocks.
    pub(crate) next: Option<NonNull<BlockHeader>>,
    pub(crate) prev: Option<NonNull<BlockHeader>>,
    /// Physical-neighbour links, maintained regardless of free state.
    pub(crate) phys_prev: Option<NonNull<BlockHeader>>,
    pub(crate) phys_next: Option<NonNull<BlockHeader>>,
}

/// Returns the payload address of a block.
#[inline]
pub(crate) fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: the payload begins immediately after the header inside the
    // same allocation, so the offset stays in bounds and non-null.
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_HEADER_SIZE)) }
}

/// Recovers the header address from a payload pointer.
///
/// Uses wrapping arithmetic so an arbitrary caller-supplied pointer cannot
/// trip provenance checks before validation gets a chance to reject it.
#[inline]
pub(crate) fn header_of(payload: *mut u8) -> Option<NonNull<BlockHeader>> {
    if payload.is_null() {
        return None;
    }
    NonNull::new(payload.wrapping_sub(BLOCK_HEADER_SIZE).cast::<BlockHeader>())
}

/// Writes a single free block covering `total_size` bytes at `addr`.
///
/// The caller assigns `arena_id` afterwards. Returns `None` when the
/// region cannot hold a minimum block.
///
/// # Safety
///
/// `addr` must point at `total_size` writable bytes aligned to
/// [`ALIGNMENT`].
pub(crate) unsafe fn init(addr: *mut u8, total_size: usize) -> Option<NonNull<BlockHeader>> {
    if addr.is_null() || total_size < BLOCK_MIN_SIZE {
        return None;
    }
    debug_assert!(is_aligned(addr as usize, ALIGNMENT));

    let header = addr.cast::<BlockHeader>();
    // SAFETY: per the contract, addr points at enough writable bytes for a
    // header and is properly aligned.
    unsafe {
        ptr::write(
            header,
            BlockHeader {
                size: total_size - BLOCK_HEADER_SIZE,
                requested_size: 0,
                free: 1,
                magic: BLOCK_MAGIC,
                arena_id: 0,
                next: None,
                prev: None,
                phys_prev: None,
                phys_next: None,
            },
        );
    }
    NonNull::new(header)
}

/// Checks whether `block` is reachable from the arena's free-list head.
///
/// # Safety
///
/// Caller holds the arena lock; `arena` and `block` are live.
pub(crate) unsafe fn is_on_free_list(arena: *const Arena, block: NonNull<BlockHeader>) -> bool {
    // SAFETY: list links only ever point at live headers of this arena.
    unsafe {
        if (*block.as_ptr()).free != 1 {
            return false;
        }
        let mut current = (*arena).free_list_head;
        while let Some(cur) = current {
            if cur == block {
                return true;
            }
            current = (*cur.as_ptr()).next;
        }
        false
    }
}

/// Inserts `block` into the free list in ascending address order.
///
/// Re-inserting a block that is already listed is a no-op. Marks the block
/// free and stamps the owning arena's id.
///
/// # Safety
///
/// Caller holds the arena lock; `arena` and `block` are live and `block`
/// belongs to `arena`'s region.
pub(crate) unsafe fn add_to_free_list(arena: *mut Arena, block: NonNull<BlockHeader>) {
    // SAFETY: exclusive access under the arena lock; all touched headers
    // belong to this arena.
    unsafe {
        if is_on_free_list(arena, block) {
            return;
        }

        (*block.as_ptr()).free = 1;
        (*block.as_ptr()).requested_size = 0;
        (*block.as_ptr()).arena_id = (*arena).id;

        let mut prev: Option<NonNull<BlockHeader>> = None;
        let mut current = (*arena).free_list_head;
        while let Some(cur) = current {
            if cur.as_ptr() as usize >= block.as_ptr() as usize {
                break;
            }
            prev = Some(cur);
            current = (*cur.as_ptr()).next;
        }

        (*block.as_ptr()).next = current;
        (*block.as_ptr()).prev = prev;

        if let Some(cur) = current {
            (*cur.as_ptr()).prev = Some(block);
        }
        match prev {
            Some(p) => (*p.as_ptr()).next = Some(block),
            None => (*arena).free_list_head = Some(block),
        }
    }
}

/// Unlinks `block` from the free list; no-op when it is not listed.
///
/// If the next-fit cursor referenced the removed block it moves to the
/// list head.
///
/// # Safety
///
/// Caller holds the arena lock; `arena` and `block` are live.
pub(crate) unsafe fn remove_from_free_list(arena: *mut Arena, block: NonNull<BlockHeader>) {
    // SAFETY: exclusive access under the arena lock.
    unsafe {
        if !is_on_free_list(arena, block) {
            return;
        }

        match (*block.as_ptr()).prev {
            Some(p) => (*p.as_ptr()).next = (*block.as_ptr()).next,
            None => (*arena).free_list_head = (*block.as_ptr()).next,
        }
        if let Some(n) = (*block.as_ptr()).next {
            (*n.as_ptr()).prev = (*block.as_ptr()).prev;
        }

        if (*arena).next_fit_cursor == Some(block) {
            (*arena).next_fit_cursor = (*arena).free_list_head;
        }

        (*block.as_ptr()).next = None;
        (*block.as_ptr()).prev = None;
    }
}

/// Splits `block` into a leading allocated part of exactly
/// `aligned_payload` bytes and a trailing free remainder.
///
/// Refuses (returning `None`, block untouched) unless the remainder would
/// be at least a minimum block; the caller then hands out the whole block.
/// On success the leading block is returned marked allocated, and the
/// remainder is spliced into the physical chain and the free list.
///
/// # Safety
///
/// Caller holds the arena lock; `aligned_payload` is `ALIGNMENT`-rounded.
pub(crate) unsafe fn split(
    arena: *mut Arena,
    block: NonNull<BlockHeader>,
    aligned_payload: usize,
) -> Option<NonNull<BlockHeader>> {
    debug_assert!(is_aligned(aligned_payload, ALIGNMENT));

    // SAFETY: exclusive access under the arena lock; remainder address
    // stays inside the block being split.
    unsafe {
        let old_size = (*block.as_ptr()).size;
        if old_size < aligned_payload + BLOCK_MIN_SIZE {
            return None;
        }

        if (*block.as_ptr()).free == 1 {
            remove_from_free_list(arena, block);
        }

        let remainder_addr = block
            .as_ptr()
            .cast::<u8>()
            .add(BLOCK_HEADER_SIZE + aligned_payload);
        let remainder = remainder_addr.cast::<BlockHeader>();
        ptr::write(
            remainder,
            BlockHeader {
                size: old_size - aligned_payload - BLOCK_HEADER_SIZE,
                requested_size: 0,
                free: 1,
                magic: BLOCK_MAGIC,
                arena_id: (*block.as_ptr()).arena_id,
                next: None,
                prev: None,
                phys_prev: Some(block),
                phys_next: (*block.as_ptr()).phys_next,
            },
        );
        let remainder = NonNull::new_unchecked(remainder);

        if let Some(pn) = (*remainder.as_ptr()).phys_next {
            (*pn.as_ptr()).phys_prev = Some(remainder);
        }

        (*block.as_ptr()).size = aligned_payload;
        (*block.as_ptr()).free = 0;
        (*block.as_ptr()).phys_next = Some(remainder);

        add_to_free_list(arena, remainder);
        (*arena).block_count += 1;

        trace!(
            block = block.as_ptr() as usize,
            leading = aligned_payload,
            remainder = (*remainder.as_ptr()).size,
            "block split"
        );
    }
    Some(block)
}

/// Merges `block` with its free physical neighbours.
///
/// Absorbs into a free predecessor first (the predecessor becomes the
/// surviving block), then absorbs every free successor. Every participant
/// is taken off the free list before merging; the merged block is
/// reinserted once. Returns the surviving block and the number of headers
/// absorbed, so the caller can settle byte accounting.
///
/// # Safety
///
/// Caller holds the arena lock; `block` is live and marked free.
pub(crate) unsafe fn coalesce(
    arena: *mut Arena,
    block: NonNull<BlockHeader>,
) -> (NonNull<BlockHeader>, usize) {
    // SAFETY: exclusive access under the arena lock; physical links only
    // reference headers of this arena.
    unsafe {
        debug_assert_eq!((*block.as_ptr()).free, 1);

        let mut block = block;
        let mut absorbed = 0usize;

        if let Some(prev) = (*block.as_ptr()).phys_prev {
            if (*prev.as_ptr()).free == 1 {
                remove_from_free_list(arena, block);
                remove_from_free_list(arena, prev);

                (*prev.as_ptr()).size += BLOCK_HEADER_SIZE + (*block.as_ptr()).size;
                (*prev.as_ptr()).requested_size = 0;
                (*prev.as_ptr()).phys_next = (*block.as_ptr()).phys_next;
                if let Some(pn) = (*prev.as_ptr()).phys_next {
                    (*pn.as_ptr()).phys_prev = Some(prev);
                }

                (*arena).block_count -= 1;
                absorbed += 1;
                block = prev;
            }
        }

        loop {
            let Some(next) = (*block.as_ptr()).phys_next else {
                break;
            };
            if (*next.as_ptr()).free != 1 {
                break;
            }

            remove_from_free_list(arena, next);

            (*block.as_ptr()).size += BLOCK_HEADER_SIZE + (*next.as_ptr()).size;
            (*block.as_ptr()).requested_size = 0;
            (*block.as_ptr()).phys_next = (*next.as_ptr()).phys_next;
            if let Some(pn) = (*block.as_ptr()).phys_next {
                (*pn.as_ptr()).phys_prev = Some(block);
            }

            (*arena).block_count -= 1;
            absorbed += 1;
        }

        add_to_free_list(arena, block);

        if absorbed > 0 {
            trace!(
                merged = block.as_ptr() as usize,
                size = (*block.as_ptr()).size,
                absorbed,
                "blocks coalesced"
            );
        }

        (block, absorbed)
    }
}

/// Validates a block header against the sentinel scheme.
///
/// Each check reports its own [`BlockIntegrityError`] variant so
/// diagnostics can say exactly what was wrong.
///
/// # Safety
///
/// The pointer is read; a wildly invalid pointer may still fault. The
/// scheme is advisory (it reliably catches double frees and pointers this
/// allocator never produced), not a hardening boundary.
pub(crate) unsafe fn validate(block: *const BlockHeader) -> Result<(), BlockIntegrityError> {
    if block.is_null() {
        return Err(BlockIntegrityError::NullPointer);
    }

    // SAFETY: non-null checked above; per the contract the caller accepts
    // that reading an arbitrary pointer is best-effort.
    unsafe {
        let magic = (*block).magic;
        if magic != BLOCK_MAGIC {
            return Err(BlockIntegrityError::BadMagic { found: magic });
        }

        let payload_addr = block as usize + BLOCK_HEADER_SIZE;
        if !is_aligned(payload_addr, ALIGNMENT) {
            return Err(BlockIntegrityError::MisalignedPayload { addr: payload_addr });
        }

        let size = (*block).size;
        if size < MIN_PAYLOAD_SIZE {
            return Err(BlockIntegrityError::UndersizedBlock { size });
        }

        let free = (*block).free;
        if free > 1 {
            return Err(BlockIntegrityError::InvalidFreeFlag { value: free });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::testing::TestArena;

    #[test]
    fn header_size_is_aligned() {
        assert!(is_aligned(BLOCK_HEADER_SIZE, ALIGNMENT));
        assert!(BLOCK_HEADER_SIZE >= core::mem::size_of::<BlockHeader>());
    }

    #[test]
    fn payload_round_trip() {
        let fixture = TestArena::new();
        let block = fixture.first_block();
        let payload = payload_of(block);
        assert!(is_aligned(payload.as_ptr() as usize, ALIGNMENT));
        assert_eq!(header_of(payload.as_ptr()), Some(block));
        assert_eq!(header_of(std::ptr::null_mut()), None);
    }

    #[test]
    fn init_rejects_undersized_regions() {
        let mut buffer = [0u8; BLOCK_MIN_SIZE];
        let addr = buffer.as_mut_ptr();
        // Deliberately one byte short of a minimum block.
        assert!(unsafe { init(addr, BLOCK_MIN_SIZE - 1) }.is_none());
        assert!(unsafe { init(std::ptr::null_mut(), BLOCK_MIN_SIZE) }.is_none());
    }

    #[test]
    fn free_list_insert_is_address_ordered_and_idempotent() {
        let fixture = TestArena::new();
        let arena = fixture.ptr();
        let blocks = fixture.carve(&[64, 64, 64]);

        unsafe {
            // Insert out of order; the list must come back sorted.
            add_to_free_list(arena, blocks[2]);
            add_to_free_list(arena, blocks[0]);
            add_to_free_list(arena, blocks[1]);

            let listed = fixture.free_list();
            assert!(listed.windows(2).all(|w| w[0] < w[1]));
            assert!(listed.contains(&(blocks[0].as_ptr() as usize)));

            // Second insert of the same block changes nothing.
            let before = fixture.free_list();
            add_to_free_list(arena, blocks[1]);
            assert_eq!(before, fixture.free_list());
        }
    }

    #[test]
    fn remove_advances_next_fit_cursor() {
        let fixture = TestArena::new();
        let arena = fixture.ptr();
        let blocks = fixture.carve(&[64, 64]);

        unsafe {
            add_to_free_list(arena, blocks[0]);
            add_to_free_list(arena, blocks[1]);
            (*arena).next_fit_cursor = Some(blocks[1]);

            remove_from_free_list(arena, blocks[1]);
            assert_eq!((*arena).next_fit_cursor, (*arena).free_list_head);

            // Removing a block that is not listed is a no-op.
            let before = fixture.free_list();
            remove_from_free_list(arena, blocks[1]);
            assert_eq!(before, fixture.free_list());
        }
    }

    #[test]
    fn split_refuses_when_remainder_would_be_undersized() {
        let fixture = TestArena::new();
        let arena = fixture.ptr();
        let block = fixture.first_block();

        unsafe {
            let size = (*block.as_ptr()).size;
            assert!(split(arena, block, size - BLOCK_MIN_SIZE + ALIGNMENT).is_none());
            // Untouched: still free, still the only block.
            assert_eq!((*block.as_ptr()).free, 1);
            assert_eq!((*block.as_ptr()).size, size);
            assert_eq!((*arena).block_count, 1);
        }
    }

    #[test]
    fn split_carves_an_aligned_remainder() {
        let fixture = TestArena::new();
        let arena = fixture.ptr();
        let block = fixture.first_block();

        unsafe {
            let old_size = (*block.as_ptr()).size;
            let leading = split(arena, block, 128).expect("split should succeed");
            assert_eq!(leading, block);
            assert_eq!((*leading.as_ptr()).size, 128);
            assert_eq!((*leading.as_ptr()).free, 0);

            let remainder = (*leading.as_ptr()).phys_next.expect("remainder exists");
            assert_eq!(
                remainder.as_ptr() as usize,
                leading.as_ptr() as usize + BLOCK_HEADER_SIZE + 128
            );
            assert_eq!(
                (*remainder.as_ptr()).size,
                old_size - 128 - BLOCK_HEADER_SIZE
            );
            assert_eq!((*remainder.as_ptr()).phys_prev, Some(leading));
            assert_eq!((*arena).block_count, 2);
            assert!(is_on_free_list(arena, remainder));
            assert!(!is_on_free_list(arena, leading));
        }
    }

    #[test]
    fn coalesce_merges_both_directions() {
        let fixture = TestArena::new();
        let arena = fixture.ptr();
        let blocks = fixture.carve(&[64, 64, 64]);

        unsafe {
            // Free the outer neighbours first, then the middle one.
            add_to_free_list(arena, blocks[0]);
            add_to_free_list(arena, blocks[2]);
            let tail = (*blocks[2].as_ptr()).phys_next.expect("tail block");
            let tail_size = (*tail.as_ptr()).size;
            let block_count_before = (*arena).block_count;

            (*blocks[1].as_ptr()).free = 1;
            (*blocks[1].as_ptr()).requested_size = 0;
            let (merged, absorbed) = coalesce(arena, blocks[1]);

            // blocks[1] absorbed into blocks[0]; blocks[2] and the free
            // tail absorbed rightwards.
            assert_eq!(merged, blocks[0]);
            assert_eq!(absorbed, 3);
            assert_eq!((*arena).block_count, block_count_before - 3);
            assert_eq!(
                (*merged.as_ptr()).size,
                64 * 3 + 3 * BLOCK_HEADER_SIZE + tail_size
            );
            assert!((*merged.as_ptr()).phys_next.is_none());
            assert!(is_on_free_list(arena, merged));

            // No two adjacent free blocks remain anywhere.
            let mut cursor = Some(merged);
            while let Some(cur) = cursor {
                if let Some(next) = (*cur.as_ptr()).phys_next {
                    assert!((*cur.as_ptr()).free == 0 || (*next.as_ptr()).free == 0);
                }
                cursor = (*cur.as_ptr()).phys_next;
            }
        }
    }

    #[test]
    fn validate_reports_distinct_failures() {
        let fixture = TestArena::new();
        let block = fixture.first_block();

        unsafe {
            assert!(validate(block.as_ptr()).is_ok());
            assert_eq!(
                validate(std::ptr::null()),
                Err(BlockIntegrityError::NullPointer)
            );

            let saved_magic = (*block.as_ptr()).magic;
            (*block.as_ptr()).magic = 0xDEAD_BEEF;
            assert_eq!(
                validate(block.as_ptr()),
                Err(BlockIntegrityError::BadMagic { found: 0xDEAD_BEEF })
            );
            (*block.as_ptr()).magic = saved_magic;

            let saved_size = (*block.as_ptr()).size;
            (*block.as_ptr()).size = MIN_PAYLOAD_SIZE - 1;
            assert_eq!(
                validate(block.as_ptr()),
                Err(BlockIntegrityError::UndersizedBlock {
                    size: MIN_PAYLOAD_SIZE - 1
                })
            );
            (*block.as_ptr()).size = saved_size;

            (*block.as_ptr()).free = 7;
            assert_eq!(
                validate(block.as_ptr()),
                Err(BlockIntegrityError::InvalidFreeFlag { value: 7 })
            );
            (*block.as_ptr()).free = 1;
        }
    }
}
