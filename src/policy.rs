//! Placement policies: the rule that picks which free block satisfies a
//! request.
//!
//! Selection is a pure scan over an arena's free list; the only state any
//! policy carries is next-fit's cursor, which lives on the arena and is
//! advanced by the caller once a candidate is actually taken.

use std::fmt;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::block::{payload_of, BlockHeader};
use crate::config::ALIGNMENT;
use crate::utils::is_aligned_ptr;

/// Strategy for choosing a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum PlacementPolicy {
    /// First free block that fits, scanning from the list head.
    #[default]
    FirstFit = 0,
    /// Resume scanning where the previous search left off, wrapping once.
    NextFit = 1,
    /// Smallest free block that fits; ties go to the lowest address.
    BestFit = 2,
    /// Largest free block that fits; ties go to the lowest address.
    WorstFit = 3,
}

impl PlacementPolicy {
    /// Decodes a raw discriminant; unknown values fall back to first-fit.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::NextFit,
            2 => Self::BestFit,
            3 => Self::WorstFit,
            _ => Self::FirstFit,
        }
    }

    /// Raw discriminant of the policy.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FirstFit => "first-fit",
            Self::NextFit => "next-fit",
            Self::BestFit => "best-fit",
            Self::WorstFit => "worst-fit",
        };
        f.write_str(name)
    }
}

/// True when `block` can satisfy a request for `need` payload bytes.
///
/// # Safety
///
/// Caller holds the arena lock and `block` is a live header.
unsafe fn fits(block: NonNull<BlockHeader>, need: usize) -> bool {
    // SAFETY: live header per the contract.
    unsafe {
        (*block.as_ptr()).free == 1
            && (*block.as_ptr()).size >= need
            && is_aligned_ptr(payload_of(block).as_ptr(), ALIGNMENT)
    }
}

/// Selects a candidate free block for `payload_size` bytes, or `None`.
///
/// Scans only the free list and mutates nothing.
///
/// # Safety
///
/// Caller holds the arena lock; `arena` is live.
pub(crate) unsafe fn find_candidate(
    arena: *mut Arena,
    payload_size: usize,
    policy: PlacementPolicy,
) -> Option<NonNull<BlockHeader>> {
    if payload_size == 0 {
        return None;
    }
    // SAFETY: forwarded contract.
    unsafe {
        match policy {
            PlacementPolicy::FirstFit => first_fit(arena, payload_size),
            PlacementPolicy::NextFit => next_fit(arena, payload_size),
            PlacementPolicy::BestFit => best_fit(arena, payload_size),
            PlacementPolicy::WorstFit => worst_fit(arena, payload_size),
        }
    }
}

/// Moves the next-fit cursor past a block that was just taken, wrapping to
/// the list head.
///
/// # Safety
///
/// Caller holds the arena lock; `taken` is still linked into the list.
pub(crate) unsafe fn advance_next_fit_cursor(arena: *mut Arena, taken: NonNull<BlockHeader>) {
    // SAFETY: forwarded contract.
    unsafe {
        (*arena).next_fit_cursor = (*taken.as_ptr()).next.or((*arena).free_list_head);
    }
}

unsafe fn first_fit(arena: *mut Arena, need: usize) -> Option<NonNull<BlockHeader>> {
    // SAFETY: list links stay inside the locked arena.
    unsafe {
        let mut current = (*arena).free_list_head;
        while let Some(cur) = current {
            if fits(cur, need) {
                return Some(cur);
            }
            current = (*cur.as_ptr()).next;
        }
        None
    }
}

unsafe fn next_fit(arena: *mut Arena, need: usize) -> Option<NonNull<BlockHeader>> {
    // SAFETY: list links stay inside the locked arena; the traversal is
    // bounded to one full cycle.
    unsafe {
        let start = (*arena).next_fit_cursor.or((*arena).free_list_head)?;
        let mut cur = start;
        loop {
            if fits(cur, need) {
                return Some(cur);
            }
            cur = (*cur.as_ptr()).next.or((*arena).free_list_head)?;
            if cur == start {
                return None;
            }
        }
    }
}

unsafe fn best_fit(arena: *mut Arena, need: usize) -> Option<NonNull<BlockHeader>> {
    // SAFETY: list links stay inside the locked arena.
    unsafe {
        let mut best: Option<NonNull<BlockHeader>> = None;
        let mut best_size = usize::MAX;
        let mut current = (*arena).free_list_head;
        while let Some(cur) = current {
            let size = (*cur.as_ptr()).size;
            if fits(cur, need) && size < best_size {
                best_size = size;
                best = Some(cur);
            }
            current = (*cur.as_ptr()).next;
        }
        best
    }
}

unsafe fn worst_fit(arena: *mut Arena, need: usize) -> Option<NonNull<BlockHeader>> {
    // SAFETY: list links stay inside the locked arena.
    unsafe {
        let mut worst: Option<NonNull<BlockHeader>> = None;
        let mut worst_size = 0usize;
        let mut current = (*arena).free_list_head;
        while let Some(cur) = current {
            let size = (*cur.as_ptr()).size;
            if fits(cur, need) && size > worst_size {
                worst_size = size;
                worst = Some(cur);
            }
            current = (*cur.as_ptr()).next;
        }
        worst
    }
}
