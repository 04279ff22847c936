//! Per-arena statistics and the snapshot types handed out by
//! introspection.

use std::fmt;

use crate::arena::ArenaBacking;
use crate::utils::format_bytes;

/// Live counters embedded in the arena header.
///
/// Every field is mutated only under the owning arena's lock, so plain
/// integers suffice. The accounting identity maintained by the façade:
/// `used_bytes + free_bytes + block headers + arena header + alignment
/// loss == total_bytes`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct ArenaStats {
    pub(crate) total_bytes: usize,
    pub(crate) used_bytes: usize,
    pub(crate) free_bytes: usize,
    pub(crate) largest_free_block: usize,
    pub(crate) free_block_count: usize,
    pub(crate) allocated_block_count: usize,
    pub(crate) wasted_bytes: usize,
    pub(crate) alloc_calls: u64,
    pub(crate) free_calls: u64,
    pub(crate) realloc_calls: u64,
    pub(crate) zalloc_calls: u64,
}

impl ArenaStats {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Immutable copy of an arena's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArenaStatsSnapshot {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Exact at snapshot time: recomputed from the live free list.
    pub largest_free_block: usize,
    pub free_block_count: usize,
    pub allocated_block_count: usize,
    pub wasted_bytes: usize,
    pub alloc_calls: u64,
    pub free_calls: u64,
    pub realloc_calls: u64,
    pub zalloc_calls: u64,
}

impl ArenaStatsSnapshot {
    /// External fragmentation: `1 − largest_free_block / free_bytes`,
    /// 0 when nothing is free.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - self.largest_free_block as f64 / self.free_bytes as f64
        }
    }
}

impl fmt::Display for ArenaStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  total bytes       : {}", format_bytes(self.total_bytes))?;
        writeln!(f, "  used bytes        : {}", format_bytes(self.used_bytes))?;
        writeln!(f, "  free bytes        : {}", format_bytes(self.free_bytes))?;
        writeln!(
            f,
            "  largest free block: {}",
            format_bytes(self.largest_free_block)
        )?;
        writeln!(f, "  free blocks       : {}", self.free_block_count)?;
        writeln!(f, "  allocated blocks  : {}", self.allocated_block_count)?;
        writeln!(
            f,
            "  wasted (internal) : {}",
            format_bytes(self.wasted_bytes)
        )?;
        writeln!(
            f,
            "  fragmentation     : {:.4}",
            self.fragmentation_ratio()
        )?;
        writeln!(
            f,
            "  calls             : alloc={} free={} realloc={} zalloc={}",
            self.alloc_calls, self.free_calls, self.realloc_calls, self.zalloc_calls
        )
    }
}

/// One entry of an arena's physical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Header address.
    pub addr: usize,
    /// Payload capacity in bytes.
    pub size: usize,
    /// Original request; 0 for free blocks.
    pub requested_size: usize,
    pub free: bool,
}

/// One entry of an arena's free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlockInfo {
    /// Header address.
    pub addr: usize,
    /// Payload capacity in bytes.
    pub size: usize,
}

/// Consistent view of one arena, taken under its lock.
#[derive(Debug, Clone)]
pub struct ArenaSnapshot {
    pub id: u64,
    pub backing: ArenaBacking,
    /// Region bounds and total size.
    pub start: usize,
    pub end: usize,
    pub size: usize,
    /// Address of the first block header.
    pub first_block: usize,
    pub block_count: usize,
    pub stats: ArenaStatsSnapshot,
    /// Physical chain in address order.
    pub blocks: Vec<BlockInfo>,
    /// Free list in address order.
    pub free_blocks: Vec<FreeBlockInfo>,
}

impl fmt::Display for ArenaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===== arena {} ({:?}) =====", self.id, self.backing)?;
        writeln!(f, "  region            : {:#x}..{:#x}", self.start, self.end)?;
        writeln!(f, "  blocks            : {}", self.block_count)?;
        write!(f, "{}", self.stats)?;
        if self.free_blocks.is_empty() {
            writeln!(f, "  free list         : empty")?;
        } else {
            writeln!(f, "  free list         :")?;
            for (index, entry) in self.free_blocks.iter().enumerate() {
                writeln!(
                    f,
                    "    [{index}] block={:#x} size={}",
                    entry.addr, entry.size
                )?;
            }
        }
        Ok(())
    }
}

/// Heap-wide aggregation of every arena's snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeapStatsSnapshot {
    pub arena_count: usize,
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free_block: usize,
    pub free_block_count: usize,
    pub allocated_block_count: usize,
    pub wasted_bytes: usize,
    pub alloc_calls: u64,
    pub free_calls: u64,
    pub realloc_calls: u64,
    pub zalloc_calls: u64,
}

impl HeapStatsSnapshot {
    pub(crate) fn accumulate(&mut self, arena: &ArenaSnapshot) {
        self.arena_count += 1;
        self.total_bytes += arena.stats.total_bytes;
        self.used_bytes += arena.stats.used_bytes;
        self.free_bytes += arena.stats.free_bytes;
        self.largest_free_block = self.largest_free_block.max(arena.stats.largest_free_block);
        self.free_block_count += arena.stats.free_block_count;
        self.allocated_block_count += arena.stats.allocated_block_count;
        self.wasted_bytes += arena.stats.wasted_bytes;
        self.alloc_calls += arena.stats.alloc_calls;
        self.free_calls += arena.stats.free_calls;
        self.realloc_calls += arena.stats.realloc_calls;
        self.zalloc_calls += arena.stats.zalloc_calls;
    }

    /// External fragmentation over the whole heap.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - self.largest_free_block as f64 / self.free_bytes as f64
        }
    }
}
