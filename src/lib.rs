//! # stratum
//!
//! An arena-based dynamic memory allocator with pluggable placement
//! policies, built directly on raw page mappings.
//!
//! The engine is [`Heap`]: a set of OS-backed arenas, each an independent
//! sub-heap with an in-place header, an address-ordered free list, a
//! physical-neighbour chain, per-arena statistics, and its own lock.
//! Allocation walks the arena list under a configurable placement policy
//! ([`PlacementPolicy`]); freeing coalesces with physical neighbours and
//! reclaims arenas that become one covering free block. Large requests
//! get a dedicated mapping, smaller ones are carved from a break pool
//! that stands in for classic program-break extension.
//!
//! ```
//! use stratum::{Heap, HeapConfig, PlacementPolicy};
//!
//! let heap = Heap::new(HeapConfig::new().with_policy(PlacementPolicy::BestFit))?;
//!
//! let ptr = heap.allocate(100)?;
//! // SAFETY: `ptr` is a live allocation of at least 100 bytes.
//! unsafe {
//!     std::ptr::write_bytes(ptr.as_ptr(), 0x42, 100);
//!     let ptr = heap.resize(ptr.as_ptr(), 200)?;
//!     heap.free(ptr.as_ptr())?;
//! }
//! # Ok::<(), stratum::HeapError>(())
//! ```
//!
//! A process-global, malloc-flavoured façade lives in [`api`].

pub mod api;
pub mod utils;

mod arena;
mod block;
mod config;
mod error;
mod heap;
mod platform;
mod policy;

pub use arena::{
    ArenaBacking, ArenaSnapshot, ArenaStatsSnapshot, BlockInfo, FreeBlockInfo, HeapStatsSnapshot,
    ARENA_HEADER_SIZE, ARENA_MIN_SIZE,
};
pub use block::{BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_MIN_SIZE};
pub use config::{
    HeapConfig, ALIGNMENT, DEFAULT_ARENA_SIZE, DEFAULT_BREAK_POOL_CAPACITY,
    DEFAULT_MMAP_THRESHOLD, MIN_MMAP_THRESHOLD, MIN_PAYLOAD_SIZE,
};
pub use error::{BlockIntegrityError, HeapError, HeapResult};
pub use heap::Heap;
pub use platform::page_size;
pub use policy::PlacementPolicy;
