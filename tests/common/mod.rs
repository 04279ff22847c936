//! Shared invariant checkers for the integration suites.
//!
//! Each suite compiles this module separately and uses a subset of it.
#![allow(dead_code)]

use stratum::{ArenaSnapshot, Heap, ALIGNMENT, BLOCK_HEADER_SIZE};

/// Asserts the structural invariants of one arena snapshot: the physical
/// chain covers the block area exactly, the free list is ascending and
/// consistent with the chain, counters match reality, and the byte
/// accounting identity holds.
pub fn check_arena_invariants(snapshot: &ArenaSnapshot) {
    // Physical chain: contiguous, address-ordered, aligned sizes.
    let mut expected = snapshot.first_block;
    for block in &snapshot.blocks {
        assert_eq!(
            block.addr, expected,
            "physical chain has a gap or overlap in arena {}",
            snapshot.id
        );
        assert_eq!(block.size % ALIGNMENT, 0, "block size not aligned");
        if !block.free {
            assert!(
                block.requested_size <= block.size,
                "requested size exceeds capacity"
            );
        } else {
            assert_eq!(block.requested_size, 0, "free block with a request");
        }
        expected = block.addr + BLOCK_HEADER_SIZE + block.size;
    }
    assert!(expected <= snapshot.end, "chain runs past the arena end");
    let tail_loss = snapshot.end - expected;
    assert!(tail_loss < ALIGNMENT, "tail loss exceeds one alignment unit");

    // No two adjacent free blocks survive an operation.
    for pair in snapshot.blocks.windows(2) {
        assert!(
            !(pair[0].free && pair[1].free),
            "adjacent free blocks left uncoalesced"
        );
    }

    // Free list: strictly ascending, free blocks only, subset of the
    // chain, and complete (every free chain block is listed).
    let mut last_addr = 0usize;
    for entry in &snapshot.free_blocks {
        assert!(entry.addr > last_addr, "free list not strictly ascending");
        last_addr = entry.addr;

        let on_chain = snapshot
            .blocks
            .iter()
            .find(|b| b.addr == entry.addr)
            .expect("free-list entry missing from the physical chain");
        assert!(on_chain.free, "free-list entry not marked free");
        assert_eq!(on_chain.size, entry.size);
    }
    for block in snapshot.blocks.iter().filter(|b| b.free) {
        assert!(
            snapshot.free_blocks.iter().any(|f| f.addr == block.addr),
            "free block unreachable from the free list"
        );
    }

    // Counters and byte identities.
    let free_count = snapshot.blocks.iter().filter(|b| b.free).count();
    let alloc_count = snapshot.blocks.len() - free_count;
    assert_eq!(snapshot.block_count, snapshot.blocks.len());
    assert_eq!(snapshot.stats.free_block_count, free_count);
    assert_eq!(snapshot.stats.allocated_block_count, alloc_count);

    let used: usize = snapshot
        .blocks
        .iter()
        .filter(|b| !b.free)
        .map(|b| b.size)
        .sum();
    let free: usize = snapshot
        .blocks
        .iter()
        .filter(|b| b.free)
        .map(|b| b.size)
        .sum();
    assert_eq!(snapshot.stats.used_bytes, used);
    assert_eq!(snapshot.stats.free_bytes, free);
    assert_eq!(snapshot.stats.total_bytes, snapshot.size);

    let headers = snapshot.blocks.len() * BLOCK_HEADER_SIZE;
    let front_overhead = snapshot.first_block - snapshot.start;
    assert_eq!(
        used + free + headers + front_overhead + tail_loss,
        snapshot.size,
        "byte accounting identity broken in arena {}",
        snapshot.id
    );

    let wasted: usize = snapshot
        .blocks
        .iter()
        .filter(|b| !b.free)
        .map(|b| b.size - b.requested_size)
        .sum();
    assert_eq!(snapshot.stats.wasted_bytes, wasted);

    assert!(
        snapshot.stats.largest_free_block
            == snapshot.free_blocks.iter().map(|f| f.size).max().unwrap_or(0)
    );
}

/// Checks every arena of a heap.
pub fn check_heap_invariants(heap: &Heap) {
    for snapshot in heap.snapshots() {
        check_arena_invariants(&snapshot);
    }
}

/// Structural equality of two snapshots, ignoring call counters.
pub fn assert_same_structure(before: &ArenaSnapshot, after: &ArenaSnapshot) {
    assert_eq!(before.id, after.id);
    assert_eq!(before.blocks, after.blocks);
    assert_eq!(before.free_blocks, after.free_blocks);
    assert_eq!(before.block_count, after.block_count);
    assert_eq!(before.stats.used_bytes, after.stats.used_bytes);
    assert_eq!(before.stats.free_bytes, after.stats.free_bytes);
    assert_eq!(before.stats.wasted_bytes, after.stats.wasted_bytes);
    assert_eq!(
        before.stats.free_block_count,
        after.stats.free_block_count
    );
    assert_eq!(
        before.stats.allocated_block_count,
        after.stats.allocated_block_count
    );
}
