//! Randomized operation sequences: whatever order of allocate, free, and
//! resize proptest produces, every arena snapshot must satisfy the
//! structural invariants.

mod common;

use proptest::prelude::*;
use stratum::{Heap, HeapConfig, PlacementPolicy};

use common::check_arena_invariants;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    Free(usize),
    Resize(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..2048).prop_map(Op::Alloc),
        2 => (0usize..256).prop_map(Op::Free),
        1 => ((0usize..256), (1usize..2048)).prop_map(|(index, size)| Op::Resize(index, size)),
    ]
}

fn policy_strategy() -> impl Strategy<Value = PlacementPolicy> {
    (0u32..6).prop_map(PlacementPolicy::from_raw)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        ..ProptestConfig::default()
    })]

    #[test]
    fn invariants_hold_under_random_workloads(
        policy in policy_strategy(),
        ops in proptest::collection::vec(op_strategy(), 1..160),
    ) {
        let heap = Heap::new(
            HeapConfig::new()
                .with_arena_size(16 * 1024)
                .with_mmap_threshold(64 * 1024)
                .with_policy(policy),
        )
        .expect("heap");

        let mut live: Vec<(*mut u8, usize)> = Vec::new();

        for (step, op) in ops.iter().enumerate() {
            match *op {
                Op::Alloc(size) => {
                    let p = heap.allocate(size).expect("allocate");
                    // SAFETY: fresh allocation of `size` bytes.
                    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xAB, size) };
                    live.push((p.as_ptr(), size));
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let (p, _) = live.swap_remove(index % live.len());
                        // SAFETY: live pointer from this heap, freed once.
                        unsafe { heap.free(p).expect("free") };
                    }
                }
                Op::Resize(index, size) => {
                    if !live.is_empty() {
                        let slot = index % live.len();
                        let (p, old) = live[slot];
                        // SAFETY: live pointer from this heap; replaced on
                        // success, untouched on failure.
                        let resized = unsafe { heap.resize(p, size) }.expect("resize");
                        let preserved = old.min(size);
                        // SAFETY: the prefix survives a resize.
                        unsafe {
                            for offset in 0..preserved {
                                prop_assert_eq!(*resized.as_ptr().add(offset), 0xAB);
                            }
                            std::ptr::write_bytes(resized.as_ptr(), 0xAB, size);
                        }
                        live[slot] = (resized.as_ptr(), size);
                    }
                }
            }

            if step % 8 == 0 {
                for snapshot in heap.snapshots() {
                    check_arena_invariants(&snapshot);
                }
            }
        }

        for snapshot in heap.snapshots() {
            check_arena_invariants(&snapshot);
        }

        for (p, _) in live {
            // SAFETY: live pointers from this heap, freed once.
            unsafe { heap.free(p).expect("drain free") };
        }
        prop_assert_eq!(heap.aggregate_stats().allocated_block_count, 0);
    }
}
