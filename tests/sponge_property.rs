//! Property coverage for the reorder buffer.

use proptest::prelude::*;
use weft::sponge::{Admission, Sponge};

/// Feed a permutation of `0..n` and collect everything released.
fn run_permutation(order: &[u64], capacity: usize) -> Vec<u64> {
    let mut sponge: Sponge<u64> = Sponge::new(capacity);
    let mut released = Vec::new();
    for &seq in order {
        match sponge.accept(seq, seq) {
            Admission::Ready(batch) => released.extend(batch),
            Admission::Held => {}
            Admission::Rejected(item) => released.push(item),
        }
    }
    released
}

proptest! {
    /// Any permutation that fits in the cache comes out in exact order.
    #[test]
    fn permutations_within_capacity_release_in_order(
        order in Just((0u64..32).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let released = run_permutation(&order, 32);
        prop_assert_eq!(released, (0u64..32).collect::<Vec<_>>());
    }

    /// Nothing is duplicated and at most one cache-load is still held
    /// back, whatever the capacity.
    #[test]
    fn conservation_under_small_capacities(
        order in Just((0u64..48).collect::<Vec<_>>()).prop_shuffle(),
        capacity in 1usize..8
    ) {
        let released = run_permutation(&order, capacity);
        prop_assert!(released.len() + capacity >= 48);
        let mut sorted = released.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), released.len());
    }

    /// With one sequence number withheld, everything else still drains
    /// once the cache force-flushes; the missing number never blocks the
    /// pipe forever.
    #[test]
    fn a_gap_cannot_dam_the_queue(dropped in 0u64..32) {
        let mut sponge: Sponge<u64> = Sponge::new(8);
        let mut released = Vec::new();
        for seq in 0..32 {
            if seq == dropped {
                continue;
            }
            match sponge.accept(seq, seq) {
                Admission::Ready(batch) => released.extend(batch),
                Admission::Held => {}
                Admission::Rejected(item) => released.push(item),
            }
        }
        // At most the cache capacity may still be held back.
        prop_assert!(released.len() + 8 >= 31);
        // Whatever was released is free of duplicates.
        let mut sorted = released.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), released.len());
    }
}
