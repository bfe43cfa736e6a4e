use std::{
    cmp::Reverse,
    collections::BinaryHeap,
};

use crate::{
    engine::SENTINEL_ID,
    Metric,
};

/// Merges candidate `(id, distance)` pairs into the top-`k` under `metric`'s
/// ordering using a bounded min-heap, the same shape as a brute-force
/// per-segment search and the cross-segment reduction in the query planner
/// share: push every candidate, evict the current worst once the heap grows
/// past `k`. Ties are broken by ascending id. Sentinel ids (padding from a
/// segment with fewer than `k` rows) are dropped before ever reaching the
/// heap.
///
/// Returned in best-first order.
pub fn select_top_k(
    metric: Metric,
    candidates: impl IntoIterator<Item = (i64, f32)>,
    k: usize,
) -> Vec<(i64, f32)> {
    let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::with_capacity(k + 1);
    for (id, distance) in candidates {
        if id == SENTINEL_ID {
            continue;
        }
        heap.push(Reverse(Entry {
            metric,
            distance,
            id,
        }));
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(e)| (e.id, e.distance))
        .collect()
}

fn goodness(metric: Metric, distance: f32) -> f32 {
    match metric {
        Metric::L2 => -distance,
        Metric::Ip => distance,
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    metric: Metric,
    distance: f32,
    id: i64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        goodness(self.metric, self.distance)
            .total_cmp(&goodness(other.metric, other.distance))
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn l2_selects_smallest_distances_first() {
        let top = select_top_k(Metric::L2, [(1, 3.0), (2, 1.0), (3, 2.0)], 2);
        assert_eq!(top, vec![(2, 1.0), (3, 2.0)]);
    }

    #[test]
    fn ip_selects_largest_products_first() {
        let top = select_top_k(Metric::Ip, [(1, 3.0), (2, 1.0), (3, 2.0)], 2);
        assert_eq!(top, vec![(1, 3.0), (3, 2.0)]);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let top = select_top_k(Metric::L2, [(3, 0.5), (1, 0.5), (2, 0.5)], 3);
        assert_eq!(top, vec![(1, 0.5), (2, 0.5), (3, 0.5)]);
    }

    #[test]
    fn sentinel_ids_are_dropped() {
        let top = select_top_k(Metric::L2, [(-1, 0.0), (5, 1.0)], 3);
        assert_eq!(top, vec![(5, 1.0)]);
    }

    #[test]
    fn k_zero_returns_empty() {
        assert!(select_top_k(Metric::L2, [(1, 1.0)], 0).is_empty());
    }

    proptest! {
        #[test]
        fn total_order_is_independent_of_input_order(
            mut pairs in proptest::collection::vec((0i64..50, 0.0f32..100.0), 0..30),
            k in 0usize..10,
        ) {
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            pairs.dedup_by(|a, b| a.0 == b.0);
            let forward = select_top_k(Metric::L2, pairs.clone(), k);
            let mut shuffled = pairs.clone();
            shuffled.reverse();
            let backward = select_top_k(Metric::L2, shuffled, k);
            prop_assert_eq!(forward, backward);
        }
    }
}
