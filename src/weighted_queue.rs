/// A binary min-heap keyed by a `u64` weight, with its elements kept in an index arena
///  that is recycled through a free list.
///
/// This is the scheduling primitive behind the retransmission queue: the weight is an
///  absolute deadline timestamp, and the queue is polled for due entries on every tick.
///  Under high packet rates entries churn quickly, so heap nodes and arena slots are
///  reused instead of reallocated, and elements are moved rather than cloned.
///
/// Two kinds of sentinel keep the sift loops free of index bound checks: index 0 holds a
///  minimal-weight root guard that terminates every sift-up, and the physical buffer is
///  padded past the logical size with maximal-weight hole markers so sift-down can read
///  both children of any logical node unconditionally.
pub struct WeightedQueue<T> {
    heap: Vec<HeapSlot>,
    len: usize,
    arena: Vec<Option<T>>,
    free: Vec<u32>,
}

#[derive(Copy, Clone)]
struct HeapSlot {
    weight: u64,
    node: u32,
}

const GUARD: HeapSlot = HeapSlot { weight: u64::MIN, node: u32::MAX };
const HOLE: HeapSlot = HeapSlot { weight: u64::MAX, node: u32::MAX };

/// smallest physical buffer the shrink pass will go down to
const MIN_PHYSICAL: usize = 16;

impl<T> WeightedQueue<T> {
    pub fn new() -> WeightedQueue<T> {
        let mut heap = vec![HOLE; MIN_PHYSICAL];
        heap[0] = GUARD;
        WeightedQueue {
            heap,
            len: 0,
            arena: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, weight: u64, element: T) {
        let node = self.alloc_node(element);
        self.ensure_physical();
        self.len += 1;
        self.sift_up(self.len, HeapSlot { weight, node });
    }

    /// Inserts many elements sharing one weight. When the shared weight is not smaller
    ///  than any existing parent of the appended frontier (checked by a linear scan),
    ///  the elements are appended in O(k); otherwise this falls back to individual
    ///  O(log n) inserts.
    pub fn insert_series(&mut self, weight: u64, elements: Vec<T>) {
        let k = elements.len();
        if k == 0 {
            return;
        }

        let fast = (self.len + 1..=self.len + k)
            .all(|pos| {
                let parent = pos / 2;
                parent > self.len || parent == 0 || weight >= self.heap[parent].weight
            });

        if fast {
            for element in elements {
                let node = self.alloc_node(element);
                self.ensure_physical();
                self.len += 1;
                self.heap[self.len] = HeapSlot { weight, node };
            }
        }
        else {
            for element in elements {
                self.insert(weight, element);
            }
        }
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.arena[self.heap[1].node as usize].as_ref()
    }

    pub fn peek_weight(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        Some(self.heap[1].weight)
    }

    /// removes and returns the minimum-weight element
    pub fn poll(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        let root = self.heap[1];

        let last = self.heap[self.len];
        self.heap[self.len] = HOLE;
        self.len -= 1;
        if self.len > 0 {
            self.sift_down(1, last);
        }

        self.maybe_shrink();
        Some(self.release_node(root.node))
    }

    pub fn clear(&mut self) {
        for slot in &mut self.heap[1..=self.len] {
            self.arena[slot.node as usize] = None;
            self.free.push(slot.node);
            *slot = HOLE;
        }
        self.len = 0;
        self.maybe_shrink();
    }

    fn sift_up(&mut self, mut idx: usize, slot: HeapSlot) {
        // terminates at the root guard without an explicit idx > 1 check
        while slot.weight < self.heap[idx / 2].weight {
            self.heap[idx] = self.heap[idx / 2];
            idx /= 2;
        }
        self.heap[idx] = slot;
    }

    fn sift_down(&mut self, mut idx: usize, slot: HeapSlot) {
        loop {
            // both children are readable unconditionally - holes carry maximal weight
            let mut child = idx * 2;
            if self.heap[child + 1].weight < self.heap[child].weight {
                child += 1;
            }
            if self.heap[child].weight >= slot.weight {
                break;
            }
            self.heap[idx] = self.heap[child];
            idx = child;
        }
        self.heap[idx] = slot;
    }

    /// keeps the physical buffer big enough that children of any logical node are in bounds
    fn ensure_physical(&mut self) {
        let required = 2 * (self.len + 1) + 2;
        if self.heap.len() < required {
            self.heap.resize(required.next_power_of_two(), HOLE);
        }
    }

    /// Shrinks the physical buffer when utilization falls below a quarter, to bound
    ///  worst-case memory after bursts. The small floor avoids thrashing around
    ///  trivial sizes.
    fn maybe_shrink(&mut self) {
        if self.heap.len() > MIN_PHYSICAL && self.len < self.heap.len() / 8 {
            let target = (2 * (self.len + 1) + 2).next_power_of_two().max(MIN_PHYSICAL);
            self.heap.truncate(target);

            // the arena can only shed empty trailing slots - live elements may sit anywhere
            while matches!(self.arena.last(), Some(None)) {
                self.arena.pop();
            }
            self.free.retain(|&node| (node as usize) < self.arena.len());
        }
    }

    fn alloc_node(&mut self, element: T) -> u32 {
        match self.free.pop() {
            Some(node) => {
                self.arena[node as usize] = Some(element);
                node
            }
            None => {
                self.arena.push(Some(element));
                (self.arena.len() - 1) as u32
            }
        }
    }

    fn release_node(&mut self, node: u32) -> T {
        let element = self.arena[node as usize].take()
            .expect("heap slot referenced an empty arena node");
        self.free.push(node);
        element
    }
}

impl<T> Default for WeightedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn drain<T>(queue: &mut WeightedQueue<T>) -> Vec<T> {
        let mut result = Vec::new();
        while let Some(element) = queue.poll() {
            result.push(element);
        }
        result
    }

    #[rstest]
    #[case::ascending(vec![1, 2, 3, 4, 5])]
    #[case::descending(vec![5, 4, 3, 2, 1])]
    #[case::shuffled(vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5])]
    #[case::all_equal(vec![7, 7, 7, 7])]
    #[case::single(vec![42])]
    #[case::empty(vec![])]
    fn test_poll_returns_elements_in_weight_order(#[case] weights: Vec<u64>) {
        let mut queue = WeightedQueue::new();
        for &w in &weights {
            queue.insert(w, w);
        }
        assert_eq!(queue.len(), weights.len());

        let mut expected = weights.clone();
        expected.sort();
        assert_eq!(drain(&mut queue), expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_peek_is_always_minimum() {
        let mut queue = WeightedQueue::new();
        let weights = [9u64, 3, 7, 1, 8, 2, 6, 4, 5, 1];
        let mut min_so_far = u64::MAX;
        for &w in &weights {
            queue.insert(w, w);
            min_so_far = min_so_far.min(w);
            assert_eq!(queue.peek(), Some(&min_so_far));
            assert_eq!(queue.peek_weight(), Some(min_so_far));
        }
    }

    #[test]
    fn test_each_element_polled_exactly_once() {
        let mut queue = WeightedQueue::new();
        for i in 0..100u64 {
            queue.insert(i % 10, i);
        }
        let mut polled = drain(&mut queue);
        polled.sort();
        assert_eq!(polled, (0..100).collect::<Vec<_>>());
    }

    #[rstest]
    #[case::into_empty(vec![], 5)]
    #[case::weight_above_existing(vec![1, 2, 3], 9)]
    #[case::weight_below_existing(vec![5, 6, 7], 1)]
    #[case::weight_interleaved(vec![1, 9, 2, 8], 5)]
    fn test_insert_series_equivalent_to_individual_inserts(#[case] existing: Vec<u64>, #[case] series_weight: u64) {
        let mut series_queue = WeightedQueue::new();
        let mut reference_queue = WeightedQueue::new();
        for &w in &existing {
            series_queue.insert(w, w * 100);
            reference_queue.insert(w, w * 100);
        }

        let series = vec![1000u64, 1001, 1002, 1003];
        series_queue.insert_series(series_weight, series.clone());
        for element in series {
            reference_queue.insert(series_weight, element);
        }

        let mut from_series = drain(&mut series_queue);
        let mut from_reference = drain(&mut reference_queue);
        // equal weights may tie-break differently - compare as sets per weight
        from_series.sort();
        from_reference.sort();
        assert_eq!(from_series, from_reference);
    }

    #[test]
    fn test_arena_nodes_are_recycled() {
        let mut queue = WeightedQueue::new();
        for round in 0..50u64 {
            queue.insert(round, round);
            assert_eq!(queue.poll(), Some(round));
        }
        // one live element at a time - the arena must not have grown per insert
        assert!(queue.arena.len() <= 2);
    }

    #[test]
    fn test_physical_buffer_shrinks_after_burst() {
        let mut queue = WeightedQueue::new();
        for i in 0..1000u64 {
            queue.insert(i, i);
        }
        let physical_at_peak = queue.heap.len();
        assert!(physical_at_peak >= 1000);

        while queue.poll().is_some() {}
        assert!(queue.heap.len() < physical_at_peak);
        assert_eq!(queue.heap.len(), MIN_PHYSICAL);
    }

    #[test]
    fn test_clear_releases_all_elements() {
        let mut queue = WeightedQueue::new();
        for i in 0..10u64 {
            queue.insert(i, i);
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.poll(), None);

        // the queue stays usable after a clear
        queue.insert(1, 1);
        assert_eq!(queue.poll(), Some(1));
    }
}
