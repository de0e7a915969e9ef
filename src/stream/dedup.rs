//! Bounded duplicate filter for event ids.

use std::collections::{HashSet, VecDeque};

/// Default number of event ids remembered for duplicate suppression.
pub const DEFAULT_SEEN_CAPACITY: usize = 5_000;

/// FIFO-bounded set of delivered event ids.
///
/// Membership is O(1). Once more than `capacity` ids have been inserted the
/// oldest inserted id is forgotten first, regardless of its numeric value.
#[derive(Clone, Debug)]
pub struct SeenEventIds {
    order: VecDeque<u64>,
    members: HashSet<u64>,
    capacity: usize,
}

impl SeenEventIds {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(DEFAULT_SEEN_CAPACITY)),
            members: HashSet::with_capacity(capacity.min(DEFAULT_SEEN_CAPACITY)),
            capacity,
        }
    }

    pub fn contains(&self, event_id: u64) -> bool {
        self.members.contains(&event_id)
    }

    /// Records `event_id`. Returns `false` if it was already present.
    pub fn insert(&mut self, event_id: u64) -> bool {
        if !self.members.insert(event_id) {
            return false;
        }
        self.order.push_back(event_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SeenEventIds {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::SeenEventIds;

    #[test]
    fn second_insert_of_same_id_is_rejected() {
        let mut seen = SeenEventIds::new(4);
        assert!(seen.insert(10));
        assert!(!seen.insert(10));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn oldest_inserted_id_is_evicted_past_capacity() {
        let mut seen = SeenEventIds::new(3);
        for id in [1, 2, 3, 4] {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(1));
        assert!(seen.contains(2));
        assert!(seen.contains(4));
        // forgotten ids are accepted again
        assert!(seen.insert(1));
        assert!(!seen.contains(2));
    }

    #[test]
    fn eviction_follows_insertion_order_not_id_order() {
        let mut seen = SeenEventIds::new(2);
        seen.insert(50);
        seen.insert(5);
        seen.insert(20);
        assert!(!seen.contains(50));
        assert!(seen.contains(5));
        assert!(seen.contains(20));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut seen = SeenEventIds::new(100);
        for id in 0..1_000 {
            seen.insert(id);
            assert!(seen.len() <= seen.capacity());
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.contains(999));
        assert!(!seen.contains(899));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut seen = SeenEventIds::new(0);
        assert_eq!(seen.capacity(), 1);
        seen.insert(1);
        seen.insert(2);
        assert!(seen.contains(2));
        assert!(!seen.contains(1));
    }
}
