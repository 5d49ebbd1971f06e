//! Least-recently-used victim policy for a single cache set, backed by a
//! recency bit matrix: `matrix[i][j] = true` iff way `i` was more recently
//! used than way `j`. The victim is the way whose row is all zero (ignoring
//! the diagonal), i.e. no other way is older than it.

use bit_vec::BitVec;

/// Recency tracker for the ways of one cache set.
#[derive(Clone, Debug)]
pub struct LruPolicy {
    ways: usize,
    /// Flattened `ways * ways` row-major matrix.
    matrix: BitVec,
}

impl LruPolicy {
    /// Create a policy for a set with `ways` ways. All ways start tied
    /// (no recency recorded), so `victim()` returns way 0 until an access
    /// breaks the tie.
    pub fn new(ways: usize) -> LruPolicy {
        LruPolicy {
            ways,
            matrix: BitVec::from_elem(ways * ways, false),
        }
    }

    fn idx(&self, i: usize, j: usize) -> usize {
        i * self.ways + j
    }

    /// Record that `way` was just used: mark it more recent than every other
    /// way, and less recent than none.
    pub fn access(&mut self, way: usize) {
        debug_assert!(way < self.ways);
        for other in 0..self.ways {
            if other == way {
                continue;
            }
            let row = self.idx(way, other);
            let col = self.idx(other, way);
            self.matrix.set(row, true);
            self.matrix.set(col, false);
        }
    }

    /// Return the least-recently-used way: the row that is all zero
    /// (excluding the diagonal, which is never set).
    pub fn victim(&self) -> usize {
        for candidate in 0..self.ways {
            let is_oldest = (0..self.ways)
                .filter(|&other| other != candidate)
                .all(|other| !self.matrix[self.idx(candidate, other)]);
            if is_oldest {
                return candidate;
            }
        }
        // Every way ties (e.g. right after construction or reset); way 0 is
        // the conventional victim.
        0
    }

    /// Clear all recency information.
    pub fn reset(&mut self) {
        self.matrix = BitVec::from_elem(self.ways * self.ways, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_policy_victim_is_way_zero() {
        let lru = LruPolicy::new(2);
        assert_eq!(lru.victim(), 0);
    }

    #[test]
    fn access_changes_victim() {
        let mut lru = LruPolicy::new(2);
        lru.access(0);
        assert_eq!(lru.victim(), 1);
        lru.access(1);
        assert_eq!(lru.victim(), 0);
    }

    #[test]
    fn accessed_way_is_never_immediately_the_victim() {
        let mut lru = LruPolicy::new(4);
        for w in 0..4 {
            lru.access(w);
            assert_ne!(lru.victim(), w);
        }
    }

    #[test]
    fn four_way_recency_order() {
        let mut lru = LruPolicy::new(4);
        lru.access(0);
        lru.access(1);
        lru.access(2);
        lru.access(3);
        // Access order 0,1,2,3 -> 0 is now the oldest.
        assert_eq!(lru.victim(), 0);
        lru.access(0);
        // Now 1 is the oldest.
        assert_eq!(lru.victim(), 1);
    }

    #[test]
    fn reset_restores_fresh_state() {
        let mut lru = LruPolicy::new(2);
        lru.access(0);
        lru.reset();
        assert_eq!(lru.victim(), 0);
    }
}
