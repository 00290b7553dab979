//! Ordered set of disjoint half-open byte ranges.
//!
//! Each modified file keeps one of these to record which ranges of the sparse
//! data file are locally authoritative. Insertion is a union: overlapping and
//! adjacent ranges coalesce, so the set stays disjoint and query results come
//! back in offset order.

use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntervalSet {
    /// start -> end, disjoint and non-adjacent.
    ranges: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> IntervalSet {
        IntervalSet::default()
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Union-inserts `[start, end)`, coalescing with neighbours.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
            }
        }
        let doomed: Vec<u64> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, &e)| {
                new_end = new_end.max(e);
                s
            })
            .collect();
        for s in doomed {
            self.ranges.remove(&s);
        }
        self.ranges.insert(new_start, new_end);
    }

    /// True when `point` falls inside a stored range.
    pub fn contains(&self, point: u64) -> bool {
        self.ranges
            .range(..=point)
            .next_back()
            .map_or(false, |(_, &e)| e > point)
    }

    /// True when a single stored range covers all of `[start, end)`.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges
            .range(..=start)
            .next_back()
            .map_or(false, |(_, &e)| e >= end)
    }

    /// Ranges intersecting `[start, end)`, in offset order, unclamped.
    pub fn overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = Range<u64>> + '_ {
        let head = self
            .ranges
            .range(..start)
            .next_back()
            .filter(|&(_, &e)| e > start)
            .map(|(&s, &e)| s..e);
        head.into_iter()
            .chain(self.ranges.range(start..end).map(|(&s, &e)| s..e))
    }

    /// All ranges in offset order.
    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    /// End of the highest stored range, or 0 when empty.
    pub fn max_end(&self) -> u64 {
        self.ranges.iter().next_back().map_or(0, |(_, &e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(set: &IntervalSet) -> Vec<(u64, u64)> {
        set.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn insert_disjoint_keeps_order() {
        let mut set = IntervalSet::new();
        set.insert(50, 60);
        set.insert(10, 20);
        assert_eq!(collect(&set), vec![(10, 20), (50, 60)]);
    }

    #[test]
    fn insert_coalesces_overlap_and_adjacency() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        set.insert(20, 30);
        assert_eq!(collect(&set), vec![(10, 30)]);
        set.insert(5, 12);
        assert_eq!(collect(&set), vec![(5, 30)]);
        set.insert(40, 50);
        set.insert(25, 45);
        assert_eq!(collect(&set), vec![(5, 50)]);
    }

    #[test]
    fn reinsert_is_idempotent() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        let before = set.clone();
        set.insert(10, 20);
        set.insert(12, 18);
        assert_eq!(set, before);
    }

    #[test]
    fn empty_range_is_ignored() {
        let mut set = IntervalSet::new();
        set.insert(10, 10);
        assert!(set.is_empty());
    }

    #[test]
    fn point_and_range_queries() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        assert!(set.contains(10));
        assert!(set.contains(19));
        assert!(!set.contains(20));
        assert!(!set.contains(25));
        assert!(set.covers(12, 18));
        assert!(!set.covers(12, 35));
        assert!(!set.covers(20, 21));
    }

    #[test]
    fn overlap_enumeration() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        set.insert(50, 60);
        let hits: Vec<_> = set.overlapping(15, 55).map(|r| (r.start, r.end)).collect();
        assert_eq!(hits, vec![(10, 20), (30, 40), (50, 60)]);
        let none: Vec<_> = set.overlapping(20, 30).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn max_end_tracks_highest_range() {
        let mut set = IntervalSet::new();
        assert_eq!(set.max_end(), 0);
        set.insert(10, 20);
        set.insert(100, 140);
        assert_eq!(set.max_end(), 140);
    }
}
