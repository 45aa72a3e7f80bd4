use std::collections::BTreeMap;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

/// Compressed set of `u64` values stored as disjoint inclusive intervals
/// (a discrete interval encoding tree).
///
/// Values allocated and retired in roughly ascending order collapse into a
/// handful of intervals, which is what bounds epoch-window memory under
/// heavy allocation. Insert is amortized O(1) for in-order values; erase
/// splits an interval at worst.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    // lower bound -> upper bound, disjoint and non-adjacent
    intervals: BTreeMap<u64, u64>,
    len: u64,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The whole inclusive range `[lo, hi]` as one interval.
    pub fn from_range(lo: u64, hi: u64) -> Self {
        let mut set = Self::new();
        set.insert_interval(lo, hi);
        set
    }

    /// Number of values in the set.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of stored intervals; the compression denominator.
    pub fn compressed_len(&self) -> usize {
        self.intervals.len()
    }

    /// Ratio of logical size to stored intervals.
    pub fn compression(&self) -> f64 {
        if self.intervals.is_empty() {
            1.0
        } else {
            self.len as f64 / self.intervals.len() as f64
        }
    }

    pub fn lower(&self) -> Option<u64> {
        self.intervals.keys().next().copied()
    }

    pub fn upper(&self) -> Option<u64> {
        self.intervals.values().next_back().copied()
    }

    pub fn contains(&self, value: u64) -> bool {
        match self.intervals.range(..=value).next_back() {
            Some((_, &upper)) => value <= upper,
            None => false,
        }
    }

    /// Inserts one value. Returns false if it was already present.
    pub fn insert(&mut self, value: u64) -> bool {
        if self.contains(value) {
            return false;
        }
        self.insert_interval(value, value);
        true
    }

    /// Inserts the inclusive interval `[lo, hi]`, merging with anything it
    /// touches or overlaps.
    pub fn insert_interval(&mut self, lo: u64, hi: u64) {
        assert!(lo <= hi, "interval [{lo}, {hi}] is inverted");
        let mut new_lo = lo;
        let mut new_hi = hi;

        // swallow a predecessor that overlaps or is adjacent on the left
        if let Some((&prev_lo, &prev_hi)) = self.intervals.range(..lo).next_back() {
            if prev_hi.checked_add(1).map_or(true, |next| next >= lo) {
                new_lo = prev_lo;
                new_hi = new_hi.max(prev_hi);
                self.remove_record(prev_lo, prev_hi);
            }
        }

        // swallow successors that start within or adjacent to [new_lo, new_hi]
        loop {
            let next = self
                .intervals
                .range(new_lo..)
                .next()
                .map(|(&l, &u)| (l, u));
            match next {
                Some((next_lo, next_hi))
                    if new_hi.checked_add(1).map_or(true, |bound| next_lo <= bound) =>
                {
                    new_hi = new_hi.max(next_hi);
                    self.remove_record(next_lo, next_hi);
                }
                _ => break,
            }
        }

        self.intervals.insert(new_lo, new_hi);
        self.len += new_hi - new_lo + 1;
    }

    fn remove_record(&mut self, lo: u64, hi: u64) {
        self.intervals.remove(&lo);
        self.len -= hi - lo + 1;
    }

    /// Removes one value. Returns false if it was not present.
    pub fn erase(&mut self, value: u64) -> bool {
        let (lo, hi) = match self.intervals.range(..=value).next_back() {
            Some((&lo, &hi)) if value <= hi => (lo, hi),
            _ => return false,
        };
        self.intervals.remove(&lo);
        self.len -= hi - lo + 1;
        if lo < value {
            self.intervals.insert(lo, value - 1);
            self.len += value - lo;
        }
        if value < hi {
            self.intervals.insert(value + 1, hi);
            self.len += hi - value;
        }
        true
    }

    /// Iterates stored intervals as `(lower, upper)` pairs.
    pub fn intervals(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.intervals.iter().map(|(&lo, &hi)| (lo, hi))
    }

    /// Iterates every value. Prefer [`IntervalSet::intervals`] for bulk work.
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.intervals.iter().flat_map(|(&lo, &hi)| lo..=hi)
    }

    /// Set intersection; the combine step of epoch garbage collection.
    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = IntervalSet::new();
        let mut ours = self.intervals().peekable();
        let mut theirs = other.intervals().peekable();
        while let (Some(&(a_lo, a_hi)), Some(&(b_lo, b_hi))) = (ours.peek(), theirs.peek()) {
            let lo = a_lo.max(b_lo);
            let hi = a_hi.min(b_hi);
            if lo <= hi {
                result.insert_interval(lo, hi);
            }
            if a_hi < b_hi {
                ours.next();
            } else {
                theirs.next();
            }
        }
        result
    }

    /// Set union.
    pub fn union(&self, other: &IntervalSet) -> IntervalSet {
        let mut result = self.clone();
        for (lo, hi) in other.intervals() {
            result.insert_interval(lo, hi);
        }
        result
    }
}

impl Wire for IntervalSet {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.intervals.len() as u64).ser(writer);
        for (&lo, &hi) in &self.intervals {
            lo.ser(writer);
            hi.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let count = reader.read_len()?;
        let mut set = IntervalSet::new();
        for _ in 0..count {
            let lo = u64::de(reader)?;
            let hi = u64::de(reader)?;
            if lo > hi {
                return Err(WireErr::BadDiscriminant {
                    value: lo,
                    type_name: "IntervalSet interval",
                });
            }
            set.insert_interval(lo, hi);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_inserts_compress_to_one_interval() {
        let mut set = IntervalSet::new();
        for i in 0..1000 {
            assert!(set.insert(i));
        }
        assert_eq!(set.len(), 1000);
        assert_eq!(set.compressed_len(), 1);
        assert_eq!(set.lower(), Some(0));
        assert_eq!(set.upper(), Some(999));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut set = IntervalSet::new();
        assert!(set.insert(5));
        assert!(!set.insert(5));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn erase_splits_an_interval() {
        let mut set = IntervalSet::from_range(0, 9);
        assert!(set.erase(4));
        assert_eq!(set.len(), 9);
        assert_eq!(set.compressed_len(), 2);
        assert!(!set.contains(4));
        assert!(set.contains(3));
        assert!(set.contains(5));
    }

    #[test]
    fn erase_at_edges_shrinks() {
        let mut set = IntervalSet::from_range(10, 12);
        assert!(set.erase(10));
        assert!(set.erase(12));
        assert_eq!(set.compressed_len(), 1);
        assert_eq!(set.len(), 1);
        assert!(set.contains(11));
        assert!(!set.erase(10));
    }

    #[test]
    fn gap_fill_merges_neighbors() {
        let mut set = IntervalSet::new();
        set.insert(1);
        set.insert(3);
        assert_eq!(set.compressed_len(), 2);
        set.insert(2);
        assert_eq!(set.compressed_len(), 1);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn overlapping_interval_insert_unions() {
        let mut set = IntervalSet::from_range(0, 5);
        set.insert_interval(3, 10);
        assert_eq!(set.compressed_len(), 1);
        assert_eq!(set.len(), 11);
    }

    #[test]
    fn intersection() {
        let a = IntervalSet::from_range(0, 10);
        let mut b = IntervalSet::from_range(5, 7);
        b.insert_interval(9, 20);
        let both = a.intersect(&b);
        assert!(both.contains(5) && both.contains(7));
        assert!(both.contains(9) && both.contains(10));
        assert!(!both.contains(8) && !both.contains(11));
        assert_eq!(both.len(), 5);
    }

    #[test]
    fn wire_round_trip() {
        let mut set = IntervalSet::from_range(2, 9);
        set.erase(5);
        let bytes = plenum_wire::to_bytes(&set);
        let back: IntervalSet = plenum_wire::from_bytes(&bytes).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn boundary_values_do_not_overflow() {
        let mut set = IntervalSet::new();
        set.insert(u64::MAX);
        set.insert(0);
        assert!(set.contains(u64::MAX));
        assert!(set.contains(0));
        set.erase(u64::MAX);
        assert!(!set.contains(u64::MAX));
    }
}
