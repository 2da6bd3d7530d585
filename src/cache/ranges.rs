//! Sorted disjoint byte-range set
//!
//! Partial downloads track the bytes still missing from a blob as a
//! "free-range map": a sorted list of disjoint `(offset, length)` ranges.
//! Any fetch strategy (sequential tee, parallel chunks, selective reads)
//! reduces to removing ranges from the map as bytes land on disk. The map is
//! persisted as JSON next to the cache entry so a later process can resume.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Sorted, disjoint, coalesced set of byte ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// The whole blob `[0, size)` as a single range
    pub fn full(size: u64) -> Self {
        if size == 0 {
            return Self::empty();
        }
        Self {
            ranges: vec![Range {
                offset: 0,
                length: size,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total bytes covered
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Remove `[offset, offset + length)` from the set, splitting ranges as
    /// needed.
    pub fn remove(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset.saturating_add(length);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for range in &self.ranges {
            if range.end() <= offset || range.offset >= end {
                out.push(*range);
                continue;
            }
            if range.offset < offset {
                out.push(Range {
                    offset: range.offset,
                    length: offset - range.offset,
                });
            }
            if range.end() > end {
                out.push(Range {
                    offset: end,
                    length: range.end() - end,
                });
            }
        }
        self.ranges = out;
    }

    /// Ranges of the set intersecting `[offset, offset + length)`
    pub fn overlapping(&self, offset: u64, length: u64) -> Vec<Range> {
        let end = offset.saturating_add(length);
        self.ranges
            .iter()
            .filter(|r| r.end() > offset && r.offset < end)
            .map(|r| {
                let start = r.offset.max(offset);
                let stop = r.end().min(end);
                Range {
                    offset: start,
                    length: stop - start,
                }
            })
            .collect()
    }

    /// Length of the contiguous run starting at `offset` that is inside the
    /// set; zero when `offset` is not covered.
    pub fn covered_at(&self, offset: u64) -> u64 {
        for range in &self.ranges {
            if range.offset <= offset && offset < range.end() {
                return range.end() - offset;
            }
        }
        0
    }

    /// Offset of the first covered byte at or after `offset`
    pub fn next_at_or_after(&self, offset: u64) -> Option<u64> {
        self.ranges
            .iter()
            .filter(|r| r.end() > offset)
            .map(|r| r.offset.max(offset))
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_and_remove_prefix() {
        let mut set = RangeSet::full(10 * 1024 * 1024);
        set.remove(0, 4 * 1024 * 1024);
        assert_eq!(
            set.ranges(),
            &[Range {
                offset: 4 * 1024 * 1024,
                length: 6 * 1024 * 1024
            }]
        );
        assert_eq!(set.total(), 6 * 1024 * 1024);
    }

    #[test]
    fn test_remove_middle_splits() {
        let mut set = RangeSet::full(100);
        set.remove(40, 20);
        assert_eq!(
            set.ranges(),
            &[
                Range { offset: 0, length: 40 },
                Range { offset: 60, length: 40 },
            ]
        );
        set.remove(0, 100);
        assert!(set.is_empty());
    }

    #[test]
    fn test_overlapping_clamps() {
        let mut set = RangeSet::full(100);
        set.remove(0, 50);
        let overlaps = set.overlapping(40, 30);
        assert_eq!(overlaps, vec![Range { offset: 50, length: 20 }]);
        assert!(set.overlapping(0, 50).is_empty());
    }

    #[test]
    fn test_covered_at_and_next() {
        let mut set = RangeSet::full(100);
        set.remove(10, 20);
        assert_eq!(set.covered_at(0), 10);
        assert_eq!(set.covered_at(10), 0);
        assert_eq!(set.covered_at(30), 70);
        assert_eq!(set.next_at_or_after(5), Some(5));
        assert_eq!(set.next_at_or_after(15), Some(30));
        assert_eq!(set.next_at_or_after(100), None);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut set = RangeSet::full(1000);
        set.remove(100, 50);
        let json = serde_json::to_string(&set).unwrap();
        let back: RangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_zero_size_full_is_empty() {
        assert!(RangeSet::full(0).is_empty());
    }
}
