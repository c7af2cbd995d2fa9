//! Sets of byte ranges.
//!
//! A [`RangeSet`] keeps half-open `u64` ranges sorted, non-overlapping and
//! merged with their neighbours. The download side uses one set for bytes
//! already written and one per source for bytes requested but not yet received.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Sorted, coalesced set of half-open byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
}

impl RangeSet {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single range
    #[must_use]
    pub fn from_range(range: Range<u64>) -> Self {
        let mut set = Self::new();
        set.insert(range);
        set
    }

    /// Add a range, merging it with overlapping or adjacent ranges.
    pub fn insert(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;

        // First range that ends at or after `start` may touch the new one
        let first = self.ranges.partition_point(|r| r.end < start);
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].start <= end {
            start = start.min(self.ranges[last].start);
            end = end.max(self.ranges[last].end);
            last += 1;
        }

        self.ranges.splice(first..last, std::iter::once(start..end));
    }

    /// Remove a range, splitting ranges that straddle its bounds.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let first = self.ranges.partition_point(|r| r.end <= range.start);
        let mut last = first;
        let mut remainder = Vec::with_capacity(2);
        while last < self.ranges.len() && self.ranges[last].start < range.end {
            let existing = &self.ranges[last];
            if existing.start < range.start {
                remainder.push(existing.start..range.start);
            }
            if existing.end > range.end {
                remainder.push(range.end..existing.end);
            }
            last += 1;
        }

        self.ranges.splice(first..last, remainder);
    }

    /// Whether `range` is fully covered by the set. Empty ranges are always covered.
    #[must_use]
    pub fn contains_range(&self, range: &Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    /// Whether any byte of `range` is in the set
    #[must_use]
    pub fn intersects(&self, range: &Range<u64>) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
    }

    /// Ranges inside `bounds` that are not covered by the set, in ascending order.
    #[must_use]
    pub fn gaps(&self, bounds: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = bounds.start;

        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= bounds.end {
                break;
            }
            if r.start > cursor {
                gaps.push(cursor..r.start.min(bounds.end));
            }
            cursor = cursor.max(r.end);
        }

        if cursor < bounds.end {
            gaps.push(cursor..bounds.end);
        }
        gaps
    }

    /// Union of two sets
    #[must_use]
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut merged = self.clone();
        for r in &other.ranges {
            merged.insert(r.clone());
        }
        merged
    }

    /// Total number of bytes covered
    #[must_use]
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Number of disjoint ranges
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether the set covers nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over the disjoint ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}
