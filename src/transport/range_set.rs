//! Sorted set of disjoint half-open `u64` ranges.
//!
//! Used for received packet numbers (ACK generation), acknowledged and lost
//! byte ranges of send buffers, and gap tracking.

use std::collections::BTreeMap;
use std::ops::Range;

/// Disjoint, non-adjacent ranges keyed by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges
            .range(..=value)
            .next_back()
            .is_some_and(|(_, &end)| value < end)
    }

    /// Whether every value of `range` is present.
    pub fn contains_range(&self, range: &Range<u64>) -> bool {
        range.is_empty()
            || self
                .ranges
                .range(..=range.start)
                .next_back()
                .is_some_and(|(_, &end)| range.end <= end)
    }

    pub fn min(&self) -> Option<u64> {
        self.ranges.keys().next().copied()
    }

    /// One past the largest value.
    pub fn max_end(&self) -> Option<u64> {
        self.ranges.values().next_back().copied()
    }

    /// Insert `range`, merging with overlapping or adjacent ranges.
    /// Returns whether anything new was added.
    pub fn insert(&mut self, range: Range<u64>) -> bool {
        if range.is_empty() || self.contains_range(&range) {
            return false;
        }
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        while let Some((&s, &e)) = self.ranges.range(start..=end).next() {
            end = end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
        true
    }

    pub fn insert_one(&mut self, value: u64) -> bool {
        self.insert(value..value + 1)
    }

    /// Remove every value of `range`.
    pub fn remove(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let overlapping: Vec<(u64, u64)> = self
            .ranges
            .range(..range.end)
            .rev()
            .take_while(|(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < range.start {
                self.ranges.insert(s, range.start);
            }
            if e > range.end {
                self.ranges.insert(range.end, e);
            }
        }
    }

    /// Remove and return the lowest range.
    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&s, &e) = self.ranges.iter().next()?;
        self.ranges.remove(&s);
        Some(s..e)
    }

    /// Ranges in ascending order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Range<u64>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    /// Drop the lowest ranges until at most `max` remain. Returns the end
    /// of the highest range dropped.
    pub fn truncate_low(&mut self, max: usize) -> Option<u64> {
        let mut dropped_end = None;
        while self.ranges.len() > max {
            dropped_end = self.pop_min().map(|r| r.end);
        }
        dropped_end
    }

    /// Parts of `range` not covered by the set.
    pub fn gaps_in(&self, range: Range<u64>) -> Vec<Range<u64>> {
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for r in self.iter() {
            if r.end <= cursor {
                continue;
            }
            if r.start >= range.end {
                break;
            }
            if r.start > cursor {
                gaps.push(cursor..r.start);
            }
            cursor = cursor.max(r.end);
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }
}
