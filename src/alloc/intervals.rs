//! Interval map tracking Free/Used ranges of one pool resource

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeState {
    Free,
    Used,
}

/// Partition of `[0, size)` into Free and Used ranges
///
/// Each entry starts a range that runs to the next key (or `size`).
/// Adjacent Free ranges are merged as soon as they appear.
#[derive(Clone, Debug)]
pub struct Intervals {
    size: u64,
    ranges: BTreeMap<u64, RangeState>,
}

impl Intervals {
    pub fn new(size: u64) -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert(0, RangeState::Free);
        Self { size, ranges }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn range_end(&self, start: u64) -> u64 {
        self.ranges
            .range(start + 1..)
            .next()
            .map(|(next, _)| *next)
            .unwrap_or(self.size)
    }

    /// Find a Free range holding `size` bytes whose absolute address
    /// (`base + offset`) is aligned, scanning from `hint` and wrapping once
    pub fn find_fit(&self, size: u64, alignment: u64, base: u64, hint: u64) -> Option<u64> {
        let fits = |start: u64| {
            let end = self.range_end(start);
            let aligned = crate::core::align_up(base + start, alignment) - base;
            (aligned + size <= end).then_some(aligned)
        };

        let free_from = |from: u64, to: u64| {
            self.ranges
                .range(from..to)
                .filter(|(_, state)| **state == RangeState::Free)
                .find_map(|(start, _)| fits(*start))
        };

        // the hint may fall inside a range; begin at the range that contains it
        let seed = self.ranges.range(..=hint).next_back().map(|(s, _)| *s).unwrap_or(0);
        free_from(seed, u64::MAX).or_else(|| free_from(0, seed))
    }

    /// Mark `[offset, offset + size)` Used; it must lie inside one Free range
    pub fn mark_used(&mut self, offset: u64, size: u64) {
        let Some((&start, &state)) = self.ranges.range(..=offset).next_back() else {
            return;
        };
        debug_assert_eq!(state, RangeState::Free);
        let end = self.range_end(start);
        debug_assert!(offset + size <= end);

        if offset > start {
            self.ranges.insert(start, RangeState::Free);
        }
        self.ranges.insert(offset, RangeState::Used);
        if offset + size < end {
            self.ranges.insert(offset + size, RangeState::Free);
        }
    }

    /// Mark the Used range starting at `offset` Free and merge it with Free neighbours
    ///
    /// Returns the start of the merged Free range.
    pub fn mark_free(&mut self, offset: u64) -> u64 {
        if self.ranges.get(&offset) != Some(&RangeState::Used) {
            return offset;
        }
        self.ranges.insert(offset, RangeState::Free);

        // merge right
        let end = self.range_end(offset);
        if end < self.size && self.ranges.get(&end) == Some(&RangeState::Free) {
            self.ranges.remove(&end);
        }

        // merge left
        if let Some((&prev, &state)) = self.ranges.range(..offset).next_back() {
            if state == RangeState::Free {
                self.ranges.remove(&offset);
                return prev;
            }
        }
        offset
    }

    pub fn bytes_free(&self) -> u64 {
        self.ranges
            .iter()
            .filter(|(_, state)| **state == RangeState::Free)
            .map(|(start, _)| self.range_end(*start) - start)
            .sum()
    }

    /// Ranges as (start, end, state), in order
    pub fn ranges(&self) -> Vec<(u64, u64, RangeState)> {
        self.ranges
            .iter()
            .map(|(start, state)| (*start, self.range_end(*start), *state))
            .collect()
    }

    /// Every byte is covered once and no two Free ranges touch
    pub fn is_consistent(&self) -> bool {
        let ranges = self.ranges();
        let covers = ranges.first().map(|r| r.0) == Some(0)
            && ranges.last().map(|r| r.1) == Some(self.size)
            && ranges.windows(2).all(|w| w[0].1 == w[1].0);
        let coalesced = ranges
            .windows(2)
            .all(|w| !(w[0].2 == RangeState::Free && w[1].2 == RangeState::Free));
        covers && coalesced
    }
}
