//! Interval algebra over 32-bit integers
//!
//! An [`Interval`] is a set of `i32` values kept in canonical form: a sorted list of
//! disjoint, non-adjacent inclusive [`Range`]s. Equality and subset tests rely on this
//! form, so every constructor and operation preserves it.
//!
//! Error-return intervals, the intervals implied by branch conditions, and the
//! evidence attached to violation records are all instances of this type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IntervalError;
use crate::ir::Predicate;

/// Inclusive range `[low, high]` with `low <= high`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct Range {
    pub low: i32,
    pub high: i32,
}

#[derive(Deserialize)]
struct RawRange {
    low: i32,
    high: i32,
}

impl TryFrom<RawRange> for Range {
    type Error = IntervalError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        Range::try_new(raw.low, raw.high)
    }
}

impl Range {
    pub fn new(low: i32, high: i32) -> Self {
        assert!(low <= high, "malformed range [{}, {}]", low, high);
        Self { low, high }
    }

    pub fn try_new(low: i32, high: i32) -> Result<Self, IntervalError> {
        if low > high {
            return Err(IntervalError::InvertedRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn contains(&self, value: i32) -> bool {
        self.low <= value && value <= self.high
    }
}

/// Canonical set of `i32` values
///
/// Deserialized ranges are sorted and merged back into canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawInterval")]
pub struct Interval {
    ranges: Vec<Range>,
}

#[derive(Deserialize)]
struct RawInterval {
    ranges: Vec<Range>,
}

impl From<RawInterval> for Interval {
    fn from(raw: RawInterval) -> Self {
        Interval::from_ranges(raw.ranges)
    }
}

impl Interval {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn full() -> Self {
        Self::from_range(i32::MIN, i32::MAX)
    }

    pub fn singleton(value: i32) -> Self {
        Self::from_range(value, value)
    }

    pub fn from_range(low: i32, high: i32) -> Self {
        Self {
            ranges: vec![Range::new(low, high)],
        }
    }

    /// Build from arbitrary, possibly overlapping ranges
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range>) -> Self {
        let mut ranges: Vec<Range> = ranges.into_iter().collect();
        ranges.sort();
        Self {
            ranges: merge_sorted(ranges),
        }
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == Range::new(i32::MIN, i32::MAX)
    }

    pub fn contains(&self, value: i32) -> bool {
        self.ranges.iter().any(|r| r.contains(value))
    }

    pub fn lowest(&self) -> Option<i32> {
        self.ranges.first().map(|r| r.low)
    }

    pub fn highest(&self) -> Option<i32> {
        self.ranges.last().map(|r| r.high)
    }

    /// Number of values in the set
    pub fn size(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| (r.high as i64 - r.low as i64 + 1) as u64)
            .sum()
    }

    /// Narrow the set to the values `v` for which `v pred rhs` holds
    ///
    /// Unsigned predicates are evaluated with signed semantics.
    pub fn apply_predicate(&self, pred: Predicate, rhs: i32) -> Interval {
        let ranges = match pred {
            Predicate::Eq => {
                return if self.contains(rhs) {
                    Interval::singleton(rhs)
                } else {
                    Interval::empty()
                };
            }
            Predicate::Ne => self
                .ranges
                .iter()
                .flat_map(|r| {
                    if !r.contains(rhs) {
                        return vec![*r];
                    }
                    let mut parts = Vec::with_capacity(2);
                    if rhs > r.low {
                        parts.push(Range::new(r.low, rhs - 1));
                    }
                    if rhs < r.high {
                        parts.push(Range::new(rhs + 1, r.high));
                    }
                    parts
                })
                .collect(),
            Predicate::Slt | Predicate::Ult => match rhs.checked_sub(1) {
                Some(max) => self.clip(i32::MIN, max),
                None => Vec::new(),
            },
            Predicate::Sle | Predicate::Ule => self.clip(i32::MIN, rhs),
            Predicate::Sgt | Predicate::Ugt => match rhs.checked_add(1) {
                Some(min) => self.clip(min, i32::MAX),
                None => Vec::new(),
            },
            Predicate::Sge | Predicate::Uge => self.clip(rhs, i32::MAX),
        };
        Interval { ranges }
    }

    pub fn apply_predicate_in_place(&mut self, pred: Predicate, rhs: i32) {
        *self = self.apply_predicate(pred, rhs);
    }

    fn clip(&self, min: i32, max: i32) -> Vec<Range> {
        self.ranges
            .iter()
            .filter(|r| r.high >= min && r.low <= max)
            .map(|r| Range::new(r.low.max(min), r.high.min(max)))
            .collect()
    }

    pub fn union(&self, other: &Interval) -> Interval {
        let mut all = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() || j < other.ranges.len() {
            let take_left = match (self.ranges.get(i), other.ranges.get(j)) {
                (Some(a), Some(b)) => a <= b,
                (Some(_), None) => true,
                _ => false,
            };
            if take_left {
                all.push(self.ranges[i]);
                i += 1;
            } else {
                all.push(other.ranges[j]);
                j += 1;
            }
        }
        Interval {
            ranges: merge_sorted(all),
        }
    }

    pub fn union_in_place(&mut self, other: &Interval) {
        *self = self.union(other);
    }

    pub fn intersection(&self, other: &Interval) -> Interval {
        let mut ranges = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            let low = a.low.max(b.low);
            let high = a.high.min(b.high);
            if low <= high {
                ranges.push(Range::new(low, high));
            }
            if a.high < b.high {
                i += 1;
            } else {
                j += 1;
            }
        }
        Interval { ranges }
    }

    pub fn intersect_in_place(&mut self, other: &Interval) {
        *self = self.intersection(other);
    }

    /// Values not in the set
    ///
    /// # Panics
    /// If the interval is empty or full.
    pub fn complement(&self) -> Interval {
        assert!(
            !self.is_empty() && !self.is_full(),
            "complement of a trivial interval {}",
            self
        );
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        let mut next = Some(i32::MIN);
        for r in &self.ranges {
            if let Some(start) = next
                && r.low > start
            {
                ranges.push(Range::new(start, r.low - 1));
            }
            next = r.high.checked_add(1);
        }
        if let Some(start) = next {
            ranges.push(Range::new(start, i32::MAX));
        }
        Interval { ranges }
    }

    pub fn is_subset_of(&self, other: &Interval) -> bool {
        self.intersection(other) == *self
    }

    /// Sign convention of the set
    ///
    /// `0` for `{0}`, `-1` when every value is `<= 0`, `1` when every value is `>= 0`,
    /// and `0` for mixed or empty sets.
    pub fn signedness(&self) -> i8 {
        if self.is_empty() || *self == Interval::singleton(0) {
            0
        } else if self.ranges.iter().all(|r| r.high <= 0) {
            -1
        } else if self.ranges.iter().all(|r| r.low >= 0) {
            1
        } else {
            0
        }
    }
}

/// Merge overlapping and adjacent ranges of a list sorted by `low`
fn merge_sorted(sorted: Vec<Range>) -> Vec<Range> {
    let mut merged: Vec<Range> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match merged.last_mut() {
            Some(last) if (r.low as i64) <= last.high as i64 + 1 => {
                last.high = last.high.max(r.high);
            }
            _ => merged.push(r),
        }
    }
    merged
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "empty");
        }
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, " U ")?;
            }
            write!(f, "[{}, {}]", r.low, r.high)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
