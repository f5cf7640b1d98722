//! Resource values: scalars, integer ranges, and label sets.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The type of a resource value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar,
    Ranges,
    Set,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Scalar => write!(f, "scalar"),
            ValueKind::Ranges => write!(f, "ranges"),
            ValueKind::Set => write!(f, "set"),
        }
    }
}

/// A set of disjoint closed integer intervals, kept canonical: sorted,
/// non-overlapping, with adjacent intervals merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    /// Builds a canonical range set from arbitrary intervals.
    ///
    /// Intervals are closed (`begin..=end`); overlapping and adjacent
    /// intervals are merged.
    pub fn new(intervals: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut intervals: Vec<(u64, u64)> = intervals
            .into_iter()
            .filter(|(begin, end)| begin <= end)
            .collect();
        intervals.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(intervals.len());
        for (begin, end) in intervals {
            match merged.last_mut() {
                // Merge overlapping or adjacent intervals.
                Some((_, last_end)) if begin <= last_end.saturating_add(1) => {
                    *last_end = (*last_end).max(end);
                }
                _ => merged.push((begin, end)),
            }
        }

        Self(merged)
    }

    /// Returns true if no integers are covered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of integers covered.
    pub fn size(&self) -> u64 {
        self.0.iter().map(|(begin, end)| end - begin + 1).sum()
    }

    /// The canonical intervals.
    pub fn intervals(&self) -> &[(u64, u64)] {
        &self.0
    }

    /// Returns true if every integer in `other` is covered by `self`.
    pub fn contains(&self, other: &Ranges) -> bool {
        other.0.iter().all(|&(begin, end)| {
            self.0
                .iter()
                .any(|&(sb, se)| sb <= begin && end <= se)
        })
    }

    /// Union of two range sets.
    pub fn union(&self, other: &Ranges) -> Ranges {
        Ranges::new(self.0.iter().chain(other.0.iter()).copied())
    }

    /// Removes every integer in `other` from `self`, saturating at empty.
    pub fn subtract(&self, other: &Ranges) -> Ranges {
        let mut result = self.0.clone();
        for &(begin, end) in &other.0 {
            let mut next = Vec::with_capacity(result.len() + 1);
            for (sb, se) in result {
                if end < sb || se < begin {
                    next.push((sb, se));
                    continue;
                }
                if sb < begin {
                    next.push((sb, begin - 1));
                }
                if end < se {
                    next.push((end + 1, se));
                }
            }
            result = next;
        }
        Ranges(result)
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (begin, end)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}-{}", begin, end)?;
        }
        write!(f, "]")
    }
}

/// The value of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Scalar(f64),
    Ranges(Ranges),
    Set(BTreeSet<String>),
}

impl Value {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Ranges(_) => ValueKind::Ranges,
            Value::Set(_) => ValueKind::Set,
        }
    }

    /// Returns true for a zero scalar, an empty range set, or an empty
    /// label set.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(value) => *value == 0.0,
            Value::Ranges(ranges) => ranges.is_empty(),
            Value::Set(set) => set.is_empty(),
        }
    }

    /// The scalar amount, if this is a scalar value.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(value) => {
                if value.fract() == 0.0 && value.abs() < 1e15 {
                    write!(f, "{}", *value as i64)
                } else {
                    write!(f, "{}", value)
                }
            }
            Value::Ranges(ranges) => write!(f, "{}", ranges),
            Value::Set(set) => {
                write!(f, "{{")?;
                for (i, item) in set.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_canonicalise() {
        let ranges = Ranges::new([(10, 20), (15, 25), (30, 40)]);
        assert_eq!(ranges.intervals(), &[(10, 25), (30, 40)]);
    }

    #[test]
    fn test_ranges_merge_adjacent() {
        let ranges = Ranges::new([(1, 5), (6, 10)]);
        assert_eq!(ranges.intervals(), &[(1, 10)]);
    }

    #[test]
    fn test_ranges_drop_inverted() {
        let ranges = Ranges::new([(5, 1)]);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_ranges_size() {
        let ranges = Ranges::new([(1, 10), (20, 21)]);
        assert_eq!(ranges.size(), 12);
    }

    #[test]
    fn test_ranges_contains() {
        let outer = Ranges::new([(1, 100)]);
        let inner = Ranges::new([(5, 10), (50, 60)]);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn test_ranges_subtract_splits() {
        let ranges = Ranges::new([(1, 10)]);
        let removed = ranges.subtract(&Ranges::new([(4, 6)]));
        assert_eq!(removed.intervals(), &[(1, 3), (7, 10)]);
    }

    #[test]
    fn test_ranges_subtract_saturates() {
        let ranges = Ranges::new([(1, 10)]);
        let removed = ranges.subtract(&Ranges::new([(0, 100)]));
        assert!(removed.is_empty());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Scalar(4.0).to_string(), "4");
        assert_eq!(Value::Scalar(0.5).to_string(), "0.5");
        assert_eq!(Value::Ranges(Ranges::new([(1, 3)])).to_string(), "[1-3]");

        let set: BTreeSet<String> = ["b".to_string(), "a".to_string()].into();
        assert_eq!(Value::Set(set).to_string(), "{a,b}");
    }
}
