//! Partial window state for one time range.

use super::SliceRange;

/// Partial state held by a slice.
///
/// Implementations must merge associatively: merging the partials of all
/// workers in any order yields the same state as building a single partial
/// from all records.
pub trait SliceState: Send + 'static {
    /// Folds `other` into `self`.
    fn merge(&mut self, other: Self)
    where
        Self: Sized;

    /// True if no record contributed to this state.
    fn is_empty(&self) -> bool;

    /// Number of records that contributed to this state.
    fn number_of_records(&self) -> u64;
}

/// A slice: a time range plus its partial state.
#[derive(Debug)]
pub struct Slice<S> {
    /// Covered time range.
    pub range: SliceRange,
    /// Partial state.
    pub state: S,
}

impl<S: SliceState> Slice<S> {
    /// Creates a slice.
    pub fn new(range: SliceRange, state: S) -> Self {
        Self { range, state }
    }

    /// Inclusive start.
    #[must_use]
    pub fn slice_start(&self) -> u64 {
        self.range.start
    }

    /// Exclusive end.
    #[must_use]
    pub fn slice_end(&self) -> u64 {
        self.range.end
    }
}
