//! Mapping timestamps to slices and slices to windows.

use smallvec::SmallVec;

use super::{WindowError, WindowInfo};
use crate::time::Timestamp;

/// Half-open time range `[start, end)` of one slice.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct SliceRange {
    /// Inclusive start.
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
}

impl SliceRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Key ordering slices by end first.
    #[must_use]
    pub const fn key(self) -> (u64, u64) {
        (self.end, self.start)
    }

    /// True if `ts` falls into the range.
    #[must_use]
    pub const fn contains(self, ts: u64) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// How records are partitioned before windows are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WindowingStrategy {
    /// Non-overlapping slices between consecutive window boundaries. Each
    /// record lands in exactly one slice; windows combine several slices.
    #[default]
    Slicing,
    /// One slice per window; a record lands in every window containing it.
    /// Used for joins, where combining partial slices is not meaningful.
    Bucketing,
}

/// Small collection of slices; one for slicing, a few for sliding buckets.
pub type SliceRangeVec = SmallVec<[SliceRange; 4]>;

/// Small collection of windows.
pub type WindowInfoVec = SmallVec<[WindowInfo; 4]>;

/// Assigns timestamps to slices for tumbling (`size == slide`) and sliding
/// (`slide < size`) windows.
///
/// # Example
///
/// ```rust
/// use slipstream_core::window::{SliceAssigner, SliceRange};
///
/// // 10ms windows every 4ms: boundaries 0,4,8,10,12,14,...
/// let assigner = SliceAssigner::sliding(10, 4).unwrap();
/// assert_eq!(assigner.slice_for(11), SliceRange::new(10, 12));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
    strategy: WindowingStrategy,
}

impl SliceAssigner {
    /// Tumbling windows of `size` ms.
    ///
    /// # Errors
    ///
    /// [`WindowError::InvalidWindow`] for a zero size.
    pub fn tumbling(size: u64) -> Result<Self, WindowError> {
        Self::sliding(size, size)
    }

    /// Sliding windows of `size` ms starting every `slide` ms.
    ///
    /// # Errors
    ///
    /// [`WindowError::InvalidWindow`] if either is zero or `slide > size`.
    pub fn sliding(size: u64, slide: u64) -> Result<Self, WindowError> {
        if size == 0 || slide == 0 || slide > size {
            return Err(WindowError::InvalidWindow { size, slide });
        }
        Ok(Self {
            size,
            slide,
            strategy: WindowingStrategy::Slicing,
        })
    }

    /// Switches the partitioning strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: WindowingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Window size in ms.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Window slide in ms.
    #[must_use]
    pub const fn slide(&self) -> u64 {
        self.slide
    }

    /// Partitioning strategy.
    #[must_use]
    pub const fn strategy(&self) -> WindowingStrategy {
        self.strategy
    }

    /// Start of the slice containing `ts`: the later of the previous slide
    /// start and the previous window end.
    #[must_use]
    pub fn slice_start(&self, ts: u64) -> u64 {
        let prev_slide_start = ts - ts % self.slide;
        let prev_window_end = if ts < self.size {
            prev_slide_start
        } else {
            ts - (ts - self.size) % self.slide
        };
        prev_slide_start.max(prev_window_end)
    }

    /// End of the slice containing `ts`: the earlier of the next slide start
    /// and the next window end.
    #[must_use]
    pub fn slice_end(&self, ts: u64) -> u64 {
        let next_slide_start = ts.saturating_add(self.slide - ts % self.slide);
        let next_window_end = if ts < self.size {
            self.size
        } else {
            ts.saturating_add(self.slide - (ts - self.size) % self.slide)
        };
        next_slide_start.min(next_window_end)
    }

    /// The slicing-strategy slice containing `ts`.
    #[must_use]
    pub fn slice_for(&self, ts: u64) -> SliceRange {
        SliceRange::new(self.slice_start(ts), self.slice_end(ts))
    }

    /// Slices a record at `ts` belongs to under the configured strategy.
    #[must_use]
    pub fn slices_for(&self, ts: u64) -> SliceRangeVec {
        match self.strategy {
            WindowingStrategy::Slicing => smallvec::smallvec![self.slice_for(ts)],
            WindowingStrategy::Bucketing => self
                .windows_containing(ts)
                .into_iter()
                .map(|w| SliceRange::new(w.window_start, w.window_end))
                .collect(),
        }
    }

    /// All windows containing `ts`, oldest first.
    #[must_use]
    pub fn windows_containing(&self, ts: u64) -> WindowInfoVec {
        let last_start = ts - ts % self.slide;
        let mut windows = WindowInfoVec::new();
        let mut start = Some(last_start);
        while let Some(ws) = start {
            if ws.saturating_add(self.size) <= ts {
                break;
            }
            windows.push(WindowInfo::new(ws, ws.saturating_add(self.size)));
            start = ws.checked_sub(self.slide);
        }
        windows.reverse();
        windows
    }

    /// Windows that cover `slice` completely, oldest first.
    #[must_use]
    pub fn windows_for_slice(&self, slice: SliceRange) -> WindowInfoVec {
        if self.strategy == WindowingStrategy::Bucketing {
            return smallvec::smallvec![WindowInfo::new(slice.start, slice.end)];
        }
        let last_start = slice.start - slice.start % self.slide;
        let mut windows = WindowInfoVec::new();
        let mut start = Some(last_start);
        while let Some(ws) = start {
            if ws.saturating_add(self.size) < slice.end {
                break;
            }
            windows.push(WindowInfo::new(ws, ws.saturating_add(self.size)));
            start = ws.checked_sub(self.slide);
        }
        windows.reverse();
        windows
    }

    /// True once every window that may contain `slice` has ended at
    /// `watermark`.
    #[must_use]
    pub fn is_slice_expired(&self, slice: SliceRange, watermark: Timestamp) -> bool {
        slice.start.saturating_add(self.size) <= watermark.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_slices() {
        let assigner = SliceAssigner::tumbling(10).unwrap();
        assert_eq!(assigner.slice_for(0), SliceRange::new(0, 10));
        assert_eq!(assigner.slice_for(9), SliceRange::new(0, 10));
        assert_eq!(assigner.slice_for(15), SliceRange::new(10, 20));
        assert_eq!(
            assigner.windows_for_slice(SliceRange::new(10, 20)).as_slice(),
            &[WindowInfo::new(10, 20)]
        );
    }

    #[test]
    fn test_sliding_slices() {
        let assigner = SliceAssigner::sliding(10, 4).unwrap();
        // boundaries: 0 4 8 10 12 14 16 18 20 ...
        assert_eq!(assigner.slice_for(3), SliceRange::new(0, 4));
        assert_eq!(assigner.slice_for(9), SliceRange::new(8, 10));
        assert_eq!(assigner.slice_for(11), SliceRange::new(10, 12));
        assert_eq!(assigner.slice_for(13), SliceRange::new(12, 14));
        assert_eq!(
            assigner.windows_for_slice(SliceRange::new(10, 12)).as_slice(),
            &[WindowInfo::new(4, 14), WindowInfo::new(8, 18)]
        );
        assert_eq!(
            assigner.windows_for_slice(SliceRange::new(0, 4)).as_slice(),
            &[WindowInfo::new(0, 10)]
        );
    }

    #[test]
    fn test_slices_tile_windows() {
        let assigner = SliceAssigner::sliding(10, 4).unwrap();
        // every ts in [8, 18) must land in a slice that reports window [8, 18)
        for ts in 8..18 {
            let slice = assigner.slice_for(ts);
            assert!(slice.contains(ts));
            assert!(assigner
                .windows_for_slice(slice)
                .contains(&WindowInfo::new(8, 18)));
        }
    }

    #[test]
    fn test_bucketing() {
        let assigner = SliceAssigner::sliding(10, 5)
            .unwrap()
            .with_strategy(WindowingStrategy::Bucketing);
        assert_eq!(
            assigner.slices_for(12).as_slice(),
            &[SliceRange::new(5, 15), SliceRange::new(10, 20)]
        );
        assert_eq!(assigner.slices_for(3).as_slice(), &[SliceRange::new(0, 10)]);
    }

    #[test]
    fn test_invalid_windows() {
        assert!(SliceAssigner::tumbling(0).is_err());
        assert!(SliceAssigner::sliding(10, 0).is_err());
        assert!(SliceAssigner::sliding(10, 20).is_err());
    }

    #[test]
    fn test_slice_expiry() {
        let assigner = SliceAssigner::sliding(10, 4).unwrap();
        let slice = SliceRange::new(10, 12);
        assert!(!assigner.is_slice_expired(slice, Timestamp(19)));
        assert!(assigner.is_slice_expired(slice, Timestamp(20)));
    }
}
