//! Slice stores: per-worker filling, staging and the merged global view.

use std::collections::BTreeMap;

use tracing::debug;

use super::{Slice, SliceRange, SliceState, WindowInfo};
use crate::time::Timestamp;

/// Slices owned by one worker thread.
///
/// Slices are created lazily on the first record. Once the trigger pass has
/// staged all slices ending at or before a watermark, records for those
/// slices are late and rejected.
#[derive(Debug)]
pub struct ThreadLocalSliceStore<S> {
    slices: BTreeMap<(u64, u64), S>,
    last_staged: Timestamp,
}

impl<S> Default for ThreadLocalSliceStore<S> {
    fn default() -> Self {
        Self {
            slices: BTreeMap::new(),
            last_staged: Timestamp::MIN,
        }
    }
}

impl<S: SliceState> ThreadLocalSliceStore<S> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `range`, creating it with `factory` if needed.
    ///
    /// Returns `None` if the slice was already staged; the record is late.
    pub fn find_or_create(
        &mut self,
        range: SliceRange,
        factory: impl FnOnce() -> S,
    ) -> Option<&mut S> {
        if range.end <= self.last_staged.0 {
            return None;
        }
        Some(self.slices.entry(range.key()).or_insert_with(factory))
    }

    /// Removes all slices ending at or before `watermark`, oldest first.
    pub fn take_slices_before(&mut self, watermark: Timestamp) -> Vec<Slice<S>> {
        let mut taken = Vec::new();
        while let Some((&(end, _), _)) = self.slices.first_key_value() {
            if end > watermark.0 {
                break;
            }
            if let Some(((end, start), state)) = self.slices.pop_first() {
                taken.push(Slice::new(SliceRange::new(start, end), state));
            }
        }
        self.last_staged = self.last_staged.max(watermark);
        taken
    }

    /// Removes every slice.
    pub fn take_all(&mut self) -> Vec<Slice<S>> {
        std::mem::take(&mut self.slices)
            .into_iter()
            .map(|((end, start), state)| Slice::new(SliceRange::new(start, end), state))
            .collect()
    }

    /// Watermark up to which slices were staged.
    #[must_use]
    pub fn last_staged(&self) -> Timestamp {
        self.last_staged
    }

    /// Number of slices held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// True if no slice is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Iterates over held slices, ordered by end.
    pub fn iter(&self) -> impl Iterator<Item = (SliceRange, &S)> {
        self.slices
            .iter()
            .map(|(&(end, start), state)| (SliceRange::new(start, end), state))
    }

    pub(crate) fn restore(&mut self, last_staged: Timestamp, slices: Vec<Slice<S>>) {
        self.last_staged = self.last_staged.max(last_staged);
        for slice in slices {
            self.insert_merged(slice);
        }
    }

    fn insert_merged(&mut self, slice: Slice<S>) {
        match self.slices.entry(slice.range.key()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge(slice.state);
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(slice.state);
            }
        }
    }
}

/// Partial slices collected from all workers, combined per slice.
#[derive(Debug)]
pub struct SliceStaging<S> {
    partials: BTreeMap<(u64, u64), S>,
}

impl<S> Default for SliceStaging<S> {
    fn default() -> Self {
        Self {
            partials: BTreeMap::new(),
        }
    }
}

impl<S: SliceState> SliceStaging<S> {
    /// Creates an empty staging area.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one worker's partial, merging with partials of the same slice.
    pub fn add(&mut self, slice: Slice<S>) {
        match self.partials.entry(slice.range.key()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge(slice.state);
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(slice.state);
            }
        }
    }

    /// Removes every combined slice, ordered by end.
    pub fn take_all(&mut self) -> Vec<Slice<S>> {
        std::mem::take(&mut self.partials)
            .into_iter()
            .map(|((end, start), state)| Slice::new(SliceRange::new(start, end), state))
            .collect()
    }

    /// Number of distinct staged slices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partials.len()
    }

    /// True if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }
}

/// Trigger state of a window in the global store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowState {
    /// Receiving slices.
    Filling,
    /// A first termination request saw the window; the next one emits it.
    OnceSeenDuringTermination,
    /// Emitted. Never emitted again.
    EmittedToProbe,
}

impl WindowState {
    pub(crate) fn to_raw(self) -> u8 {
        match self {
            Self::Filling => 0,
            Self::OnceSeenDuringTermination => 1,
            Self::EmittedToProbe => 2,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Filling),
            1 => Some(Self::OnceSeenDuringTermination),
            2 => Some(Self::EmittedToProbe),
            _ => None,
        }
    }
}

/// Merged slices of all workers and the windows they belong to.
#[derive(Debug)]
pub struct GlobalSliceStore<S> {
    slices: BTreeMap<(u64, u64), S>,
    windows: BTreeMap<(u64, u64), WindowState>,
}

impl<S> Default for GlobalSliceStore<S> {
    fn default() -> Self {
        Self {
            slices: BTreeMap::new(),
            windows: BTreeMap::new(),
        }
    }
}

impl<S: SliceState> GlobalSliceStore<S> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a staged slice and registers the windows covering it.
    pub fn merge_slice(&mut self, slice: Slice<S>, windows: &[WindowInfo]) {
        for window in windows {
            let state = self.windows.entry(window.key()).or_insert(WindowState::Filling);
            if *state == WindowState::EmittedToProbe {
                debug!(window = %window, "slice merged after its window was emitted");
            }
        }
        match self.slices.entry(slice.range.key()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                entry.get_mut().merge(slice.state);
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(slice.state);
            }
        }
    }

    /// Windows ending at or before `watermark` that were not emitted yet,
    /// ordered by end.
    #[must_use]
    pub fn triggerable(&self, watermark: Timestamp) -> Vec<WindowInfo> {
        self.windows
            .range(..=(watermark.0, u64::MAX))
            .filter(|(_, state)| **state != WindowState::EmittedToProbe)
            .map(|(&(end, start), _)| WindowInfo::new(start, end))
            .collect()
    }

    /// Windows to emit at termination.
    ///
    /// A non-final pass only marks open windows as seen and returns nothing;
    /// the final pass returns every window not emitted yet.
    pub fn termination_candidates(&mut self, final_pass: bool) -> Vec<WindowInfo> {
        let mut candidates = Vec::new();
        for (&(end, start), state) in &mut self.windows {
            match (*state, final_pass) {
                (WindowState::EmittedToProbe, _) => {}
                (_, true) => candidates.push(WindowInfo::new(start, end)),
                (_, false) => *state = WindowState::OnceSeenDuringTermination,
            }
        }
        candidates
    }

    /// Records that `window` was emitted; it is never returned again.
    pub fn mark_emitted(&mut self, window: WindowInfo) {
        if let Some(state) = self.windows.get_mut(&window.key()) {
            *state = WindowState::EmittedToProbe;
        }
    }

    /// Merged slices covered by `window`, ordered by end.
    #[must_use]
    pub fn slices_for_window(&self, window: WindowInfo) -> Vec<&S> {
        let lower = (window.window_start.saturating_add(1), 0);
        let upper = (window.window_end, u64::MAX);
        self.slices
            .range(lower..=upper)
            .filter(|((_, start), _)| *start >= window.window_start)
            .map(|(_, state)| state)
            .collect()
    }

    /// Drops emitted windows ending at or before `watermark` and slices no
    /// window of length `window_size` can still need.
    pub fn garbage_collect(&mut self, watermark: Timestamp, window_size: u64) {
        self.windows
            .retain(|&(end, _), state| !(end <= watermark.0 && *state == WindowState::EmittedToProbe));
        self.slices
            .retain(|&(_, start), _| start.saturating_add(window_size) > watermark.0);
    }

    /// Drops all windows and slices.
    pub fn clear(&mut self) {
        self.windows.clear();
        self.slices.clear();
    }

    /// State of a window, if known.
    #[must_use]
    pub fn window_state(&self, window: WindowInfo) -> Option<WindowState> {
        self.windows.get(&window.key()).copied()
    }

    /// Number of merged slices.
    #[must_use]
    pub fn number_of_slices(&self) -> usize {
        self.slices.len()
    }

    /// Number of tracked windows.
    #[must_use]
    pub fn number_of_windows(&self) -> usize {
        self.windows.len()
    }

    /// Iterates over merged slices, ordered by end.
    pub fn slices(&self) -> impl Iterator<Item = (SliceRange, &S)> {
        self.slices
            .iter()
            .map(|(&(end, start), state)| (SliceRange::new(start, end), state))
    }

    /// Iterates over tracked windows, ordered by end.
    pub fn windows(&self) -> impl Iterator<Item = (WindowInfo, WindowState)> + '_ {
        self.windows
            .iter()
            .map(|(&(end, start), state)| (WindowInfo::new(start, end), *state))
    }

    pub(crate) fn restore_window(&mut self, window: WindowInfo, state: WindowState) {
        self.windows.insert(window.key(), state);
    }

    pub(crate) fn restore_slice(&mut self, slice: Slice<S>) {
        self.slices.insert(slice.range.key(), slice.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::slice::tests::Counter;

    fn slice(start: u64, end: u64, count: u64) -> Slice<Counter> {
        Slice::new(SliceRange::new(start, end), Counter(count))
    }

    #[test]
    fn test_local_store_rejects_late_records() {
        let mut store = ThreadLocalSliceStore::<Counter>::new();
        store.find_or_create(SliceRange::new(0, 10), Counter::default).unwrap().0 += 1;
        store.find_or_create(SliceRange::new(10, 20), Counter::default).unwrap().0 += 1;

        let taken = store.take_slices_before(Timestamp(10));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].range, SliceRange::new(0, 10));
        assert_eq!(store.len(), 1);

        assert!(store.find_or_create(SliceRange::new(0, 10), Counter::default).is_none());
        assert!(store.find_or_create(SliceRange::new(10, 20), Counter::default).is_some());
    }

    #[test]
    fn test_staging_merges_partials() {
        let mut staging = SliceStaging::new();
        staging.add(slice(0, 10, 2));
        staging.add(slice(0, 10, 3));
        staging.add(slice(10, 20, 1));
        let slices = staging.take_all();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].state, Counter(5));
        assert!(staging.is_empty());
    }

    #[test]
    fn test_trigger_exactly_once() {
        let mut store = GlobalSliceStore::new();
        store.merge_slice(slice(0, 10, 4), &[WindowInfo::new(0, 10)]);
        store.merge_slice(slice(10, 20, 1), &[WindowInfo::new(10, 20)]);

        assert_eq!(store.triggerable(Timestamp(15)), vec![WindowInfo::new(0, 10)]);
        // still pending until marked
        assert_eq!(store.triggerable(Timestamp(15)), vec![WindowInfo::new(0, 10)]);
        store.mark_emitted(WindowInfo::new(0, 10));
        assert!(store.triggerable(Timestamp(15)).is_empty());
        assert_eq!(
            store.window_state(WindowInfo::new(0, 10)),
            Some(WindowState::EmittedToProbe)
        );
        assert_eq!(store.triggerable(Timestamp(20)), vec![WindowInfo::new(10, 20)]);
    }

    #[test]
    fn test_slices_for_sliding_window() {
        let mut store = GlobalSliceStore::new();
        // size 10, slide 4: window [4, 14) covers [4,8) [8,10) [10,12) [12,14)
        for (start, end) in [(0, 4), (4, 8), (8, 10), (10, 12), (12, 14), (14, 16)] {
            store.merge_slice(slice(start, end, 1), &[]);
        }
        assert_eq!(store.slices_for_window(WindowInfo::new(4, 14)).len(), 4);
        assert_eq!(store.slices_for_window(WindowInfo::new(0, 10)).len(), 3);
    }

    #[test]
    fn test_garbage_collect() {
        let mut store = GlobalSliceStore::new();
        store.merge_slice(slice(0, 4, 1), &[WindowInfo::new(0, 10)]);
        store.merge_slice(slice(4, 8, 1), &[WindowInfo::new(0, 10), WindowInfo::new(4, 14)]);
        store.mark_emitted(WindowInfo::new(0, 10));
        store.garbage_collect(Timestamp(10), 10);
        assert_eq!(store.number_of_slices(), 1);
        assert_eq!(store.number_of_windows(), 1);
        assert_eq!(
            store.window_state(WindowInfo::new(4, 14)),
            Some(WindowState::Filling)
        );
    }

    #[test]
    fn test_termination_passes() {
        let mut store = GlobalSliceStore::new();
        store.merge_slice(slice(0, 10, 1), &[WindowInfo::new(0, 10)]);
        store.merge_slice(slice(10, 20, 1), &[WindowInfo::new(10, 20)]);
        store.mark_emitted(WindowInfo::new(0, 10));

        assert!(store.termination_candidates(false).is_empty());
        assert_eq!(
            store.window_state(WindowInfo::new(10, 20)),
            Some(WindowState::OnceSeenDuringTermination)
        );
        assert_eq!(store.termination_candidates(true), vec![WindowInfo::new(10, 20)]);
        store.mark_emitted(WindowInfo::new(10, 20));
        assert!(store.termination_candidates(true).is_empty());
    }
}
