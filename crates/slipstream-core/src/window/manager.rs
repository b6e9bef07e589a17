//! Coordination of thread-local stores, staging and the global store.

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{
    GlobalSliceStore, LateRecordMetrics, Slice, SliceAssigner, SliceRange, SliceStaging,
    SliceState, ThreadLocalSliceStore, TriggeredWindow, WindowError, WindowInfo, WindowState,
};
use crate::identifiers::{OriginId, WorkerThreadId};
use crate::pipeline::QueryTerminationType;
use crate::sequence::{SequenceData, INITIAL_SEQUENCE_NUMBER};
use crate::state::StateError;
use crate::time::{MultiOriginWatermarkProcessor, Timestamp, WatermarkSnapshot};

/// Callback invoked for every window being emitted.
///
/// Receives the window and its non-empty merged slices. Returns whether
/// output was produced; only then is the window's sequence number consumed.
pub type EmitWindow<'a, S> = dyn FnMut(&TriggeredWindow, &[&S]) -> Result<bool, WindowError> + 'a;

#[derive(Debug)]
struct TriggerState<S> {
    staging: SliceStaging<S>,
    global: GlobalSliceStore<S>,
    last_triggered: Timestamp,
    next_output_sequence: u64,
}

/// Serialized slice state.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct SliceSnapshot {
    start: u64,
    end: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct LocalSnapshot {
    last_staged: u64,
    slices: Vec<SliceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct WindowSnapshot {
    start: u64,
    end: u64,
    state: u8,
}

/// Complete state of a [`WindowSliceManager`], independent of the slice type.
#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ManagerSnapshot {
    size: u64,
    slide: u64,
    watermarks: WatermarkSnapshot,
    last_triggered: u64,
    next_output_sequence: u64,
    late_records: u64,
    locals: Vec<LocalSnapshot>,
    global_slices: Vec<SliceSnapshot>,
    windows: Vec<WindowSnapshot>,
}

impl ManagerSnapshot {
    /// Number of slices across all stores.
    #[must_use]
    pub fn number_of_slices(&self) -> usize {
        self.global_slices.len() + self.locals.iter().map(|l| l.slices.len()).sum::<usize>()
    }
}

/// Slice stores and watermark tracking of one windowed operator.
///
/// Workers build into their own [`ThreadLocalSliceStore`] under a lock that
/// is only contended by the trigger pass. A single trigger lock serialises
/// stage, merge, trigger and garbage collection, so every window is emitted
/// exactly once and in order of its end.
pub struct WindowSliceManager<S> {
    assigner: SliceAssigner,
    locals: Vec<Mutex<ThreadLocalSliceStore<S>>>,
    trigger: Mutex<TriggerState<S>>,
    watermarks: MultiOriginWatermarkProcessor,
    late: LateRecordMetrics,
}

impl<S> std::fmt::Debug for WindowSliceManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowSliceManager")
            .field("assigner", &self.assigner)
            .field("workers", &self.locals.len())
            .field("watermark", &self.watermarks.current_watermark())
            .field("late_records", &self.late.dropped())
            .finish_non_exhaustive()
    }
}

impl<S: SliceState> WindowSliceManager<S> {
    /// Creates a manager for `workers` threads fed by `origins`.
    #[must_use]
    pub fn new(assigner: SliceAssigner, workers: usize, origins: &[OriginId]) -> Self {
        Self {
            assigner,
            locals: (0..workers.max(1))
                .map(|_| Mutex::new(ThreadLocalSliceStore::new()))
                .collect(),
            trigger: Mutex::new(TriggerState {
                staging: SliceStaging::new(),
                global: GlobalSliceStore::new(),
                last_triggered: Timestamp::MIN,
                next_output_sequence: INITIAL_SEQUENCE_NUMBER,
            }),
            watermarks: MultiOriginWatermarkProcessor::new(origins),
            late: LateRecordMetrics::new(),
        }
    }

    /// Slice assigner.
    #[must_use]
    pub fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    /// Number of thread-local stores.
    #[must_use]
    pub fn number_of_workers(&self) -> usize {
        self.locals.len()
    }

    /// Watermark processor over the input origins.
    #[must_use]
    pub fn watermarks(&self) -> &MultiOriginWatermarkProcessor {
        &self.watermarks
    }

    /// Late record counters.
    #[must_use]
    pub fn late_records(&self) -> &LateRecordMetrics {
        &self.late
    }

    /// Runs `f` on the store of `worker`.
    ///
    /// Worker ids beyond the configured count wrap around.
    pub fn with_local<R>(
        &self,
        worker: WorkerThreadId,
        f: impl FnOnce(&mut ThreadLocalSliceStore<S>) -> R,
    ) -> R {
        let index = worker.0 % self.locals.len();
        f(&mut *self.locals[index].lock())
    }

    /// Applies a watermark update and emits every window it completes.
    ///
    /// Returns the number of windows that produced output.
    ///
    /// # Errors
    ///
    /// Unknown origins and errors returned by `emit`.
    pub fn update_and_trigger(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
        emit: &mut EmitWindow<'_, S>,
    ) -> Result<usize, WindowError> {
        let current = self.watermarks.update_watermark(watermark, sequence, origin)?;
        let mut trigger = self.trigger.lock();
        if current <= trigger.last_triggered {
            return Ok(0);
        }
        trace!(watermark = %current, "trigger pass");

        self.stage(&mut trigger, |store| store.take_slices_before(current));
        let windows = trigger.global.triggerable(current);
        // a failed pass is retried by the next update
        let emitted = Self::emit_windows(&mut trigger, windows, emit)?;
        trigger.global.garbage_collect(current, self.assigner.size());
        trigger.last_triggered = current;
        Ok(emitted)
    }

    /// Emits every window ending at or before `until`, ignoring watermarks.
    ///
    /// # Errors
    ///
    /// Errors returned by `emit`.
    pub fn flush_until(&self, until: Timestamp, emit: &mut EmitWindow<'_, S>) -> Result<usize, WindowError> {
        let mut trigger = self.trigger.lock();
        self.stage(&mut trigger, |store| store.take_slices_before(until));
        let windows = trigger.global.triggerable(until);
        let emitted = Self::emit_windows(&mut trigger, windows, emit)?;
        trigger.global.garbage_collect(until, self.assigner.size());
        trigger.last_triggered = trigger.last_triggered.max(until);
        Ok(emitted)
    }

    /// Handles query termination.
    ///
    /// Graceful and hard stops stage every remaining slice. A non-final pass
    /// only marks open windows; the final pass emits them. A failure discards
    /// all state without emitting.
    ///
    /// # Errors
    ///
    /// Errors returned by `emit`.
    pub fn drain(
        &self,
        termination: QueryTerminationType,
        final_pass: bool,
        emit: &mut EmitWindow<'_, S>,
    ) -> Result<usize, WindowError> {
        if termination == QueryTerminationType::Failure {
            let discarded = self.reset();
            warn!(slices = discarded, "query failed, discarding window state");
            return Ok(0);
        }
        let mut trigger = self.trigger.lock();
        self.stage(&mut trigger, ThreadLocalSliceStore::take_all);
        let windows = trigger.global.termination_candidates(final_pass);
        let emitted = Self::emit_windows(&mut trigger, windows, emit)?;
        if final_pass {
            trigger.global.clear();
            debug!(windows = emitted, "drained window state");
        }
        Ok(emitted)
    }

    /// Drops all slices and windows. Returns the number of slices dropped.
    pub fn reset(&self) -> usize {
        let mut trigger = self.trigger.lock();
        let mut dropped = trigger.global.number_of_slices() + trigger.staging.len();
        trigger.global.clear();
        trigger.staging.take_all();
        for local in &self.locals {
            dropped += local.lock().take_all().len();
        }
        dropped
    }

    /// Sequence number the next emitted window receives.
    #[must_use]
    pub fn next_output_sequence(&self) -> u64 {
        self.trigger.lock().next_output_sequence
    }

    /// Number of merged slices in the global store.
    #[must_use]
    pub fn number_of_global_slices(&self) -> usize {
        self.trigger.lock().global.number_of_slices()
    }

    fn stage(
        &self,
        trigger: &mut TriggerState<S>,
        mut take: impl FnMut(&mut ThreadLocalSliceStore<S>) -> Vec<Slice<S>>,
    ) {
        for local in &self.locals {
            for slice in take(&mut *local.lock()) {
                trigger.staging.add(slice);
            }
        }
        for slice in trigger.staging.take_all() {
            let windows = self.assigner.windows_for_slice(slice.range);
            trigger.global.merge_slice(slice, &windows);
        }
    }

    fn emit_windows(
        trigger: &mut TriggerState<S>,
        windows: Vec<WindowInfo>,
        emit: &mut EmitWindow<'_, S>,
    ) -> Result<usize, WindowError> {
        let TriggerState {
            global,
            next_output_sequence,
            ..
        } = trigger;
        let mut emitted = 0;
        for info in windows {
            let slices: Vec<&S> = global
                .slices_for_window(info)
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect();
            if slices.is_empty() {
                trace!(window = %info, "skipping empty window");
                global.mark_emitted(info);
                continue;
            }
            let window = TriggeredWindow {
                info,
                sequence_number: *next_output_sequence,
            };
            if emit(&window, &slices)? {
                *next_output_sequence += 1;
                emitted += 1;
            }
            global.mark_emitted(info);
        }
        Ok(emitted)
    }

    /// Captures the complete state, encoding slices with `encode`.
    ///
    /// # Errors
    ///
    /// Errors returned by `encode`.
    pub fn export(
        &self,
        encode: impl Fn(&S) -> Result<Vec<u8>, StateError>,
    ) -> Result<ManagerSnapshot, StateError> {
        let trigger = self.trigger.lock();
        let snapshot_slice = |range: SliceRange, state: &S| -> Result<SliceSnapshot, StateError> {
            Ok(SliceSnapshot {
                start: range.start,
                end: range.end,
                payload: encode(state)?,
            })
        };
        let mut locals = Vec::with_capacity(self.locals.len());
        for local in &self.locals {
            let local = local.lock();
            locals.push(LocalSnapshot {
                last_staged: local.last_staged().0,
                slices: local
                    .iter()
                    .map(|(range, state)| snapshot_slice(range, state))
                    .collect::<Result<_, _>>()?,
            });
        }
        Ok(ManagerSnapshot {
            size: self.assigner.size(),
            slide: self.assigner.slide(),
            watermarks: self.watermarks.snapshot(),
            last_triggered: trigger.last_triggered.0,
            next_output_sequence: trigger.next_output_sequence,
            late_records: self.late.dropped(),
            locals,
            global_slices: trigger
                .global
                .slices()
                .map(|(range, state)| snapshot_slice(range, state))
                .collect::<Result<_, _>>()?,
            windows: trigger
                .global
                .windows()
                .map(|(info, state)| WindowSnapshot {
                    start: info.window_start,
                    end: info.window_end,
                    state: state.to_raw(),
                })
                .collect(),
        })
    }

    /// Replaces the state with `snapshot`, decoding slices with `decode`.
    ///
    /// Thread-local slices are distributed round-robin when the worker count
    /// differs from the exporting manager's.
    ///
    /// # Errors
    ///
    /// [`StateError::Mismatch`] if the window definition differs, plus errors
    /// from `decode` and unknown origins.
    pub fn import(
        &self,
        snapshot: ManagerSnapshot,
        decode: impl Fn(&[u8]) -> Result<S, StateError>,
    ) -> Result<(), WindowError> {
        if snapshot.size != self.assigner.size() || snapshot.slide != self.assigner.slide() {
            return Err(StateError::Mismatch(format!(
                "window size {}/{} does not match {}/{}",
                snapshot.size,
                snapshot.slide,
                self.assigner.size(),
                self.assigner.slide()
            ))
            .into());
        }
        let to_slice = |s: SliceSnapshot| -> Result<Slice<S>, StateError> {
            Ok(Slice::new(SliceRange::new(s.start, s.end), decode(&s.payload)?))
        };
        let mut windows = Vec::with_capacity(snapshot.windows.len());
        for w in &snapshot.windows {
            let state = WindowState::from_raw(w.state)
                .ok_or_else(|| StateError::Mismatch(format!("unknown window state {}", w.state)))?;
            windows.push((WindowInfo::new(w.start, w.end), state));
        }
        let global_slices = snapshot
            .global_slices
            .into_iter()
            .map(to_slice)
            .collect::<Result<Vec<_>, _>>()?;
        let mut locals = Vec::with_capacity(snapshot.locals.len());
        for local in snapshot.locals {
            let slices = local
                .slices
                .into_iter()
                .map(to_slice)
                .collect::<Result<Vec<_>, _>>()?;
            locals.push((Timestamp(local.last_staged), slices));
        }
        self.watermarks.restore(snapshot.watermarks)?;

        self.reset();
        let mut trigger = self.trigger.lock();
        trigger.last_triggered = Timestamp(snapshot.last_triggered);
        trigger.next_output_sequence = snapshot.next_output_sequence;
        for (info, state) in windows {
            trigger.global.restore_window(info, state);
        }
        for slice in global_slices {
            trigger.global.restore_slice(slice);
        }
        for (i, (last_staged, slices)) in locals.into_iter().enumerate() {
            self.locals[i % self.locals.len()]
                .lock()
                .restore(last_staged, slices);
        }
        self.late.reset();
        self.late.record_dropped(snapshot.late_records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::window::slice::tests::Counter;

    fn build(manager: &WindowSliceManager<Counter>, worker: usize, ts: u64) -> bool {
        let range = manager.assigner().slice_for(ts);
        manager.with_local(WorkerThreadId(worker), |store| {
            store
                .find_or_create(range, Counter::default)
                .map(|c| c.0 += 1)
                .is_some()
        })
    }

    fn collect_windows(
        manager: &WindowSliceManager<Counter>,
        ts: u64,
        seq: u64,
    ) -> Vec<(TriggeredWindow, u64)> {
        let mut out = Vec::new();
        manager
            .update_and_trigger(Timestamp(ts), SequenceData::single(seq), OriginId(1), &mut |w, slices| {
                out.push((*w, slices.iter().map(|s| s.0).sum()));
                Ok(true)
            })
            .unwrap();
        out
    }

    #[test]
    fn test_tumbling_trigger() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 2, &[OriginId(1)]);
        for ts in 0..10 {
            assert!(build(&manager, (ts % 2) as usize, ts));
        }
        assert!(build(&manager, 0, 12));

        let fired = collect_windows(&manager, 10, 1);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0.info, WindowInfo::new(0, 10));
        assert_eq!(fired[0].0.sequence_number, 1);
        assert_eq!(fired[0].1, 10);

        // late record for the emitted window
        assert!(!build(&manager, 1, 3));
        assert!(collect_windows(&manager, 10, 2).is_empty());

        let fired = collect_windows(&manager, 20, 3);
        assert_eq!(fired[0].0.sequence_number, 2);
        assert_eq!(fired[0].1, 1);
    }

    #[test]
    fn test_sliding_trigger_combines_slices() {
        let manager = WindowSliceManager::new(SliceAssigner::sliding(10, 5).unwrap(), 1, &[OriginId(1)]);
        for ts in 0..20 {
            build(&manager, 0, ts);
        }
        let fired = collect_windows(&manager, 20, 1);
        let counts: Vec<_> = fired.iter().map(|(w, c)| (w.info, *c)).collect();
        assert_eq!(
            counts,
            vec![
                (WindowInfo::new(0, 10), 10),
                (WindowInfo::new(5, 15), 10),
                (WindowInfo::new(10, 20), 10),
            ]
        );
    }

    #[test]
    fn test_failed_emit_leaves_windows_pending() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 1, &[OriginId(1)]);
        for ts in [1, 11, 21] {
            build(&manager, 0, ts);
        }
        let mut fired = Vec::new();
        let err = manager
            .update_and_trigger(Timestamp(30), SequenceData::single(1), OriginId(1), &mut |w, _| {
                if w.info.window_start == 10 {
                    return Err(WindowError::InvalidDefinition("sink full".into()));
                }
                fired.push((w.info, w.sequence_number));
                Ok(true)
            })
            .unwrap_err();
        assert!(matches!(err, WindowError::InvalidDefinition(_)));
        assert_eq!(fired, vec![(WindowInfo::new(0, 10), 1)]);

        // the next update retries the windows the failure left behind
        let retried: Vec<_> = collect_windows(&manager, 30, 2)
            .into_iter()
            .map(|(w, count)| (w.info, w.sequence_number, count))
            .collect();
        assert_eq!(
            retried,
            vec![(WindowInfo::new(10, 20), 2, 1), (WindowInfo::new(20, 30), 3, 1)]
        );
        assert!(collect_windows(&manager, 30, 3).is_empty());
    }

    #[test]
    fn test_empty_emission_keeps_sequence() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 1, &[OriginId(1)]);
        build(&manager, 0, 1);
        build(&manager, 0, 11);
        let mut seen = Vec::new();
        manager
            .update_and_trigger(Timestamp(20), SequenceData::single(1), OriginId(1), &mut |w, _| {
                seen.push(w.sequence_number);
                Ok(w.info.window_start == 10)
            })
            .unwrap();
        assert_eq!(seen, vec![1, 1]);
        assert_eq!(manager.next_output_sequence(), 2);
    }

    #[test]
    fn test_drain_two_passes() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 1, &[OriginId(1)]);
        build(&manager, 0, 5);
        let mut count = 0;
        let mut emit = |_: &TriggeredWindow, _: &[&Counter]| -> Result<bool, WindowError> {
            count += 1;
            Ok(true)
        };
        assert_eq!(manager.drain(QueryTerminationType::Graceful, false, &mut emit).unwrap(), 0);
        assert_eq!(manager.drain(QueryTerminationType::Graceful, true, &mut emit).unwrap(), 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_failure_discards() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 1, &[OriginId(1)]);
        build(&manager, 0, 5);
        let emitted = manager
            .drain(QueryTerminationType::Failure, true, &mut |_, _| Ok(true))
            .unwrap();
        assert_eq!(emitted, 0);
        assert_eq!(manager.reset(), 0);
    }

    #[test]
    fn test_concurrent_build_counts_every_record() {
        let manager = Arc::new(WindowSliceManager::new(
            SliceAssigner::sliding(100, 50).unwrap(),
            4,
            &[OriginId(1)],
        ));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for ts in 0..1000u64 {
                        build(&manager, worker, ts);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut total_in_tumbling_equivalent = 0;
        manager
            .drain(QueryTerminationType::Graceful, true, &mut |w, slices| {
                if w.info.window_start % 100 == 0 {
                    total_in_tumbling_equivalent += slices.iter().map(|s| s.0).sum::<u64>();
                }
                Ok(true)
            })
            .unwrap();
        assert_eq!(total_in_tumbling_equivalent, 4000);
    }

    #[test]
    fn test_export_import() {
        let manager = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 2, &[OriginId(1)]);
        for ts in [1, 2, 13, 25] {
            build(&manager, (ts % 2) as usize, ts);
        }
        collect_windows(&manager, 10, 1);

        let encode = |c: &Counter| -> Result<Vec<u8>, StateError> { Ok(c.0.to_le_bytes().to_vec()) };
        let decode = |bytes: &[u8]| -> Result<Counter, StateError> {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| StateError::Deserialization("counter".into()))?;
            Ok(Counter(u64::from_le_bytes(raw)))
        };
        let snapshot = manager.export(encode).unwrap();
        let restored = WindowSliceManager::new(SliceAssigner::tumbling(10).unwrap(), 2, &[OriginId(1)]);
        restored.import(snapshot.clone(), decode).unwrap();
        assert_eq!(restored.export(encode).unwrap(), snapshot);
        assert_eq!(restored.next_output_sequence(), 2);

        let other = WindowSliceManager::<Counter>::new(SliceAssigner::tumbling(5).unwrap(), 2, &[OriginId(1)]);
        assert!(other.import(snapshot, decode).is_err());
    }
}
