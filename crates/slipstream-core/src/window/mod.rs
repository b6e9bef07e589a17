//! # Window Module
//!
//! Slice-based window aggregation and window joins over event time.
//!
//! ## Concepts
//!
//! - **Slice**: a time range that does not cross any window boundary, holding
//!   partial state. Windows are the union of the slices they cover.
//! - **Thread-local store**: per-worker slices filled without contention
//! - **Staging**: partial slices collected from all workers once the
//!   watermark passes their end
//! - **Global store**: merged slices and the windows they belong to
//! - **Trigger**: emitting every window whose end the watermark has passed,
//!   exactly once
//!
//! ## Lifecycle of a slice
//!
//! ```text
//! build (worker) ──> Filling ──watermark >= end──> Staged ──> Merged
//!                                                               │
//!                          dropped <── GC <── Triggered <───────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use slipstream_core::window::{SliceAssigner, WindowInfo};
//!
//! let assigner = SliceAssigner::tumbling(10).unwrap();
//! let slice = assigner.slice_for(12);
//! assert_eq!(assigner.windows_for_slice(slice)[0], WindowInfo::new(10, 20));
//! ```

mod aggregation;
mod assigner;
mod join;
mod manager;
mod paged_vector;
mod slice;
mod store;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use aggregation::{
    AggregateFunction, AggregateSpec, AggregateState, AggregationDefinition,
    AggregationDefinitionBuilder, AggregationOperatorHandler, AggregationSlice,
};
pub use assigner::{SliceAssigner, SliceRange, SliceRangeVec, WindowInfoVec, WindowingStrategy};
pub use join::{JoinDefinition, JoinOperatorHandler, JoinSide, JoinSlice, JoinStrategy};
pub use manager::{ManagerSnapshot, WindowSliceManager};
pub use paged_vector::PagedVector;
pub use slice::{Slice, SliceState};
pub use store::{GlobalSliceStore, SliceStaging, ThreadLocalSliceStore, WindowState};

use tracing::trace;

use crate::expression::ExpressionError;
use crate::identifiers::{OriginId, WorkerThreadId};
use crate::layout::{LayoutError, MemoryLayout, RecordBuffer, Value};
use crate::memory::{BufferError, TupleBuffer};
use crate::pipeline::{ContinuationPolicy, PipelineExecutionContext};
use crate::sequence::{SequenceData, INITIAL_CHUNK_NUMBER};
use crate::state::StateError;
use crate::time::{Timestamp, WatermarkError};

/// Errors raised by window operators.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// Window size or slide is not usable.
    #[error("invalid window: size {size}, slide {slide}")]
    InvalidWindow {
        /// Window size in ms.
        size: u64,
        /// Window slide in ms.
        slide: u64,
    },

    /// Operator definition is inconsistent.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Record timestamp is missing or not a non-negative integer.
    #[error("field {field} does not hold a valid timestamp")]
    InvalidTimestamp {
        /// Index of the time field.
        field: usize,
    },

    /// Aggregated value is not numeric.
    #[error("aggregate input {field} is not numeric")]
    NonNumericInput {
        /// Index of the input field.
        field: usize,
    },

    /// Record access failed.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Watermark update failed.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// State snapshot failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Predicate evaluation failed.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Allocation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Boundaries of one window.
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
pub struct WindowInfo {
    /// Inclusive start.
    pub window_start: u64,
    /// Exclusive end.
    pub window_end: u64,
}

impl WindowInfo {
    /// Creates window boundaries.
    #[must_use]
    pub const fn new(window_start: u64, window_end: u64) -> Self {
        Self {
            window_start,
            window_end,
        }
    }

    /// Key ordering windows by end first.
    #[must_use]
    pub const fn key(self) -> (u64, u64) {
        (self.window_end, self.window_start)
    }
}

impl fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.window_start, self.window_end)
    }
}

/// A window being emitted together with its output sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggeredWindow {
    /// Window boundaries.
    pub info: WindowInfo,
    /// Sequence number stamped on every chunk emitted for this window.
    pub sequence_number: u64,
}

/// Counters for records that arrived after their slice was staged.
#[derive(Debug, Default)]
pub struct LateRecordMetrics {
    dropped: AtomicU64,
}

impl LateRecordMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of late records dropped.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records `count` dropped late records.
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Resets the counters to zero.
    pub fn reset(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// Writes the result records of one window into as many buffers as needed and
/// emits them as chunks of `window.sequence_number`.
///
/// Returns `false` without emitting anything when `records` is empty.
pub(crate) fn emit_window_records(
    window: &TriggeredWindow,
    records: impl IntoIterator<Item = Vec<Value>>,
    layout: &dyn MemoryLayout,
    output_origin: OriginId,
    ctx: &PipelineExecutionContext,
    worker: WorkerThreadId,
) -> Result<bool, WindowError> {
    let provider = ctx.buffer_provider();
    if provider.buffer_size() < layout.buffer_size() {
        return Err(WindowError::InvalidDefinition(format!(
            "result buffers of {} bytes exceed provider buffers of {} bytes",
            layout.buffer_size(),
            provider.buffer_size()
        )));
    }

    let stamp = |buffer: &TupleBuffer, chunk: u64, last: bool| {
        buffer.set_origin_id(output_origin);
        buffer.set_sequence_data(SequenceData::new(window.sequence_number, chunk, last));
        buffer.set_watermark(Timestamp(window.info.window_start));
    };

    // a full chunk is emitted before the next buffer is taken, so a result
    // never holds more than one pooled buffer
    let mut pending: Option<TupleBuffer> = None;
    let mut chunks = 0u64;
    for record in records {
        let full = pending
            .as_ref()
            .is_some_and(|b| RecordBuffer::new(b, layout).is_full());
        if full {
            if let Some(buffer) = pending.take() {
                stamp(&buffer, INITIAL_CHUNK_NUMBER + chunks - 1, false);
                ctx.emit_buffer(buffer, worker, ContinuationPolicy::Possible);
            }
        }
        if pending.is_none() {
            chunks += 1;
        }
        let buffer = pending.get_or_insert_with(|| provider.get_buffer_blocking());
        RecordBuffer::new(buffer, layout).push_record(&record, provider)?;
    }
    let Some(last) = pending else {
        return Ok(false);
    };
    stamp(&last, INITIAL_CHUNK_NUMBER + chunks - 1, true);
    ctx.emit_buffer(last, worker, ContinuationPolicy::Possible);
    trace!(window = %window.info, sequence = window.sequence_number, chunks, "emitted window");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_info_ordering() {
        let mut windows = vec![WindowInfo::new(10, 20), WindowInfo::new(4, 14), WindowInfo::new(0, 10)];
        windows.sort_by_key(|w| w.key());
        assert_eq!(
            windows,
            vec![WindowInfo::new(0, 10), WindowInfo::new(4, 14), WindowInfo::new(10, 20)]
        );
        assert_eq!(WindowInfo::new(0, 10).to_string(), "[0, 10)");
    }

    #[test]
    fn test_late_metrics() {
        let metrics = LateRecordMetrics::new();
        metrics.record_dropped(3);
        metrics.record_dropped(1);
        assert_eq!(metrics.dropped(), 4);
        metrics.reset();
        assert_eq!(metrics.dropped(), 0);
    }
}
