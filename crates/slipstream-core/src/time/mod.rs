//! # Time Module
//!
//! Event-time progress across origins.
//!
//! ## Concepts
//!
//! - **Watermark**: assertion that no tuple with an earlier timestamp will
//!   arrive from an origin
//! - **Sequence watermark queue**: per-origin reconciliation of watermark
//!   updates that arrive out of sequence order
//! - **Multi-origin processor**: combined watermark = minimum over origins
//!
//! ```rust
//! use slipstream_core::identifiers::OriginId;
//! use slipstream_core::sequence::SequenceData;
//! use slipstream_core::time::{MultiOriginWatermarkProcessor, Timestamp};
//!
//! let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1), OriginId(2)]);
//! processor.update_watermark(Timestamp(500), SequenceData::single(1), OriginId(1)).unwrap();
//! processor.update_watermark(Timestamp(300), SequenceData::single(1), OriginId(2)).unwrap();
//! assert_eq!(processor.current_watermark(), Timestamp(300));
//! ```

mod processor;
mod sequence_queue;

use std::fmt;

pub use processor::{IngestionTime, MultiOriginWatermarkProcessor, WatermarkSnapshot};
pub use sequence_queue::SequenceWatermarkQueue;

use crate::identifiers::OriginId;
use crate::memory::BufferError;
use crate::state::StateError;

/// Milliseconds of event or wall-clock time.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Earliest representable time. Initial watermark of every origin.
    pub const MIN: Self = Self(0);

    /// Latest representable time. Used to drain all windows.
    pub const MAX: Self = Self(u64::MAX);

    /// Raw milliseconds.
    #[inline]
    #[must_use]
    pub const fn millis(self) -> u64 {
        self.0
    }

    /// Whether an event at `event_time` is late relative to this watermark.
    #[inline]
    #[must_use]
    pub const fn is_late(self, event_time: Timestamp) -> bool {
        event_time.0 < self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Self(millis)
    }
}

/// Errors raised by watermark processing.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    /// Update for an origin the processor was not configured with.
    #[error("unknown origin: {0}")]
    UnknownOrigin(OriginId),

    /// Snapshot encoding or decoding failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Buffer allocation failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_late() {
        let wm = Timestamp(1000);
        assert!(wm.is_late(Timestamp(999)));
        assert!(!wm.is_late(Timestamp(1000)));
        assert!(Timestamp::MIN < Timestamp::MAX);
    }
}
