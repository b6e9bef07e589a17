use fxhash::FxHashMap;

use super::sequence_queue::{PendingSequence, SequenceWatermarkQueue};
use super::{Timestamp, WatermarkError};
use crate::identifiers::OriginId;
use crate::memory::{BufferProvider, TupleBuffer};
use crate::sequence::SequenceData;
use crate::state;

/// Ingestion time of one sequence number whose watermark was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionTime {
    /// Origin of the sequence number.
    pub origin: OriginId,
    /// Sequence number.
    pub sequence_number: u64,
    /// Wall-clock time at which the buffer was ingested.
    pub ingestion_time: Timestamp,
}

/// Serializable state of a [`MultiOriginWatermarkProcessor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct WatermarkSnapshot {
    origins: Vec<OriginSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct OriginSnapshot {
    origin: u64,
    next_sequence: u64,
    current: u64,
    pending: Vec<(u64, PendingSequence)>,
}

/// Combined watermark over a fixed set of origins.
///
/// Each origin has its own [`SequenceWatermarkQueue`] and lock; updates for
/// different origins never contend. The combined watermark is the minimum
/// over the origins' lock-free current values and only ever grows.
#[derive(Debug)]
pub struct MultiOriginWatermarkProcessor {
    origins: Vec<OriginId>,
    queues: Vec<SequenceWatermarkQueue>,
    index: FxHashMap<OriginId, usize>,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor for `origins`. Duplicates are ignored.
    #[must_use]
    pub fn new(origins: &[OriginId]) -> Self {
        let mut unique = Vec::with_capacity(origins.len());
        let mut index = FxHashMap::default();
        for origin in origins {
            if !index.contains_key(origin) {
                index.insert(*origin, unique.len());
                unique.push(*origin);
            }
        }
        let queues = unique.iter().map(|_| SequenceWatermarkQueue::new()).collect();
        Self {
            origins: unique,
            queues,
            index,
        }
    }

    /// Configured origins.
    #[must_use]
    pub fn origins(&self) -> &[OriginId] {
        &self.origins
    }

    fn queue(&self, origin: OriginId) -> Result<&SequenceWatermarkQueue, WatermarkError> {
        self.index
            .get(&origin)
            .map(|i| &self.queues[*i])
            .ok_or(WatermarkError::UnknownOrigin(origin))
    }

    /// Applies a watermark update and returns the combined watermark.
    ///
    /// # Errors
    ///
    /// [`WatermarkError::UnknownOrigin`] if `origin` was not configured.
    pub fn update_watermark(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
    ) -> Result<Timestamp, WatermarkError> {
        self.queue(origin)?.update(watermark, sequence);
        Ok(self.current_watermark())
    }

    /// Like [`update_watermark`](Self::update_watermark) and records the
    /// buffer's ingestion time for latency tracking.
    ///
    /// # Errors
    ///
    /// [`WatermarkError::UnknownOrigin`] if `origin` was not configured.
    pub fn update_watermark_with_ingestion_time(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
        ingestion_time: Timestamp,
    ) -> Result<Timestamp, WatermarkError> {
        self.queue(origin)?
            .update_with_ingestion_time(watermark, sequence, ingestion_time);
        Ok(self.current_watermark())
    }

    /// Minimum watermark over all origins. [`Timestamp::MIN`] without origins.
    #[must_use]
    pub fn current_watermark(&self) -> Timestamp {
        self.queues
            .iter()
            .map(SequenceWatermarkQueue::current)
            .min()
            .unwrap_or(Timestamp::MIN)
    }

    /// Watermark of a single origin.
    ///
    /// # Errors
    ///
    /// [`WatermarkError::UnknownOrigin`] if `origin` was not configured.
    pub fn origin_watermark(&self, origin: OriginId) -> Result<Timestamp, WatermarkError> {
        Ok(self.queue(origin)?.current())
    }

    /// Drains ingestion times of all sequence numbers already covered by
    /// their origin's watermark.
    pub fn ingestion_times_for_watermarks(&self) -> Vec<IngestionTime> {
        self.origins
            .iter()
            .zip(&self.queues)
            .flat_map(|(origin, queue)| {
                queue
                    .drain_ingestion_times()
                    .into_iter()
                    .map(|(sequence_number, ingestion_time)| IngestionTime {
                        origin: *origin,
                        sequence_number,
                        ingestion_time,
                    })
            })
            .collect()
    }

    /// Captures per-origin progress including out-of-order pending entries.
    #[must_use]
    pub fn snapshot(&self) -> WatermarkSnapshot {
        WatermarkSnapshot {
            origins: self
                .origins
                .iter()
                .zip(&self.queues)
                .map(|(origin, queue)| {
                    let (next_sequence, current, pending) = queue.snapshot();
                    OriginSnapshot {
                        origin: origin.0,
                        next_sequence,
                        current,
                        pending,
                    }
                })
                .collect(),
        }
    }

    /// Overwrites progress of the snapshot's origins.
    ///
    /// # Errors
    ///
    /// [`WatermarkError::UnknownOrigin`] if the snapshot names an origin this
    /// processor was not configured with. Nothing is restored in that case.
    pub fn restore(&self, snapshot: WatermarkSnapshot) -> Result<(), WatermarkError> {
        for entry in &snapshot.origins {
            self.queue(OriginId(entry.origin))?;
        }
        for entry in snapshot.origins {
            self.queue(OriginId(entry.origin))?
                .restore(entry.next_sequence, entry.current, entry.pending);
        }
        Ok(())
    }

    /// Writes the processor state into a buffer chain for migration.
    ///
    /// # Errors
    ///
    /// Encoding or buffer errors.
    pub fn serialize_watermarks(
        &self,
        provider: &dyn BufferProvider,
    ) -> Result<TupleBuffer, WatermarkError> {
        Ok(state::encode_to_buffer(&self.snapshot(), provider)?)
    }

    /// Restores state written by [`serialize_watermarks`](Self::serialize_watermarks).
    ///
    /// # Errors
    ///
    /// Decoding errors or unknown origins.
    pub fn restore_watermarks(&self, buffer: &TupleBuffer) -> Result<(), WatermarkError> {
        let snapshot: WatermarkSnapshot = state::decode_from_buffer(buffer)?;
        self.restore(snapshot)
    }
}
