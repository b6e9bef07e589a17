//! Per-origin watermark reconciliation over sequence numbers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Timestamp;
use crate::sequence::{SequenceData, INITIAL_SEQUENCE_NUMBER};

/// Progress of a sequence number that is not complete yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub(crate) struct PendingSequence {
    pub(crate) max_watermark: u64,
    pub(crate) seen_chunks: u64,
    pub(crate) last_chunk: Option<u64>,
}

impl PendingSequence {
    fn is_complete(&self) -> bool {
        self.last_chunk.is_some_and(|last| self.seen_chunks >= last)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_sequence: u64,
    pending: BTreeMap<u64, PendingSequence>,
    ingestion: BTreeMap<u64, Timestamp>,
}

/// Monotonic watermark of one origin.
///
/// Watermark updates may arrive in any sequence order, and a sequence number
/// may be split into chunks. A sequence number counts as complete once its
/// `last_chunk` and all chunks before it were seen. The origin's watermark is
/// the largest watermark within the contiguous complete prefix starting at
/// sequence 1, so it never moves backwards.
#[derive(Debug)]
pub struct SequenceWatermarkQueue {
    state: Mutex<QueueState>,
    current: AtomicU64,
}

impl Default for SequenceWatermarkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceWatermarkQueue {
    /// Creates a queue at [`Timestamp::MIN`] expecting sequence 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_sequence: INITIAL_SEQUENCE_NUMBER,
                ..QueueState::default()
            }),
            current: AtomicU64::new(Timestamp::MIN.0),
        }
    }

    /// Records `watermark` for one chunk and returns the origin's watermark.
    pub fn update(&self, watermark: Timestamp, sequence: SequenceData) -> Timestamp {
        let mut state = self.state.lock();
        self.apply(&mut state, watermark, sequence);
        self.current()
    }

    /// Like [`update`](Self::update), and records when the sequence number
    /// was ingested.
    pub fn update_with_ingestion_time(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        ingestion_time: Timestamp,
    ) -> Timestamp {
        let mut state = self.state.lock();
        if sequence.sequence_number >= state.next_sequence {
            state
                .ingestion
                .entry(sequence.sequence_number)
                .and_modify(|t| *t = (*t).min(ingestion_time))
                .or_insert(ingestion_time);
        }
        self.apply(&mut state, watermark, sequence);
        self.current()
    }

    fn apply(&self, state: &mut QueueState, watermark: Timestamp, sequence: SequenceData) {
        if sequence.sequence_number < state.next_sequence {
            // Sequence already folded into the watermark.
            return;
        }
        let entry = state.pending.entry(sequence.sequence_number).or_default();
        entry.max_watermark = entry.max_watermark.max(watermark.0);
        entry.seen_chunks += 1;
        if sequence.last_chunk {
            entry.last_chunk = Some(sequence.chunk_number);
        }

        let mut current = self.current.load(Ordering::Acquire);
        loop {
            let next = state.next_sequence;
            match state.pending.get(&next) {
                Some(head) if head.is_complete() => {
                    current = current.max(head.max_watermark);
                    state.pending.remove(&next);
                    state.next_sequence += 1;
                }
                _ => break,
            }
        }
        self.current.store(current, Ordering::Release);
    }

    /// The origin's watermark. Lock-free.
    #[inline]
    #[must_use]
    pub fn current(&self) -> Timestamp {
        Timestamp(self.current.load(Ordering::Acquire))
    }

    /// First sequence number that is not yet complete.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Number of incomplete sequence numbers held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Removes and returns ingestion times of sequence numbers that the
    /// watermark already covers.
    pub fn drain_ingestion_times(&self) -> Vec<(u64, Timestamp)> {
        let mut state = self.state.lock();
        let covered = state.next_sequence;
        let remaining = state.ingestion.split_off(&covered);
        let drained = std::mem::replace(&mut state.ingestion, remaining);
        drained.into_iter().collect()
    }

    pub(crate) fn snapshot(&self) -> (u64, u64, Vec<(u64, PendingSequence)>) {
        let state = self.state.lock();
        (
            state.next_sequence,
            self.current.load(Ordering::Acquire),
            state
                .pending
                .iter()
                .map(|(seq, pending)| (*seq, pending.clone()))
                .collect(),
        )
    }

    pub(crate) fn restore(&self, next_sequence: u64, current: u64, pending: Vec<(u64, PendingSequence)>) {
        let mut state = self.state.lock();
        state.next_sequence = next_sequence;
        state.pending = pending.into_iter().collect();
        state.ingestion.clear();
        self.current.store(current, Ordering::Release);
    }
}
