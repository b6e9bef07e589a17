//! # Sequencing
//!
//! Restores per-origin order of `(sequence_number, chunk_number)` tagged items
//! that arrive out of order.
//!
//! A [`Sequencer`] hands an item straight back when it is the next expected
//! one and parks it otherwise. Whoever processed the expected item then calls
//! [`Sequencer::advance_and_get_next`] to move the cursor and pick up the next
//! parked item, if it is now due. Sequence numbers and chunk numbers start at
//! 1; the chunk cursor resets to 1 after a `last_chunk`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use tracing::warn;

/// First sequence number of every origin.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// First chunk number of every sequence number.
pub const INITIAL_CHUNK_NUMBER: u64 = 1;

/// Position of a buffer within its origin's stream.
///
/// Ordered by `(sequence_number, chunk_number)`; a well-formed stream never
/// repeats a position, so `last_chunk` only breaks ties between malformed
/// duplicates.
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
pub struct SequenceData {
    /// Sequence number, starting at 1.
    pub sequence_number: u64,
    /// Chunk number within the sequence number, starting at 1.
    pub chunk_number: u64,
    /// True on the final chunk of the sequence number.
    pub last_chunk: bool,
}

impl SequenceData {
    /// Creates sequence data.
    #[must_use]
    pub const fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// A complete, single-chunk sequence number.
    #[must_use]
    pub const fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, INITIAL_CHUNK_NUMBER, true)
    }

    /// Position that follows this one.
    #[must_use]
    pub const fn successor(self) -> (u64, u64) {
        if self.last_chunk {
            (self.sequence_number + 1, INITIAL_CHUNK_NUMBER)
        } else {
            (self.sequence_number, self.chunk_number + 1)
        }
    }
}

/// Errors raised by a [`Sequencer`].
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    /// `advance_and_get_next` called with something other than the expected
    /// position.
    #[error("expected sequence ({expected_sequence}, {expected_chunk}), got ({sequence}, {chunk})")]
    UnexpectedSequence {
        /// Expected sequence number.
        expected_sequence: u64,
        /// Expected chunk number.
        expected_chunk: u64,
        /// Supplied sequence number.
        sequence: u64,
        /// Supplied chunk number.
        chunk: u64,
    },
}

struct Pending<T> {
    sequence: SequenceData,
    data: T,
}

impl<T> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<T> Eq for Pending<T> {}

impl<T> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }
}

struct SequencerState<T> {
    next_sequence: u64,
    next_chunk: u64,
    pending: BinaryHeap<Reverse<Pending<T>>>,
}

impl<T> SequencerState<T> {
    fn is_expected(&self, sequence: SequenceData) -> bool {
        sequence.sequence_number == self.next_sequence && sequence.chunk_number == self.next_chunk
    }
}

/// Per-origin reorder buffer.
///
/// # Example
///
/// ```rust
/// use slipstream_core::sequence::{SequenceData, Sequencer};
///
/// let sequencer = Sequencer::new();
/// assert_eq!(sequencer.is_next(SequenceData::single(2), "b"), None);
/// assert_eq!(sequencer.is_next(SequenceData::single(1), "a"), Some("a"));
/// assert_eq!(
///     sequencer.advance_and_get_next(SequenceData::single(1)).unwrap(),
///     Some("b")
/// );
/// ```
pub struct Sequencer<T> {
    state: RwLock<SequencerState<T>>,
    backlog_warning: usize,
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Sequencer<T> {
    /// Default pending-item count above which a warning is logged.
    pub const DEFAULT_BACKLOG_WARNING: usize = 1024;

    /// Creates a sequencer expecting `(1, 1)`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog_warning(Self::DEFAULT_BACKLOG_WARNING)
    }

    /// Creates a sequencer that warns once more than `threshold` items are
    /// parked.
    #[must_use]
    pub fn with_backlog_warning(threshold: usize) -> Self {
        Self {
            state: RwLock::new(SequencerState {
                next_sequence: INITIAL_SEQUENCE_NUMBER,
                next_chunk: INITIAL_CHUNK_NUMBER,
                pending: BinaryHeap::new(),
            }),
            backlog_warning: threshold,
        }
    }

    /// Returns `data` if `sequence` is the expected position, otherwise parks
    /// it and returns `None`.
    ///
    /// Returning `Some` does not advance the cursor; the caller must call
    /// [`advance_and_get_next`](Self::advance_and_get_next) once it processed
    /// the item.
    pub fn is_next(&self, sequence: SequenceData, data: T) -> Option<T> {
        let state = self.state.upgradable_read();
        if state.is_expected(sequence) {
            return Some(data);
        }
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.pending.push(Reverse(Pending { sequence, data }));
        let pending = state.pending.len();
        if pending > self.backlog_warning && pending.is_power_of_two() {
            warn!(
                pending,
                next_sequence = state.next_sequence,
                next_chunk = state.next_chunk,
                "sequencer backlog growing"
            );
        }
        None
    }

    /// Advances past `sequence` and returns the next parked item if it is now
    /// due.
    ///
    /// # Errors
    ///
    /// [`SequencerError::UnexpectedSequence`] if `sequence` is not the expected
    /// position. The sequencer state is left unchanged.
    pub fn advance_and_get_next(&self, sequence: SequenceData) -> Result<Option<T>, SequencerError> {
        let mut state = self.state.write();
        if !state.is_expected(sequence) {
            return Err(SequencerError::UnexpectedSequence {
                expected_sequence: state.next_sequence,
                expected_chunk: state.next_chunk,
                sequence: sequence.sequence_number,
                chunk: sequence.chunk_number,
            });
        }
        (state.next_sequence, state.next_chunk) = sequence.successor();

        let due = state
            .pending
            .peek()
            .is_some_and(|Reverse(head)| state.is_expected(head.sequence));
        if due {
            Ok(state.pending.pop().map(|Reverse(head)| head.data))
        } else {
            Ok(None)
        }
    }

    /// Number of parked items.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.read().pending.len()
    }

    /// The expected `(sequence_number, chunk_number)`.
    #[must_use]
    pub fn expected(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.next_sequence, state.next_chunk)
    }
}
