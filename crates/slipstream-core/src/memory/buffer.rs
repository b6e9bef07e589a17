//! Reference-counted tuple buffers.
//!
//! A [`TupleBuffer`] is a cheap handle (`Arc`) to a fixed-size byte block plus
//! the stream metadata the engine needs to order and window it. Cloning a
//! handle bumps the reference count; when the last handle is dropped the
//! memory goes back to the pool it came from (or releases its unpooled byte
//! reservation).
//!
//! The bytes themselves sit behind a `parking_lot::RwLock`. Writers are the
//! single producer that fills a buffer; once a buffer is handed downstream it
//! is only read, so the lock is uncontended on the hot path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};

use super::pool::Recycler;
use crate::identifiers::OriginId;
use crate::sequence::SequenceData;
use crate::time::Timestamp;

/// Index of a child buffer attached to a parent [`TupleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildIndex(pub u32);

/// Primitive values that can be read from and written to raw buffer bytes.
///
/// Values are stored little-endian. This is the "trusted layout" access path:
/// the caller guarantees that the offset was computed from the buffer's
/// [`MemoryLayout`](crate::layout::MemoryLayout).
pub trait FixedWidth: Copy + Send + Sync + 'static {
    /// Width of the value in bytes.
    const WIDTH: usize;

    /// Decodes the value from exactly `WIDTH` bytes.
    fn read_from(bytes: &[u8]) -> Self;

    /// Encodes the value into exactly `WIDTH` bytes.
    fn write_to(self, bytes: &mut [u8]);
}

macro_rules! fixed_width {
    ($($ty:ty),*) => {
        $(
            impl FixedWidth for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_from(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn write_to(self, bytes: &mut [u8]) {
                    bytes[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

fixed_width!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl FixedWidth for bool {
    const WIDTH: usize = 1;

    #[inline]
    fn read_from(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn write_to(self, bytes: &mut [u8]) {
        bytes[0] = u8::from(self);
    }
}

/// Stream metadata carried by every buffer.
#[derive(Debug, Default)]
struct BufferMetadata {
    origin_id: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU64,
    last_chunk: AtomicBool,
    watermark: AtomicU64,
    number_of_tuples: AtomicU64,
    creation_timestamp: AtomicU64,
}

/// Shared control block behind every handle of one buffer.
pub(crate) struct BufferControl {
    memory: RwLock<Box<[u8]>>,
    capacity: usize,
    metadata: BufferMetadata,
    children: Mutex<Vec<TupleBuffer>>,
    recycler: Recycler,
}

impl Drop for BufferControl {
    fn drop(&mut self) {
        let memory = std::mem::take(self.memory.get_mut());
        // Children are released before the parent memory is handed back.
        self.children.get_mut().clear();
        self.recycler.recycle(memory);
    }
}

/// Handle to a fixed-size block of tuple memory plus stream metadata.
///
/// # Example
///
/// ```rust
/// use slipstream_core::memory::{BufferManager, BufferProvider};
///
/// let manager = BufferManager::new(1024, 2, 0);
/// let buffer = manager.get_buffer_blocking();
/// buffer.write_at::<u64>(0, 42);
/// buffer.set_number_of_tuples(1);
/// assert_eq!(buffer.read_at::<u64>(0), 42);
///
/// let shared = buffer.clone();
/// drop(buffer);
/// assert_eq!(manager.available_buffers(), 1); // still held by `shared`
/// drop(shared);
/// assert_eq!(manager.available_buffers(), 2);
/// ```
#[derive(Clone)]
pub struct TupleBuffer {
    control: Arc<BufferControl>,
}

impl TupleBuffer {
    /// Wraps zeroed memory into a fresh buffer handle.
    pub(crate) fn from_memory(memory: Box<[u8]>, recycler: Recycler) -> Self {
        let capacity = memory.len();
        let metadata = BufferMetadata::default();
        metadata
            .creation_timestamp
            .store(now_millis(), Ordering::Relaxed);
        Self {
            control: Arc::new(BufferControl {
                memory: RwLock::new(memory),
                capacity,
                metadata,
                children: Mutex::new(Vec::new()),
                recycler,
            }),
        }
    }

    /// Creates a buffer that is not backed by any pool. Used for tests and
    /// for payloads received from outside the engine.
    #[must_use]
    pub fn wrap_detached(memory: Vec<u8>) -> Self {
        Self::from_memory(memory.into_boxed_slice(), Recycler::Detached)
    }

    /// Size of the buffer in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.control.capacity
    }

    /// Read access to the raw bytes.
    #[inline]
    pub fn as_slice(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.control.memory.read(), |memory| &**memory)
    }

    /// Write access to the raw bytes.
    #[inline]
    pub fn as_mut_slice(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.control.memory.write(), |memory| &mut **memory)
    }

    /// Reads a primitive at a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + T::WIDTH` exceeds the buffer capacity.
    #[inline]
    #[must_use]
    pub fn read_at<T: FixedWidth>(&self, offset: usize) -> T {
        let memory = self.control.memory.read();
        T::read_from(&memory[offset..offset + T::WIDTH])
    }

    /// Writes a primitive at a byte offset.
    ///
    /// # Panics
    ///
    /// Panics if `offset + T::WIDTH` exceeds the buffer capacity.
    #[inline]
    pub fn write_at<T: FixedWidth>(&self, offset: usize, value: T) {
        let mut memory = self.control.memory.write();
        value.write_to(&mut memory[offset..offset + T::WIDTH]);
    }

    /// Fills the whole buffer with zeroes.
    pub fn zero(&self) {
        self.control.memory.write().fill(0);
    }

    // ── Metadata ───────────────────────────────────────────────────

    /// Origin that produced this buffer.
    #[inline]
    #[must_use]
    pub fn origin_id(&self) -> OriginId {
        OriginId(self.control.metadata.origin_id.load(Ordering::Acquire))
    }

    /// Sets the origin id.
    #[inline]
    pub fn set_origin_id(&self, origin: OriginId) {
        self.control
            .metadata
            .origin_id
            .store(origin.0, Ordering::Release);
    }

    /// Sequence number within the origin.
    #[inline]
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.control.metadata.sequence_number.load(Ordering::Acquire)
    }

    /// Sets the sequence number.
    #[inline]
    pub fn set_sequence_number(&self, sequence_number: u64) {
        self.control
            .metadata
            .sequence_number
            .store(sequence_number, Ordering::Release);
    }

    /// Chunk number within the sequence number.
    #[inline]
    #[must_use]
    pub fn chunk_number(&self) -> u64 {
        self.control.metadata.chunk_number.load(Ordering::Acquire)
    }

    /// Sets the chunk number.
    #[inline]
    pub fn set_chunk_number(&self, chunk_number: u64) {
        self.control
            .metadata
            .chunk_number
            .store(chunk_number, Ordering::Release);
    }

    /// Whether this is the final chunk of its sequence number.
    #[inline]
    #[must_use]
    pub fn is_last_chunk(&self) -> bool {
        self.control.metadata.last_chunk.load(Ordering::Acquire)
    }

    /// Marks (or unmarks) this buffer as the final chunk.
    #[inline]
    pub fn set_last_chunk(&self, last_chunk: bool) {
        self.control
            .metadata
            .last_chunk
            .store(last_chunk, Ordering::Release);
    }

    /// Returns `(sequence_number, chunk_number, last_chunk)`.
    #[inline]
    #[must_use]
    pub fn sequence_data(&self) -> SequenceData {
        SequenceData::new(
            self.sequence_number(),
            self.chunk_number(),
            self.is_last_chunk(),
        )
    }

    /// Stamps sequence number, chunk number and the last-chunk flag at once.
    pub fn set_sequence_data(&self, sequence: SequenceData) {
        self.set_sequence_number(sequence.sequence_number);
        self.set_chunk_number(sequence.chunk_number);
        self.set_last_chunk(sequence.last_chunk);
    }

    /// Event-time watermark carried by this buffer.
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> Timestamp {
        Timestamp(self.control.metadata.watermark.load(Ordering::Acquire))
    }

    /// Sets the watermark.
    #[inline]
    pub fn set_watermark(&self, watermark: Timestamp) {
        self.control
            .metadata
            .watermark
            .store(watermark.0, Ordering::Release);
    }

    /// Number of tuples stored in this buffer.
    #[inline]
    #[must_use]
    pub fn number_of_tuples(&self) -> u64 {
        self.control.metadata.number_of_tuples.load(Ordering::Acquire)
    }

    /// Sets the number of tuples.
    #[inline]
    pub fn set_number_of_tuples(&self, number_of_tuples: u64) {
        self.control
            .metadata
            .number_of_tuples
            .store(number_of_tuples, Ordering::Release);
    }

    /// Wall-clock time (ms since epoch) at which this buffer was acquired.
    #[inline]
    #[must_use]
    pub fn creation_timestamp(&self) -> Timestamp {
        Timestamp(
            self.control
                .metadata
                .creation_timestamp
                .load(Ordering::Acquire),
        )
    }

    /// Overrides the creation timestamp (ingestion time).
    #[inline]
    pub fn set_creation_timestamp(&self, timestamp: Timestamp) {
        self.control
            .metadata
            .creation_timestamp
            .store(timestamp.0, Ordering::Release);
    }

    /// Copies all stream metadata (not the payload) from `other`.
    pub fn copy_metadata_from(&self, other: &TupleBuffer) {
        self.set_origin_id(other.origin_id());
        self.set_sequence_data(other.sequence_data());
        self.set_watermark(other.watermark());
        self.set_creation_timestamp(other.creation_timestamp());
    }

    // ── Child buffers ──────────────────────────────────────────────

    /// Attaches `child` to this buffer and returns its index.
    ///
    /// The child stays alive as long as the parent does.
    pub fn store_child_buffer(&self, child: TupleBuffer) -> ChildIndex {
        let mut children = self.control.children.lock();
        children.push(child);
        #[allow(clippy::cast_possible_truncation)] // bounded by u32 child indices
        ChildIndex((children.len() - 1) as u32)
    }

    /// Returns a handle to the child buffer at `index`.
    #[must_use]
    pub fn load_child_buffer(&self, index: ChildIndex) -> Option<TupleBuffer> {
        self.control.children.lock().get(index.0 as usize).cloned()
    }

    /// Number of attached child buffers.
    #[must_use]
    pub fn number_of_children(&self) -> usize {
        self.control.children.lock().len()
    }

    // ── Handle bookkeeping ─────────────────────────────────────────

    /// Number of live handles to this buffer.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.control)
    }

    /// Returns true if both handles point at the same buffer.
    #[must_use]
    pub fn ptr_eq(&self, other: &TupleBuffer) -> bool {
        Arc::ptr_eq(&self.control, &other.control)
    }

    /// Returns true if the memory came from a buffer pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.control.recycler.is_pooled()
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("origin_id", &self.origin_id())
            .field("sequence_number", &self.sequence_number())
            .field("chunk_number", &self.chunk_number())
            .field("last_chunk", &self.is_last_chunk())
            .field("watermark", &self.watermark())
            .field("number_of_tuples", &self.number_of_tuples())
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_round_trip() {
        let buffer = TupleBuffer::wrap_detached(vec![0u8; 64]);
        buffer.write_at::<i64>(0, -7);
        buffer.write_at::<f64>(8, 3.5);
        buffer.write_at::<bool>(16, true);
        buffer.write_at::<u16>(17, 513);
        assert_eq!(buffer.read_at::<i64>(0), -7);
        assert!((buffer.read_at::<f64>(8) - 3.5).abs() < f64::EPSILON);
        assert!(buffer.read_at::<bool>(16));
        assert_eq!(buffer.read_at::<u16>(17), 513);
    }

    #[test]
    fn test_metadata_defaults_and_setters() {
        let buffer = TupleBuffer::wrap_detached(vec![0u8; 8]);
        assert_eq!(buffer.origin_id(), OriginId::INVALID);
        assert_eq!(buffer.number_of_tuples(), 0);

        buffer.set_origin_id(OriginId(3));
        buffer.set_sequence_data(SequenceData::new(5, 2, true));
        buffer.set_watermark(Timestamp(100));
        buffer.set_number_of_tuples(4);

        assert_eq!(buffer.origin_id(), OriginId(3));
        assert_eq!(buffer.sequence_data(), SequenceData::new(5, 2, true));
        assert_eq!(buffer.watermark(), Timestamp(100));
        assert_eq!(buffer.number_of_tuples(), 4);
    }

    #[test]
    fn test_clone_shares_memory() {
        let buffer = TupleBuffer::wrap_detached(vec![0u8; 8]);
        let other = buffer.clone();
        other.write_at::<u32>(0, 99);
        assert_eq!(buffer.read_at::<u32>(0), 99);
        assert!(buffer.ptr_eq(&other));
        assert_eq!(buffer.reference_count(), 2);
    }

    #[test]
    fn test_child_buffers() {
        let parent = TupleBuffer::wrap_detached(vec![0u8; 8]);
        let child = TupleBuffer::wrap_detached(vec![1u8; 4]);
        let index = parent.store_child_buffer(child);
        assert_eq!(index, ChildIndex(0));
        assert_eq!(parent.number_of_children(), 1);
        let loaded = parent.load_child_buffer(index).unwrap();
        assert_eq!(&*loaded.as_slice(), &[1, 1, 1, 1]);
        assert!(parent.load_child_buffer(ChildIndex(1)).is_none());
    }

    #[test]
    fn test_copy_metadata() {
        let a = TupleBuffer::wrap_detached(vec![0u8; 8]);
        a.set_origin_id(OriginId(9));
        a.set_sequence_data(SequenceData::new(2, 1, false));
        a.set_watermark(Timestamp(77));
        let b = TupleBuffer::wrap_detached(vec![0u8; 8]);
        b.copy_metadata_from(&a);
        assert_eq!(b.origin_id(), OriginId(9));
        assert_eq!(b.sequence_data(), SequenceData::new(2, 1, false));
        assert_eq!(b.watermark(), Timestamp(77));
    }
}
