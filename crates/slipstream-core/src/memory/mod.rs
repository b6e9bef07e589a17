//! # Tuple Buffer Memory
//!
//! Fixed-size, reference-counted tuple buffers and the pools that own them.
//!
//! - [`TupleBuffer`]: handle to a block of bytes plus stream metadata
//! - [`BufferManager`]: global pool with blocking acquisition (backpressure)
//! - [`LocalBufferPool`]: buffers reserved for a single source
//! - [`codec`]: arbitrary byte payloads over chains of buffers
//!
//! Everything that needs memory receives a [`BufferProvider`] explicitly;
//! there is no process-wide pool.

mod buffer;
pub mod codec;
mod pool;

use std::time::Duration;

pub use buffer::{ChildIndex, FixedWidth, TupleBuffer};
pub use pool::{BufferManager, LocalBufferPool};

pub(crate) use buffer::now_millis;

/// Errors raised by buffer allocation and buffer payload decoding.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// An unpooled buffer could not be allocated.
    #[error("cannot allocate unpooled buffer of {requested} bytes: {reason}")]
    CannotAllocateBuffer {
        /// Requested size in bytes.
        requested: usize,
        /// Why the allocation failed.
        reason: &'static str,
    },

    /// Buffer cannot hold the data written to it.
    #[error("buffer too small: need {required} bytes, capacity is {capacity}")]
    BufferTooSmall {
        /// Bytes needed.
        required: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// A local pool asked for more buffers than the global pool owns.
    #[error("cannot reserve {requested} buffers, the pool owns {owned}")]
    PoolExhausted {
        /// Buffers requested.
        requested: usize,
        /// Buffers owned by the pool at the time of the request.
        owned: usize,
    },

    /// A buffer chain does not decode to a valid payload.
    #[error("corrupt buffer payload: {0}")]
    CorruptPayload(&'static str),
}

/// Source of tuple buffers.
///
/// Implemented by the global [`BufferManager`] and by [`LocalBufferPool`].
pub trait BufferProvider: Send + Sync {
    /// Returns a zeroed buffer, blocking while none is free.
    fn get_buffer_blocking(&self) -> TupleBuffer;

    /// Returns a zeroed buffer or `None` if the pool is exhausted.
    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer>;

    /// Waits up to `timeout` for a free buffer.
    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer>;

    /// Allocates a buffer of `size` bytes outside the pool.
    ///
    /// # Errors
    ///
    /// [`BufferError::CannotAllocateBuffer`] when the unpooled budget is
    /// exhausted or the allocator refuses the request.
    fn get_unpooled_buffer(&self, size: usize) -> Result<TupleBuffer, BufferError>;

    /// Size of pooled buffers in bytes.
    fn buffer_size(&self) -> usize;

    /// Number of pooled buffers currently free.
    fn available_buffers(&self) -> usize;

    /// Number of pooled buffers owned by this provider.
    fn number_of_pooled_buffers(&self) -> usize;
}
