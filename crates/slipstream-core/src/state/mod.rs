//! # Operator State Snapshots
//!
//! rkyv encoding of operator state into tuple buffer chains, used for query
//! migration and for [`AggregationOperatorHandler::serialize`].
//!
//! [`AggregationOperatorHandler::serialize`]: crate::window::AggregationOperatorHandler::serialize

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;

use crate::memory::{codec, BufferError, BufferProvider, TupleBuffer};

/// Errors raised while snapshotting or restoring state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// rkyv encoding failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// rkyv decoding or validation failed.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Snapshot does not match the receiving operator.
    #[error("snapshot mismatch: {0}")]
    Mismatch(String),

    /// Buffer allocation or buffer chain decoding failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Encodes `value` with rkyv.
///
/// # Errors
///
/// [`StateError::Serialization`] if rkyv rejects the value.
pub fn encode<T>(value: &T) -> Result<Vec<u8>, StateError>
where
    T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    rkyv::to_bytes::<RkyvError>(value)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| StateError::Serialization(e.to_string()))
}

/// Validates and decodes rkyv bytes.
///
/// # Errors
///
/// [`StateError::Deserialization`] if the bytes are not a valid archive.
pub fn decode<T>(bytes: &[u8]) -> Result<T, StateError>
where
    T: rkyv::Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + rkyv::Deserialize<T, HighDeserializer<RkyvError>>,
{
    // Buffer memory carries no alignment guarantee for archived types.
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T, RkyvError>(&aligned).map_err(|e| StateError::Deserialization(e.to_string()))
}

/// Encodes `value` into a buffer chain from `provider`.
///
/// # Errors
///
/// Encoding or buffer errors.
pub fn encode_to_buffer<T>(value: &T, provider: &dyn BufferProvider) -> Result<TupleBuffer, StateError>
where
    T: for<'a> rkyv::Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
{
    let bytes = encode(value)?;
    Ok(codec::write_payload(provider, &bytes)?)
}

/// Decodes a value written by [`encode_to_buffer`].
///
/// # Errors
///
/// Buffer chain or decoding errors.
pub fn decode_from_buffer<T>(buffer: &TupleBuffer) -> Result<T, StateError>
where
    T: rkyv::Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, RkyvError>>
        + rkyv::Deserialize<T, HighDeserializer<RkyvError>>,
{
    let bytes = codec::read_payload(buffer)?;
    decode(&bytes)
}
