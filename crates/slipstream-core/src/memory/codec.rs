//! Byte payloads spread over a chain of tuple buffers.
//!
//! Layout of the root buffer: an 8-byte little-endian payload length followed
//! by as many payload bytes as fit. The rest of the payload is stored in child
//! buffers, in order, each filled completely except the last.

use super::buffer::{ChildIndex, TupleBuffer};
use super::{BufferError, BufferProvider};

const HEADER: usize = std::mem::size_of::<u64>();

/// Writes `payload` into a root buffer (plus child buffers as needed).
///
/// # Errors
///
/// Returns [`BufferError::BufferTooSmall`] if the provider's buffers cannot
/// hold the length header.
pub fn write_payload(
    provider: &dyn BufferProvider,
    payload: &[u8],
) -> Result<TupleBuffer, BufferError> {
    let root = provider.get_buffer_blocking();
    let capacity = root.capacity();
    if capacity <= HEADER {
        return Err(BufferError::BufferTooSmall {
            required: HEADER + 1,
            capacity,
        });
    }
    root.write_at::<u64>(0, payload.len() as u64);

    let inline = payload.len().min(capacity - HEADER);
    root.as_mut_slice()[HEADER..HEADER + inline].copy_from_slice(&payload[..inline]);

    for chunk in payload[inline..].chunks(provider.buffer_size()) {
        let child = provider.get_buffer_blocking();
        child.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
        root.store_child_buffer(child);
    }
    Ok(root)
}

/// Reads a payload previously written with [`write_payload`].
///
/// # Errors
///
/// Returns [`BufferError::CorruptPayload`] if the buffer chain is shorter than
/// the recorded length.
pub fn read_payload(root: &TupleBuffer) -> Result<Vec<u8>, BufferError> {
    if root.capacity() < HEADER {
        return Err(BufferError::CorruptPayload("root buffer shorter than header"));
    }
    let length = usize::try_from(root.read_at::<u64>(0))
        .map_err(|_| BufferError::CorruptPayload("payload length overflows usize"))?;

    let mut payload = Vec::with_capacity(length);
    let inline = length.min(root.capacity() - HEADER);
    payload.extend_from_slice(&root.as_slice()[HEADER..HEADER + inline]);

    let mut index = 0u32;
    while payload.len() < length {
        let child = root
            .load_child_buffer(ChildIndex(index))
            .ok_or(BufferError::CorruptPayload("missing child buffer"))?;
        let take = (length - payload.len()).min(child.capacity());
        payload.extend_from_slice(&child.as_slice()[..take]);
        index += 1;
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferManager;

    #[test]
    fn test_small_payload_stays_inline() {
        let manager = BufferManager::new(64, 4, 0);
        let root = write_payload(&manager, b"hello").unwrap();
        assert_eq!(root.number_of_children(), 0);
        assert_eq!(read_payload(&root).unwrap(), b"hello");
    }

    #[test]
    fn test_large_payload_uses_children() {
        let manager = BufferManager::new(32, 8, 0);
        let payload: Vec<u8> = (0..100u8).collect();
        let root = write_payload(&manager, &payload).unwrap();
        // 24 inline, then 32 + 32 + 12
        assert_eq!(root.number_of_children(), 3);
        assert_eq!(read_payload(&root).unwrap(), payload);
        drop(root);
        assert_eq!(manager.available_buffers(), 8);
    }

    #[test]
    fn test_empty_payload() {
        let manager = BufferManager::new(32, 1, 0);
        let root = write_payload(&manager, &[]).unwrap();
        assert!(read_payload(&root).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_chain_is_corrupt() {
        let root = TupleBuffer::wrap_detached(vec![0u8; 16]);
        root.write_at::<u64>(0, 100);
        assert!(matches!(
            read_payload(&root),
            Err(BufferError::CorruptPayload(_))
        ));
    }
}
