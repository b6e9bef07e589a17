//! Terminal consumers of result buffers.

use parking_lot::Mutex;
use tracing::debug;

use crate::identifiers::{OriginId, WorkerThreadId};
use crate::layout::{LayoutError, LayoutRef, RecordBuffer, Value};
use crate::memory::TupleBuffer;
use crate::pipeline::QueryTerminationType;
use crate::sequence::SequenceData;
use crate::time::Timestamp;

/// Errors raised by sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink could not write the buffer.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The sink was already shut down.
    #[error("sink is closed")]
    Closed,

    /// I/O error of the underlying target.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer does not match the sink's layout.
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// Consumer of a pipeline's result buffers.
///
/// `write_data` may be called concurrently from all worker threads. Errors
/// are logged by the caller; they never fail the emitting pipeline.
pub trait Sink: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Prepares the sink before the first buffer.
    ///
    /// # Errors
    ///
    /// Failures abort pipeline registration.
    fn setup(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Consumes one buffer.
    ///
    /// # Errors
    ///
    /// Sink-specific write failures.
    fn write_data(&self, buffer: &TupleBuffer, worker: WorkerThreadId) -> Result<(), SinkError>;

    /// Called once after the producing pipeline terminated.
    ///
    /// # Errors
    ///
    /// Failures while flushing the sink.
    fn shutdown(&self, termination: QueryTerminationType) -> Result<(), SinkError> {
        let _ = termination;
        Ok(())
    }
}

/// Records and ordering metadata of one buffer received by a
/// [`CollectingSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedBatch {
    /// Origin of the buffer.
    pub origin: OriginId,
    /// Position of the buffer in its origin's stream.
    pub sequence: SequenceData,
    /// Watermark carried by the buffer.
    pub watermark: Timestamp,
    /// Decoded records.
    pub records: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct Collected {
    batches: Vec<CollectedBatch>,
    termination: Option<QueryTerminationType>,
}

/// Sink that decodes and keeps everything it receives; for embedding and
/// tests.
///
/// Buffers are decoded on arrival so that no pool memory stays pinned.
#[derive(Debug)]
pub struct CollectingSink {
    name: String,
    layout: LayoutRef,
    collected: Mutex<Collected>,
}

impl CollectingSink {
    /// Creates a sink decoding buffers with `layout`.
    #[must_use]
    pub fn new(name: impl Into<String>, layout: LayoutRef) -> Self {
        Self {
            name: name.into(),
            layout,
            collected: Mutex::new(Collected::default()),
        }
    }

    /// Batches received so far, in arrival order.
    #[must_use]
    pub fn batches(&self) -> Vec<CollectedBatch> {
        self.collected.lock().batches.clone()
    }

    /// All records received so far, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<Vec<Value>> {
        self.collected
            .lock()
            .batches
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    /// Number of buffers received.
    #[must_use]
    pub fn number_of_batches(&self) -> usize {
        self.collected.lock().batches.len()
    }

    /// How the producing pipeline terminated, once it did.
    #[must_use]
    pub fn termination(&self) -> Option<QueryTerminationType> {
        self.collected.lock().termination
    }
}

impl Sink for CollectingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_data(&self, buffer: &TupleBuffer, _worker: WorkerThreadId) -> Result<(), SinkError> {
        let view = RecordBuffer::new(buffer, self.layout.as_ref());
        let records = (0..view.number_of_records())
            .map(|i| view.read_record(i))
            .collect::<Result<Vec<_>, _>>()?;
        let mut collected = self.collected.lock();
        if collected.termination.is_some() {
            return Err(SinkError::Closed);
        }
        collected.batches.push(CollectedBatch {
            origin: buffer.origin_id(),
            sequence: buffer.sequence_data(),
            watermark: buffer.watermark(),
            records,
        });
        Ok(())
    }

    fn shutdown(&self, termination: QueryTerminationType) -> Result<(), SinkError> {
        let mut collected = self.collected.lock();
        collected.termination.get_or_insert(termination);
        debug!(
            sink = %self.name,
            batches = collected.batches.len(),
            ?termination,
            "sink shut down"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::layout::{DataType, RowLayout, Schema};
    use crate::memory::{BufferManager, BufferProvider};

    fn layout() -> LayoutRef {
        let schema = Schema::default()
            .with_field("id", DataType::UInt32)
            .with_field("name", DataType::Text);
        Arc::new(RowLayout::new(schema, 64).unwrap())
    }

    #[test]
    fn test_collecting_sink_decodes_and_releases() {
        let manager = BufferManager::new(64, 4, 1 << 16);
        let sink = CollectingSink::new("collect", layout());
        let buffer = manager.get_buffer_blocking();
        let view = RecordBuffer::new(&buffer, sink.layout.as_ref());
        view.push_record(&[Value::UInt32(1), Value::Text("a".into())], &manager)
            .unwrap();
        view.push_record(&[Value::UInt32(2), Value::Text("bc".into())], &manager)
            .unwrap();
        buffer.set_origin_id(OriginId(3));
        buffer.set_sequence_data(SequenceData::single(4));
        buffer.set_watermark(Timestamp(50));

        sink.write_data(&buffer, WorkerThreadId(0)).unwrap();
        drop(buffer);
        assert_eq!(manager.available_buffers(), 4);

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].origin, OriginId(3));
        assert_eq!(batches[0].sequence, SequenceData::single(4));
        assert_eq!(batches[0].watermark, Timestamp(50));
        assert_eq!(
            sink.records(),
            vec![
                vec![Value::UInt32(1), Value::Text("a".into())],
                vec![Value::UInt32(2), Value::Text("bc".into())],
            ]
        );
    }

    #[test]
    fn test_closed_sink_rejects_writes() {
        let manager = BufferManager::new(64, 1, 0);
        let sink = CollectingSink::new("collect", layout());
        sink.shutdown(QueryTerminationType::HardStop).unwrap();
        sink.shutdown(QueryTerminationType::Graceful).unwrap();
        assert_eq!(sink.termination(), Some(QueryTerminationType::HardStop));
        let buffer = manager.get_buffer_blocking();
        assert!(matches!(
            sink.write_data(&buffer, WorkerThreadId(0)),
            Err(SinkError::Closed)
        ));
        assert_eq!(sink.number_of_batches(), 0);
    }
}
