//! Sources and the thread that drives them.
//!
//! A [`SourceRunner`] owns one thread per source. The thread waits for a
//! `Start` message, then repeatedly takes a buffer from the source's local
//! pool (blocking while the pool is empty), lets the source fill it and
//! stamps the ordering metadata before handing it on. It ends on end of
//! stream, on a `Stop` message, or on a source error.
//!
//! ```text
//! Idle ──Start──> Running ──EndOfStream / Stop / error──> Stopped
//!   └──────────────────Stop──────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::EngineError;
use crate::identifiers::OriginId;
use crate::layout::{LayoutError, LayoutRef, RecordBuffer, Value};
use crate::memory::{now_millis, BufferProvider, LocalBufferPool, TupleBuffer};
use crate::pipeline::QueryTerminationType;
use crate::sequence::{SequenceData, INITIAL_SEQUENCE_NUMBER};
use crate::time::Timestamp;

/// Errors raised by sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// I/O error of the underlying input.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input that cannot be turned into records.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Records do not fit the source's layout.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// The source observed its stop token.
    #[error("source stopped")]
    Stopped,
}

/// Outcome of one [`Source::fill_tuple_buffer`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    /// The buffer holds `number_of_tuples` records; no record with an event
    /// time below `watermark` follows.
    Data {
        /// Records written.
        number_of_tuples: u64,
        /// Watermark after this buffer.
        watermark: Timestamp,
    },
    /// The input is exhausted; the buffer is discarded.
    EndOfStream,
}

/// Cooperative cancellation flag handed to sources.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// Creates an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the source to stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Producer of tuple buffers.
pub trait Source: Send + 'static {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Opens the input. Called on the source thread before the first fill.
    ///
    /// # Errors
    ///
    /// Failures stop the source with [`QueryTerminationType::Failure`].
    fn open(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Writes records into `buffer`.
    ///
    /// Long-blocking sources should poll `stop` and return
    /// [`SourceError::Stopped`] once it is set.
    ///
    /// # Errors
    ///
    /// Input failures; they stop the source.
    fn fill_tuple_buffer(
        &mut self,
        buffer: &TupleBuffer,
        stop: &StopToken,
    ) -> Result<FillResult, SourceError>;

    /// Releases the input. Called on the source thread after the last fill.
    ///
    /// # Errors
    ///
    /// Failures are logged.
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Receiver of the buffers of a running source.
pub trait SourceEmitter: Send + Sync {
    /// Hands on a filled buffer.
    fn emit(&self, origin: OriginId, buffer: TupleBuffer);

    /// Called exactly once when the source thread ends.
    fn end_of_stream(&self, origin: OriginId, termination: QueryTerminationType);
}

/// Lifecycle state of a [`SourceRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    /// Thread spawned, waiting for `Start`.
    Idle,
    /// Producing buffers.
    Running,
    /// Thread finished (terminal).
    Stopped,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlMessage {
    Start,
    Stop,
}

/// Drives one [`Source`] on a dedicated thread.
///
/// Dropping the runner stops the source and joins its thread.
pub struct SourceRunner {
    origin: OriginId,
    name: String,
    state: Arc<Mutex<SourceState>>,
    control: Sender<ControlMessage>,
    stop: StopToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SourceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRunner")
            .field("origin", &self.origin)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SourceRunner {
    /// Spawns the source thread in state [`SourceState::Idle`].
    ///
    /// Buffers come from `pool`, which is destroyed when the thread ends.
    ///
    /// # Errors
    ///
    /// [`EngineError::SpawnFailed`] if the thread cannot be created.
    pub fn spawn(
        origin: OriginId,
        source: Box<dyn Source>,
        pool: LocalBufferPool,
        emitter: Arc<dyn SourceEmitter>,
    ) -> Result<Self, EngineError> {
        let name = format!("slipstream-source-{origin}");
        let source_name = source.name().to_string();
        let state = Arc::new(Mutex::new(SourceState::Idle));
        let stop = StopToken::new();
        let (control, inbox) = mpsc::channel();

        let worker = SourceThread {
            origin,
            source,
            pool,
            emitter,
            state: Arc::clone(&state),
            stop: stop.clone(),
            inbox,
        };
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())
            .map_err(|e| EngineError::SpawnFailed {
                name,
                message: e.to_string(),
            })?;

        Ok(Self {
            origin,
            name: source_name,
            state,
            control,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Origin stamped on every buffer.
    #[must_use]
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    /// Starts producing.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidSourceState`] unless the source is idle.
    pub fn start(&self) -> Result<(), EngineError> {
        let actual = self.state();
        if actual != SourceState::Idle {
            return Err(EngineError::InvalidSourceState {
                origin: self.origin,
                expected: SourceState::Idle,
                actual,
            });
        }
        self.control
            .send(ControlMessage::Start)
            .map_err(|_| EngineError::ShutDown)
    }

    /// Requests the source to stop. Idempotent; does not wait.
    pub fn stop(&self) {
        self.stop.stop();
        // the thread may already be gone
        let _ = self.control.send(ControlMessage::Stop);
    }

    /// Waits for the source thread to end.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!(origin = %self.origin, "source thread panicked");
            }
        }
    }
}

impl Drop for SourceRunner {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

struct SourceThread {
    origin: OriginId,
    source: Box<dyn Source>,
    pool: LocalBufferPool,
    emitter: Arc<dyn SourceEmitter>,
    state: Arc<Mutex<SourceState>>,
    stop: StopToken,
    inbox: Receiver<ControlMessage>,
}

impl SourceThread {
    fn run(mut self) {
        let termination = match self.inbox.recv() {
            Ok(ControlMessage::Start) => {
                *self.state.lock() = SourceState::Running;
                info!(origin = %self.origin, source = self.source.name(), "source started");
                self.produce()
            }
            Ok(ControlMessage::Stop) | Err(RecvError) => {
                debug!(origin = %self.origin, "source stopped before start");
                QueryTerminationType::HardStop
            }
        };
        self.pool.destroy();
        *self.state.lock() = SourceState::Stopped;
        info!(origin = %self.origin, ?termination, "source stopped");
        self.emitter.end_of_stream(self.origin, termination);
    }

    fn produce(&mut self) -> QueryTerminationType {
        if let Err(e) = self.source.open() {
            error!(origin = %self.origin, error = %e, "source failed to open");
            return QueryTerminationType::Failure;
        }
        let termination = self.fill_loop();
        if let Err(e) = self.source.close() {
            warn!(origin = %self.origin, error = %e, "source failed to close");
        }
        termination
    }

    fn stop_requested(&self) -> bool {
        if self.stop.is_stopped() {
            return true;
        }
        match self.inbox.try_recv() {
            Ok(ControlMessage::Stop) | Err(TryRecvError::Disconnected) => true,
            Ok(ControlMessage::Start) | Err(TryRecvError::Empty) => false,
        }
    }

    fn fill_loop(&mut self) -> QueryTerminationType {
        let mut sequence_number = INITIAL_SEQUENCE_NUMBER;
        loop {
            if self.stop_requested() {
                return QueryTerminationType::HardStop;
            }
            let buffer = self.pool.get_buffer_blocking();
            match self.source.fill_tuple_buffer(&buffer, &self.stop) {
                Ok(FillResult::Data {
                    number_of_tuples,
                    watermark,
                }) => {
                    if number_of_tuples == 0 {
                        continue;
                    }
                    buffer.set_origin_id(self.origin);
                    buffer.set_sequence_data(SequenceData::single(sequence_number));
                    buffer.set_watermark(watermark);
                    buffer.set_number_of_tuples(number_of_tuples);
                    buffer.set_creation_timestamp(Timestamp(now_millis()));
                    self.emitter.emit(self.origin, buffer);
                    sequence_number += 1;
                }
                Ok(FillResult::EndOfStream) => return QueryTerminationType::Graceful,
                Err(SourceError::Stopped) => return QueryTerminationType::HardStop,
                Err(e) => {
                    error!(origin = %self.origin, sequence = sequence_number, error = %e, "source failed");
                    return QueryTerminationType::Failure;
                }
            }
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("remaining", &self.records.len())
            .field("watermark", &self.watermark)
            .finish_non_exhaustive()
    }
}

/// Source replaying an in-memory list of records.
///
/// Records must be sorted by the time field; each buffer's watermark is the
/// largest event time it contains.
pub struct MemorySource {
    name: String,
    layout: LayoutRef,
    records: std::vec::IntoIter<Vec<Value>>,
    time_field: usize,
    children: Arc<dyn BufferProvider>,
    records_per_buffer: usize,
    watermark: Timestamp,
}

impl MemorySource {
    /// Creates a source over `records`, filling buffers to capacity. Text
    /// fields are written to child buffers taken from `children`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        layout: LayoutRef,
        records: Vec<Vec<Value>>,
        time_field: usize,
        children: Arc<dyn BufferProvider>,
    ) -> Self {
        let records_per_buffer = layout.capacity();
        Self {
            name: name.into(),
            layout,
            records: records.into_iter(),
            time_field,
            children,
            records_per_buffer,
            watermark: Timestamp::MIN,
        }
    }

    /// Limits the records written per buffer.
    #[must_use]
    pub fn with_records_per_buffer(mut self, records_per_buffer: usize) -> Self {
        self.records_per_buffer = records_per_buffer.clamp(1, self.layout.capacity());
        self
    }
}

impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fill_tuple_buffer(
        &mut self,
        buffer: &TupleBuffer,
        stop: &StopToken,
    ) -> Result<FillResult, SourceError> {
        if stop.is_stopped() {
            return Err(SourceError::Stopped);
        }
        let view = RecordBuffer::new(buffer, self.layout.as_ref());
        let mut written = 0u64;
        for record in self.records.by_ref().take(self.records_per_buffer) {
            let event_time = record
                .get(self.time_field)
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    SourceError::Malformed(format!("record without time field {}", self.time_field))
                })?;
            view.push_record(&record, self.children.as_ref())?;
            self.watermark = self.watermark.max(Timestamp(event_time));
            written += 1;
        }
        if written == 0 {
            return Ok(FillResult::EndOfStream);
        }
        Ok(FillResult::Data {
            number_of_tuples: written,
            watermark: self.watermark,
        })
    }
}
