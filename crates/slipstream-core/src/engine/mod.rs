//! # Engine Module
//!
//! Runnable glue around pipelines: worker threads, sources and sinks.
//!
//! ## Architecture
//!
//! ```text
//! SourceRunner ──buffers──> QueryManager task queue ──> worker threads
//!  (one thread               (FIFO, Mutex + Condvar)     │
//!   per source)                                          ├─ ExecutablePipeline::execute
//!                                                        └─ emit ──> successor pipeline / Sink
//! ```
//!
//! - [`QueryManager`]: fixed pool of worker threads pulling tasks from one
//!   shared queue; per-origin sequencing for ordered pipelines; end-of-stream
//!   propagation from producers to successors
//! - [`SourceRunner`]: message-driven state machine owning one source thread
//! - [`Sink`]: terminal consumer of result buffers
//! - [`WorkerNode`]: owns configuration, the buffer pool, the query manager
//!   and the sources of one process

mod node;
mod query_manager;
mod sink;
mod source;
mod task;

pub use node::WorkerNode;
pub use query_manager::{PipelineDescriptor, QueryManager, Successor};
pub use sink::{CollectedBatch, CollectingSink, Sink, SinkError};
pub use source::{
    FillResult, MemorySource, Source, SourceEmitter, SourceError, SourceRunner, SourceState,
    StopToken,
};

use crate::identifiers::{OriginId, PipelineId};
use crate::memory::BufferError;
use crate::pipeline::ExecutionError;

/// Errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No pipeline with this id is registered.
    #[error("unknown pipeline {0}")]
    UnknownPipeline(PipelineId),

    /// A pipeline with this id is already registered.
    #[error("pipeline {0} already registered")]
    DuplicatePipeline(PipelineId),

    /// A source was driven from the wrong state.
    #[error("source {origin} is {actual}, expected {expected}")]
    InvalidSourceState {
        /// Origin of the source.
        origin: OriginId,
        /// Expected state.
        expected: SourceState,
        /// Actual state.
        actual: SourceState,
    },

    /// The engine no longer accepts work.
    #[error("engine is shut down")]
    ShutDown,

    /// A thread could not be spawned.
    #[error("failed to spawn thread {name}: {message}")]
    SpawnFailed {
        /// Thread name.
        name: String,
        /// OS error message.
        message: String,
    },

    /// Buffer reservation error.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Pipeline error.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Source error.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Sink error.
    #[error(transparent)]
    Sink(#[from] SinkError),
}
