//! # Slipstream Core
//!
//! Runtime execution engine of a streaming query processor for sensor and
//! IoT data.
//!
//! This crate provides:
//! - **Memory**: pooled, reference-counted tuple buffers with backpressure
//! - **Layouts**: row and column layouts mapping records to byte offsets
//! - **Ordering**: per-origin sequencers and multi-origin watermarks
//! - **Windows**: slice-based window aggregation and join operator handlers
//! - **Pipelines**: compiled or interpreted stages behind one execution
//!   abstraction
//! - **Engine**: worker threads, sources, sinks and the worker node
//!
//! ## Design Principles
//!
//! 1. **Explicit resources**: buffer providers are passed in, never global
//! 2. **Layout is the single source of truth** for record offsets
//! 3. **Typed errors**: protocol violations fail the query, not the process
//!
//! ## Example
//!
//! ```rust,ignore
//! use slipstream_core::config::EngineConfig;
//! use slipstream_core::engine::{PipelineDescriptor, Successor, WorkerNode};
//!
//! let node = WorkerNode::new(EngineConfig::default())?;
//! node.register_pipeline(PipelineDescriptor::new(id, stage).with_successor(Successor::Sink(sink)))?;
//! node.add_source(origin, Box::new(source), id)?;
//! node.start()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // allowed only by the compiled-pipeline ABI
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod expression;
pub mod identifiers;
pub mod layout;
pub mod memory;
pub mod pipeline;
pub mod sequence;
pub mod state;
pub mod time;
pub mod window;

pub use config::EngineConfig;
pub use engine::WorkerNode;
pub use identifiers::{OriginId, PipelineId, QueryId, WorkerThreadId};
pub use memory::{BufferManager, BufferProvider, TupleBuffer};
pub use time::Timestamp;

/// Result type for slipstream-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for slipstream-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer allocation errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] memory::BufferError),

    /// Layout errors
    #[error("Layout error: {0}")]
    Layout(#[from] layout::LayoutError),

    /// Sequencer protocol errors
    #[error("Sequencer error: {0}")]
    Sequencer(#[from] sequence::SequencerError),

    /// Watermark errors
    #[error("Watermark error: {0}")]
    Watermark(#[from] time::WatermarkError),

    /// Window operator errors
    #[error("Window error: {0}")]
    Window(#[from] window::WindowError),

    /// State serialization errors
    #[error("State error: {0}")]
    State(#[from] state::StateError),

    /// Expression errors
    #[error("Expression error: {0}")]
    Expression(#[from] expression::ExpressionError),

    /// Pipeline execution errors
    #[error("Execution error: {0}")]
    Execution(#[from] pipeline::ExecutionError),

    /// Engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Source errors
    #[error("Source error: {0}")]
    Source(#[from] engine::SourceError),

    /// Sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] engine::SinkError),
}
