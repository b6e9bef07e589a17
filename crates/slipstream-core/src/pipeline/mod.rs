//! # Pipeline Module
//!
//! Execution abstraction shared by compiled and interpreted pipelines.
//!
//! ## Concepts
//!
//! - **Stage**: the code a pipeline runs per input buffer, either a native
//!   function produced by a compiler backend or a chain of interpreted
//!   physical operators
//! - **Execution context**: per-pipeline services handed to every stage
//!   invocation: the buffer provider, the operator handlers and the emitter
//!   towards successor pipelines
//! - **Operator handler**: per-query state shared by all workers of a
//!   pipeline (window slice stores, watermark processors). Handlers opt into
//!   lifecycle hooks through capability accessors instead of a class
//!   hierarchy.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start──> Running ──stop──> Stopped
//!                       │
//!                       └──fail──> Failed
//! ```

mod executable;
mod native;
mod operators;
mod stage;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub use executable::{ExecutablePipeline, ExecutionResult, PipelineStatus};
pub use native::{proxy_emit_buffer, CompiledPipelineFn, NativePipelineStage};
pub use operators::PhysicalOperator;
pub use stage::{Arena, ExecutablePipelineStage, InterpretedPipelineStage};

use crate::expression::ExpressionError;
use crate::identifiers::{PipelineId, WorkerThreadId};
use crate::layout::LayoutError;
use crate::memory::{BufferError, BufferProvider, TupleBuffer};
use crate::sequence::SequencerError;
use crate::time::{Timestamp, WatermarkError};
use crate::window::WindowError;

/// Errors raised while setting up or executing a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Operation not allowed in the pipeline's current status.
    #[error("invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// Expected status.
        expected: &'static str,
        /// Actual status.
        actual: PipelineStatus,
    },

    /// The stage could not be prepared.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// An operator or handler failed.
    #[error("operator failed: {0}")]
    Operator(String),

    /// Window operator error.
    #[error(transparent)]
    Window(#[from] WindowError),

    /// Layout error.
    #[error(transparent)]
    Layout(#[from] LayoutError),

    /// Sequence protocol violation.
    #[error(transparent)]
    Sequencer(#[from] SequencerError),

    /// Watermark protocol violation.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// Buffer allocation error.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Expression evaluation error.
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Whether a successor may run the emitted buffer on the emitting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContinuationPolicy {
    /// The engine decides.
    #[default]
    Possible,
    /// Always dispatch as a new task.
    Never,
    /// Re-run the emitting pipeline with the buffer.
    Repeat,
}

/// How a query terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTerminationType {
    /// End of stream: drain and emit remaining state.
    Graceful,
    /// Stop requested: drain and emit remaining state.
    HardStop,
    /// Failure: discard remaining state.
    Failure,
}

/// Runtime reconfiguration of operator handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigurationMessage {
    /// Emit every window ending at or before the timestamp.
    FlushUntil(Timestamp),
    /// Drop all window state.
    Reset,
}

/// Receives buffers emitted by a pipeline.
pub trait BufferEmitter: Send + Sync {
    /// Hands `buffer` to the pipeline's successors.
    fn emit(&self, buffer: TupleBuffer, worker: WorkerThreadId, policy: ContinuationPolicy);
}

/// Emitter that keeps every buffer; for embedding and tests.
#[derive(Debug, Default)]
pub struct CollectingEmitter {
    buffers: Mutex<Vec<TupleBuffer>>,
}

impl CollectingEmitter {
    /// Creates an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything emitted so far.
    pub fn take(&self) -> Vec<TupleBuffer> {
        std::mem::take(&mut *self.buffers.lock())
    }

    /// Number of buffers held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// True if nothing was emitted since the last [`take`](Self::take).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl BufferEmitter for CollectingEmitter {
    fn emit(&self, buffer: TupleBuffer, _worker: WorkerThreadId, _policy: ContinuationPolicy) {
        self.buffers.lock().push(buffer);
    }
}

/// Per-query state attached to a pipeline.
pub trait OperatorHandler: Send + Sync + Any {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Start hook, if the handler has one.
    fn as_startable(&self) -> Option<&dyn Startable> {
        None
    }

    /// Stop hook, if the handler has one.
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        None
    }

    /// Reconfiguration hook, if the handler has one.
    fn as_reconfigurable(&self) -> Option<&dyn Reconfigurable> {
        None
    }

    /// Upcast for typed access through [`PipelineExecutionContext::handler`].
    fn as_any(&self) -> &dyn Any;
}

/// Handler that runs code when its pipeline starts.
pub trait Startable {
    /// Called once before the first buffer.
    ///
    /// # Errors
    ///
    /// Failures abort the pipeline start.
    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError>;
}

/// Handler that drains state when its pipeline stops.
pub trait Stoppable {
    /// Called once after the last buffer.
    ///
    /// # Errors
    ///
    /// Failures are reported by the stopping pipeline.
    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError>;
}

/// Handler that accepts runtime reconfiguration.
pub trait Reconfigurable {
    /// Applies `message`.
    ///
    /// # Errors
    ///
    /// Failures while flushing state.
    fn reconfigure(
        &self,
        message: &ReconfigurationMessage,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError>;
}

/// Services available to a pipeline stage.
pub struct PipelineExecutionContext {
    pipeline_id: PipelineId,
    number_of_workers: usize,
    provider: Arc<dyn BufferProvider>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    emitter: Arc<dyn BufferEmitter>,
}

impl fmt::Debug for PipelineExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutionContext")
            .field("pipeline_id", &self.pipeline_id)
            .field("number_of_workers", &self.number_of_workers)
            .field(
                "handlers",
                &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl PipelineExecutionContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        pipeline_id: PipelineId,
        number_of_workers: usize,
        provider: Arc<dyn BufferProvider>,
        handlers: Vec<Arc<dyn OperatorHandler>>,
        emitter: Arc<dyn BufferEmitter>,
    ) -> Self {
        Self {
            pipeline_id,
            number_of_workers: number_of_workers.max(1),
            provider,
            handlers,
            emitter,
        }
    }

    /// Pipeline id.
    #[must_use]
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Number of worker threads that may execute the pipeline concurrently.
    #[must_use]
    pub fn number_of_workers(&self) -> usize {
        self.number_of_workers
    }

    /// Buffer provider for results.
    #[must_use]
    pub fn buffer_provider(&self) -> &dyn BufferProvider {
        self.provider.as_ref()
    }

    /// Handler at `index`.
    #[must_use]
    pub fn operator_handler(&self, index: usize) -> Option<&Arc<dyn OperatorHandler>> {
        self.handlers.get(index)
    }

    /// All handlers in registration order.
    #[must_use]
    pub fn operator_handlers(&self) -> &[Arc<dyn OperatorHandler>] {
        &self.handlers
    }

    /// Handler at `index` as its concrete type.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Operator`] if there is no handler at `index` or it
    /// has another type.
    pub fn handler<T: OperatorHandler>(&self, index: usize) -> Result<&T, ExecutionError> {
        self.handlers
            .get(index)
            .and_then(|h| h.as_any().downcast_ref::<T>())
            .ok_or_else(|| {
                ExecutionError::Operator(format!(
                    "pipeline {} has no {} at handler index {index}",
                    self.pipeline_id,
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Hands `buffer` to the successors.
    pub fn emit_buffer(&self, buffer: TupleBuffer, worker: WorkerThreadId, policy: ContinuationPolicy) {
        self.emitter.emit(buffer, worker, policy);
    }

    /// Runs the start hook of every handler.
    ///
    /// # Errors
    ///
    /// The first failing hook.
    pub fn start_handlers(&self) -> Result<(), ExecutionError> {
        for handler in &self.handlers {
            if let Some(startable) = handler.as_startable() {
                startable.start(self)?;
            }
        }
        Ok(())
    }

    /// Runs the stop hook of every handler. All hooks run even if one fails.
    ///
    /// # Errors
    ///
    /// The first failure.
    pub fn stop_handlers(&self, termination: QueryTerminationType) -> Result<(), ExecutionError> {
        let mut first_error = None;
        for handler in &self.handlers {
            if let Some(stoppable) = handler.as_stoppable() {
                if let Err(e) = stoppable.stop(termination, self) {
                    tracing::error!(
                        pipeline = %self.pipeline_id,
                        handler = handler.name(),
                        error = %e,
                        "operator handler failed to stop"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forwards `message` to every reconfigurable handler.
    ///
    /// # Errors
    ///
    /// The first failing handler.
    pub fn reconfigure_handlers(&self, message: &ReconfigurationMessage) -> Result<(), ExecutionError> {
        for handler in &self.handlers {
            if let Some(reconfigurable) = handler.as_reconfigurable() {
                reconfigurable.reconfigure(message, self)?;
            }
        }
        Ok(())
    }
}

/// Per-worker execution state: the worker id and a scratch arena reset for
/// every buffer.
#[derive(Debug)]
pub struct WorkerContext {
    worker: WorkerThreadId,
    arena: Arena,
}

impl WorkerContext {
    /// Creates the context of `worker`.
    #[must_use]
    pub fn new(worker: WorkerThreadId) -> Self {
        Self {
            worker,
            arena: Arena::new(),
        }
    }

    /// Worker id.
    #[must_use]
    pub fn worker(&self) -> WorkerThreadId {
        self.worker
    }

    /// Scratch arena.
    pub fn arena(&mut self) -> &mut Arena {
        &mut self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferManager;

    struct Noop;

    impl OperatorHandler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn context(handlers: Vec<Arc<dyn OperatorHandler>>) -> (PipelineExecutionContext, Arc<CollectingEmitter>) {
        let emitter = Arc::new(CollectingEmitter::new());
        let ctx = PipelineExecutionContext::new(
            PipelineId(1),
            2,
            Arc::new(BufferManager::new(64, 4, 0)),
            handlers,
            emitter.clone(),
        );
        (ctx, emitter)
    }

    #[test]
    fn test_typed_handler_access() {
        let (ctx, _) = context(vec![Arc::new(Noop) as Arc<dyn OperatorHandler>]);
        assert!(ctx.handler::<Noop>(0).is_ok());
        assert!(matches!(ctx.handler::<Noop>(1), Err(ExecutionError::Operator(_))));
        assert!(ctx.operator_handler(0).unwrap().as_stoppable().is_none());
        // handlers without hooks are skipped
        ctx.start_handlers().unwrap();
        ctx.stop_handlers(QueryTerminationType::Graceful).unwrap();
    }

    #[test]
    fn test_emit_collects() {
        let (ctx, emitter) = context(Vec::new());
        let buffer = ctx.buffer_provider().get_buffer_blocking();
        ctx.emit_buffer(buffer, WorkerThreadId(1), ContinuationPolicy::Never);
        assert_eq!(emitter.len(), 1);
        assert_eq!(emitter.take().len(), 1);
        assert!(emitter.is_empty());
        assert_eq!(ctx.buffer_provider().available_buffers(), 4);
    }
}
