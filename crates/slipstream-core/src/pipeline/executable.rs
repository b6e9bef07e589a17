//! Pipeline lifecycle around a stage.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use super::{
    ExecutablePipelineStage, ExecutionError, PipelineExecutionContext, QueryTerminationType,
    ReconfigurationMessage, WorkerContext,
};
use crate::identifiers::PipelineId;
use crate::memory::TupleBuffer;

/// Lifecycle status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Built, not started.
    Created = 0,
    /// Accepting buffers.
    Running = 1,
    /// Stopped after draining (terminal).
    Stopped = 2,
    /// Failed (terminal).
    Failed = 3,
}

impl PipelineStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// True for `Stopped` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of [`ExecutablePipeline::execute`].
#[derive(Debug)]
pub enum ExecutionResult {
    /// The buffer was processed.
    Ok,
    /// The pipeline no longer runs; the buffer was ignored.
    Finished,
    /// Processing failed; the pipeline is now `Failed`.
    Error(ExecutionError),
}

impl ExecutionResult {
    /// True for [`ExecutionResult::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// A stage plus its context and lifecycle.
///
/// `execute` may be called concurrently from all worker threads. `stop`
/// waits for in-flight executions before draining the operator handlers and
/// only takes effect once.
pub struct ExecutablePipeline {
    stage: Box<dyn ExecutablePipelineStage>,
    context: PipelineExecutionContext,
    status: AtomicU8,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl fmt::Debug for ExecutablePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutablePipeline")
            .field("stage", &self.stage.name())
            .field("status", &self.status())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ExecutablePipeline {
    /// Creates a pipeline in status `Created`.
    #[must_use]
    pub fn new(stage: Box<dyn ExecutablePipelineStage>, context: PipelineExecutionContext) -> Self {
        Self {
            stage,
            context,
            status: AtomicU8::new(PipelineStatus::Created as u8),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Pipeline id.
    #[must_use]
    pub fn id(&self) -> PipelineId {
        self.context.pipeline_id()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Execution context.
    #[must_use]
    pub fn context(&self) -> &PipelineExecutionContext {
        &self.context
    }

    /// Stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }

    fn transition(&self, from: PipelineStatus, to: PipelineStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sets up and starts the stage and its handlers.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::InvalidState`] unless `Created`; setup and start
    /// failures, after which the pipeline is `Failed`.
    pub fn start(&self) -> Result<(), ExecutionError> {
        let actual = self.status();
        if actual != PipelineStatus::Created {
            return Err(ExecutionError::InvalidState {
                expected: "Created",
                actual,
            });
        }
        let started = self
            .stage
            .setup(&self.context)
            .and_then(|()| self.stage.start(&self.context));
        if let Err(e) = started {
            self.status.store(PipelineStatus::Failed as u8, Ordering::Release);
            error!(pipeline = %self.id(), error = %e, "pipeline failed to start");
            return Err(e);
        }
        if !self.transition(PipelineStatus::Created, PipelineStatus::Running) {
            return Err(ExecutionError::InvalidState {
                expected: "Created",
                actual: self.status(),
            });
        }
        info!(pipeline = %self.id(), stage = %self.stage.name(), "pipeline started");
        Ok(())
    }

    /// Runs the stage on `buffer`.
    ///
    /// Returns [`ExecutionResult::Finished`] if the pipeline is not running.
    /// A failing stage fails the whole pipeline.
    pub fn execute(&self, buffer: &TupleBuffer, worker: &mut WorkerContext) -> ExecutionResult {
        {
            let mut in_flight = self.in_flight.lock();
            if self.status() != PipelineStatus::Running {
                return ExecutionResult::Finished;
            }
            *in_flight += 1;
        }
        let result = self.stage.execute(buffer, &self.context, worker);
        self.finish_execution();
        match result {
            Ok(()) => ExecutionResult::Ok,
            Err(e) => {
                error!(
                    pipeline = %self.id(),
                    origin = %buffer.origin_id(),
                    sequence = buffer.sequence_number(),
                    error = %e,
                    "pipeline execution failed"
                );
                self.fail();
                ExecutionResult::Error(e)
            }
        }
    }

    fn finish_execution(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            self.idle.wait(&mut in_flight);
        }
    }

    /// Stops the pipeline: waits for in-flight executions, then stops the
    /// stage, which drains the operator handlers.
    ///
    /// Returns `false` if the pipeline was already stopped or failed.
    ///
    /// # Errors
    ///
    /// Handler stop failures; the pipeline ends `Failed`.
    pub fn stop(&self, termination: QueryTerminationType) -> Result<bool, ExecutionError> {
        let target = if termination == QueryTerminationType::Failure {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Stopped
        };
        if self.transition(PipelineStatus::Created, target) {
            info!(pipeline = %self.id(), "pipeline stopped before start");
            return Ok(true);
        }
        if !self.transition(PipelineStatus::Running, target) {
            return Ok(false);
        }
        self.wait_idle();
        if let Err(e) = self.stage.stop(termination, &self.context) {
            self.status.store(PipelineStatus::Failed as u8, Ordering::Release);
            error!(pipeline = %self.id(), error = %e, "pipeline failed to stop");
            return Err(e);
        }
        info!(pipeline = %self.id(), ?termination, "pipeline stopped");
        Ok(true)
    }

    /// Marks the pipeline `Failed` and discards handler state.
    ///
    /// Returns `false` if the pipeline had already terminated.
    pub fn fail(&self) -> bool {
        match self.stop(QueryTerminationType::Failure) {
            Ok(changed) => changed,
            Err(e) => {
                error!(pipeline = %self.id(), error = %e, "discarding handler state failed");
                true
            }
        }
    }

    /// Forwards a reconfiguration to the handlers.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::InvalidState`] unless `Running`; handler failures.
    pub fn reconfigure(&self, message: &ReconfigurationMessage) -> Result<(), ExecutionError> {
        let actual = self.status();
        if actual != PipelineStatus::Running {
            return Err(ExecutionError::InvalidState {
                expected: "Running",
                actual,
            });
        }
        self.context.reconfigure_handlers(message)
    }
}
