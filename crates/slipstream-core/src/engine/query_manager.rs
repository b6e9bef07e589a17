//! Worker threads executing pipelines.
//!
//! All pipelines of a [`QueryManager`] share one FIFO task queue served by a
//! fixed number of worker threads. Each registered pipeline counts its
//! producers (sources and upstream pipelines); once the last one finished, an
//! end-of-stream task stops the pipeline after every buffer submitted before
//! it was processed, and the pipeline's successors are told in turn.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::sink::Sink;
use super::task::{Task, TaskQueue};
use super::EngineError;
use crate::config::EngineConfig;
use crate::identifiers::{OriginId, PipelineId, WorkerThreadId};
use crate::memory::{BufferManager, TupleBuffer};
use crate::pipeline::{
    BufferEmitter, ContinuationPolicy, ExecutablePipeline, ExecutablePipelineStage,
    ExecutionResult, OperatorHandler, PipelineExecutionContext, PipelineStatus,
    QueryTerminationType, ReconfigurationMessage, WorkerContext,
};
use crate::sequence::Sequencer;

/// Where a pipeline's output goes.
#[derive(Clone)]
pub enum Successor {
    /// Another pipeline of the same manager, run as a new task.
    Pipeline(PipelineId),
    /// A sink, written on the emitting worker.
    Sink(Arc<dyn Sink>),
}

impl fmt::Debug for Successor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline(id) => f.debug_tuple("Pipeline").field(id).finish(),
            Self::Sink(sink) => f.debug_tuple("Sink").field(&sink.name()).finish(),
        }
    }
}

/// Everything needed to register a pipeline.
pub struct PipelineDescriptor {
    id: PipelineId,
    stage: Box<dyn ExecutablePipelineStage>,
    handlers: Vec<Arc<dyn OperatorHandler>>,
    successors: Vec<Successor>,
    ordered: bool,
}

impl fmt::Debug for PipelineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDescriptor")
            .field("id", &self.id)
            .field("stage", &self.stage.name())
            .field("handlers", &self.handlers.len())
            .field("successors", &self.successors)
            .field("ordered", &self.ordered)
            .finish()
    }
}

impl PipelineDescriptor {
    /// Describes pipeline `id` running `stage`.
    #[must_use]
    pub fn new(id: PipelineId, stage: Box<dyn ExecutablePipelineStage>) -> Self {
        Self {
            id,
            stage,
            handlers: Vec::new(),
            successors: Vec::new(),
            ordered: false,
        }
    }

    /// Adds an operator handler; the stage addresses it by position.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn OperatorHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Adds a successor.
    #[must_use]
    pub fn with_successor(mut self, successor: Successor) -> Self {
        self.successors.push(successor);
        self
    }

    /// Runs buffers of each origin in `(sequence, chunk)` order.
    #[must_use]
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }
}

struct RunningPipeline {
    pipeline: ExecutablePipeline,
    successors: Vec<Successor>,
    sequencers: Option<Mutex<FxHashMap<OriginId, Arc<Sequencer<TupleBuffer>>>>>,
    producers: AtomicUsize,
    outstanding: AtomicUsize,
    terminated: AtomicBool,
}

impl RunningPipeline {
    fn sequencer(&self, origin: OriginId, backlog_warning: usize) -> Option<Arc<Sequencer<TupleBuffer>>> {
        let sequencers = self.sequencers.as_ref()?;
        let mut sequencers = sequencers.lock();
        Some(Arc::clone(sequencers.entry(origin).or_insert_with(|| {
            Arc::new(Sequencer::with_backlog_warning(backlog_warning))
        })))
    }

    fn parked_buffers(&self) -> usize {
        self.sequencers
            .as_ref()
            .map_or(0, |s| s.lock().values().map(|q| q.pending()).sum())
    }
}

struct Shared {
    queue: TaskQueue,
    pipelines: RwLock<FxHashMap<PipelineId, Arc<RunningPipeline>>>,
    buffers: BufferManager,
    workers: usize,
    backlog_warning: usize,
    // live producing pipelines per sink, keyed by sink address
    sink_producers: Mutex<FxHashMap<usize, usize>>,
    terminations: Mutex<()>,
    terminated: Condvar,
}

fn sink_key(sink: &Arc<dyn Sink>) -> usize {
    Arc::as_ptr(sink).cast::<()>() as usize
}

impl Shared {
    fn lookup(&self, id: PipelineId) -> Result<Arc<RunningPipeline>, EngineError> {
        self.pipelines
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownPipeline(id))
    }

    fn submit(&self, id: PipelineId, buffer: TupleBuffer) -> Result<(), EngineError> {
        let running = self.lookup(id)?;
        running.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.queue.push(Task::Execute { pipeline: id, buffer }).is_err() {
            running.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(EngineError::ShutDown);
        }
        Ok(())
    }

    fn producer_finished(&self, id: PipelineId, termination: QueryTerminationType) -> Result<(), EngineError> {
        let running = self.lookup(id)?;
        let previous = running
            .producers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(1)))
            .unwrap_or(0);
        debug!(pipeline = %id, remaining = previous.saturating_sub(1), ?termination, "producer finished");
        if previous <= 1 || termination == QueryTerminationType::Failure {
            self.end_of_stream(id, termination)?;
        }
        Ok(())
    }

    fn end_of_stream(&self, id: PipelineId, termination: QueryTerminationType) -> Result<(), EngineError> {
        self.queue
            .push(Task::EndOfStream {
                pipeline: id,
                termination,
            })
            .map_err(|_| EngineError::ShutDown)
    }

    fn run_worker(&self, worker: WorkerThreadId) {
        let mut context = WorkerContext::new(worker);
        while let Some(task) = self.queue.pop_blocking() {
            match task {
                Task::Execute { pipeline, buffer } => self.execute(pipeline, buffer, &mut context),
                Task::EndOfStream {
                    pipeline,
                    termination,
                } => self.finish(pipeline, termination),
            }
        }
        trace!(%worker, "worker thread exits");
    }

    fn execute(&self, id: PipelineId, buffer: TupleBuffer, context: &mut WorkerContext) {
        let Ok(running) = self.lookup(id) else {
            warn!(pipeline = %id, "dropping buffer for unknown pipeline");
            return;
        };
        match running.sequencer(buffer.origin_id(), self.backlog_warning) {
            Some(sequencer) => self.execute_in_order(&running, &sequencer, buffer, context),
            None => {
                self.execute_once(&running, &buffer, context);
                drop(buffer);
            }
        }
        // buffers are released before the pipeline may count as idle
        running.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// The thread holding the expected buffer runs it and every parked buffer
    /// that becomes due afterwards.
    fn execute_in_order(
        &self,
        running: &RunningPipeline,
        sequencer: &Sequencer<TupleBuffer>,
        buffer: TupleBuffer,
        context: &mut WorkerContext,
    ) {
        let mut next = sequencer.is_next(buffer.sequence_data(), buffer);
        while let Some(buffer) = next {
            if !self.execute_once(running, &buffer, context) {
                return;
            }
            next = match sequencer.advance_and_get_next(buffer.sequence_data()) {
                Ok(next) => next,
                Err(e) => {
                    error!(pipeline = %running.pipeline.id(), error = %e, "sequencer violation");
                    if running.pipeline.fail() {
                        self.notify_successors(running, QueryTerminationType::Failure);
                    }
                    None
                }
            };
        }
    }

    /// Returns false if the pipeline no longer runs.
    fn execute_once(&self, running: &RunningPipeline, buffer: &TupleBuffer, context: &mut WorkerContext) -> bool {
        match running.pipeline.execute(buffer, context) {
            ExecutionResult::Ok => true,
            ExecutionResult::Finished => {
                trace!(pipeline = %running.pipeline.id(), "buffer for finished pipeline dropped");
                false
            }
            ExecutionResult::Error(_) => {
                self.notify_successors(running, QueryTerminationType::Failure);
                false
            }
        }
    }

    fn finish(&self, id: PipelineId, termination: QueryTerminationType) {
        let Ok(running) = self.lookup(id) else {
            warn!(pipeline = %id, "end of stream for unknown pipeline");
            return;
        };
        if termination != QueryTerminationType::Failure
            && running.outstanding.load(Ordering::Acquire) > 0
        {
            if self.end_of_stream(id, termination).is_ok() {
                thread::yield_now();
            }
            return;
        }
        let parked = running.parked_buffers();
        if parked > 0 {
            warn!(pipeline = %id, parked, "out-of-order buffers never became due");
        }
        if let Err(e) = running.pipeline.stop(termination) {
            error!(pipeline = %id, error = %e, "pipeline stop failed");
        }
        let outcome = match running.pipeline.status() {
            PipelineStatus::Failed => QueryTerminationType::Failure,
            _ => termination,
        };
        self.notify_successors(&running, outcome);
    }

    /// Shuts `sink` down once its last producing pipeline terminated; a
    /// failure shuts it down immediately.
    fn sink_producer_finished(&self, id: PipelineId, sink: &Arc<dyn Sink>, termination: QueryTerminationType) {
        let remaining = {
            let mut producers = self.sink_producers.lock();
            let key = sink_key(sink);
            let remaining = producers.get(&key).map_or(0, |p| p.saturating_sub(1));
            if remaining == 0 {
                producers.remove(&key);
            } else {
                producers.insert(key, remaining);
            }
            remaining
        };
        if remaining > 0 && termination != QueryTerminationType::Failure {
            debug!(pipeline = %id, sink = sink.name(), remaining, "sink still has producers");
            return;
        }
        if let Err(e) = sink.shutdown(termination) {
            error!(pipeline = %id, sink = sink.name(), error = %e, "sink shutdown failed");
        }
    }

    /// Runs once per pipeline.
    fn notify_successors(&self, running: &RunningPipeline, termination: QueryTerminationType) {
        if running.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = running.pipeline.id();
        for successor in &running.successors {
            match successor {
                Successor::Pipeline(next) => {
                    if let Err(e) = self.producer_finished(*next, termination) {
                        warn!(pipeline = %id, successor = %next, error = %e, "cannot notify successor");
                    }
                }
                Successor::Sink(sink) => self.sink_producer_finished(id, sink, termination),
            }
        }
        info!(pipeline = %id, ?termination, "pipeline terminated");
        let _guard = self.terminations.lock();
        self.terminated.notify_all();
    }
}

/// Routes the output of one pipeline to its successors.
struct SuccessorEmitter {
    pipeline: PipelineId,
    successors: Vec<Successor>,
    shared: Weak<Shared>,
}

impl BufferEmitter for SuccessorEmitter {
    fn emit(&self, buffer: TupleBuffer, worker: WorkerThreadId, policy: ContinuationPolicy) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if policy == ContinuationPolicy::Repeat {
            if let Err(e) = shared.submit(self.pipeline, buffer) {
                warn!(pipeline = %self.pipeline, error = %e, "cannot repeat buffer");
            }
            return;
        }
        for successor in &self.successors {
            match successor {
                Successor::Pipeline(next) => {
                    if let Err(e) = shared.submit(*next, buffer.clone()) {
                        warn!(pipeline = %self.pipeline, successor = %next, error = %e, "dropping emitted buffer");
                    }
                }
                Successor::Sink(sink) => {
                    if let Err(e) = sink.write_data(&buffer, worker) {
                        error!(
                            pipeline = %self.pipeline,
                            sink = sink.name(),
                            origin = %buffer.origin_id(),
                            sequence = buffer.sequence_number(),
                            error = %e,
                            "sink write failed"
                        );
                    }
                }
            }
        }
    }
}

/// Fixed pool of worker threads executing registered pipelines.
///
/// Register successors before the pipelines feeding them; registration
/// counts the new pipeline as a producer of each successor pipeline.
/// Dropping the manager shuts it down.
pub struct QueryManager {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryManager")
            .field("workers", &self.shared.workers)
            .field("pipelines", &self.shared.pipelines.read().len())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl QueryManager {
    /// Spawns `config.worker_threads` workers.
    ///
    /// # Errors
    ///
    /// [`EngineError::SpawnFailed`]; already spawned workers are shut down.
    pub fn new(buffers: BufferManager, config: &EngineConfig) -> Result<Self, EngineError> {
        let workers = config.worker_threads.max(1);
        let manager = Self {
            shared: Arc::new(Shared {
                queue: TaskQueue::new(),
                pipelines: RwLock::new(FxHashMap::default()),
                buffers,
                workers,
                backlog_warning: config.sequencer_backlog_warning,
                sink_producers: Mutex::new(FxHashMap::default()),
                terminations: Mutex::new(()),
                terminated: Condvar::new(),
            }),
            threads: Mutex::new(Vec::with_capacity(workers)),
        };
        for worker in 0..workers {
            let shared = Arc::clone(&manager.shared);
            let name = format!("slipstream-worker-{worker}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || shared.run_worker(WorkerThreadId(worker)))
                .map_err(|e| EngineError::SpawnFailed {
                    name,
                    message: e.to_string(),
                })?;
            manager.threads.lock().push(handle);
        }
        info!(workers, "query manager started");
        Ok(manager)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn number_of_workers(&self) -> usize {
        self.shared.workers
    }

    /// Global buffer pool handed to every pipeline.
    #[must_use]
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.shared.buffers
    }

    /// Registers a pipeline in status `Created`.
    ///
    /// # Errors
    ///
    /// [`EngineError::DuplicatePipeline`]; [`EngineError::UnknownPipeline`]
    /// if a successor pipeline is not registered yet; sink setup failures.
    pub fn register(&self, descriptor: PipelineDescriptor) -> Result<(), EngineError> {
        let PipelineDescriptor {
            id,
            stage,
            handlers,
            successors,
            ordered,
        } = descriptor;
        let mut pipelines = self.shared.pipelines.write();
        if pipelines.contains_key(&id) {
            return Err(EngineError::DuplicatePipeline(id));
        }
        for successor in &successors {
            match successor {
                Successor::Pipeline(next) if !pipelines.contains_key(next) => {
                    return Err(EngineError::UnknownPipeline(*next));
                }
                Successor::Pipeline(_) => {}
                Successor::Sink(sink) if !self.shared.sink_producers.lock().contains_key(&sink_key(sink)) => {
                    sink.setup()?;
                }
                Successor::Sink(_) => {}
            }
        }
        for successor in &successors {
            match successor {
                Successor::Pipeline(next) => {
                    if let Some(next) = pipelines.get(next) {
                        next.producers.fetch_add(1, Ordering::AcqRel);
                    }
                }
                Successor::Sink(sink) => {
                    *self.shared.sink_producers.lock().entry(sink_key(sink)).or_insert(0) += 1;
                }
            }
        }

        let emitter = Arc::new(SuccessorEmitter {
            pipeline: id,
            successors: successors.clone(),
            shared: Arc::downgrade(&self.shared),
        });
        let context = PipelineExecutionContext::new(
            id,
            self.shared.workers,
            Arc::new(self.shared.buffers.clone()),
            handlers,
            emitter,
        );
        pipelines.insert(
            id,
            Arc::new(RunningPipeline {
                pipeline: ExecutablePipeline::new(stage, context),
                successors,
                sequencers: ordered.then(|| Mutex::new(FxHashMap::default())),
                producers: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
            }),
        );
        debug!(pipeline = %id, ordered, "pipeline registered");
        Ok(())
    }

    /// Counts one more producer (for example a source) of pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn add_producer(&self, id: PipelineId) -> Result<(), EngineError> {
        self.shared.lookup(id)?.producers.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Starts pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`]; setup and start failures.
    pub fn start_pipeline(&self, id: PipelineId) -> Result<(), EngineError> {
        let running = self.shared.lookup(id)?;
        if let Err(e) = running.pipeline.start() {
            self.shared.notify_successors(&running, QueryTerminationType::Failure);
            return Err(e.into());
        }
        Ok(())
    }

    /// Starts every pipeline still in status `Created`, successors first.
    ///
    /// # Errors
    ///
    /// The first start failure.
    pub fn start_all(&self) -> Result<(), EngineError> {
        let mut created: Vec<PipelineId> = self
            .shared
            .pipelines
            .read()
            .iter()
            .filter(|(_, p)| p.pipeline.status() == PipelineStatus::Created)
            .map(|(id, _)| *id)
            .collect();
        created.sort_unstable();
        for id in created {
            self.start_pipeline(id)?;
        }
        Ok(())
    }

    /// Queues `buffer` for pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`] or [`EngineError::ShutDown`].
    pub fn submit(&self, id: PipelineId, buffer: TupleBuffer) -> Result<(), EngineError> {
        self.shared.submit(id, buffer)
    }

    /// Reports that one producer of pipeline `id` finished. The last one
    /// (or any failing one) ends the pipeline's stream.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`] or [`EngineError::ShutDown`].
    pub fn producer_finished(&self, id: PipelineId, termination: QueryTerminationType) -> Result<(), EngineError> {
        self.shared.producer_finished(id, termination)
    }

    /// Ends pipeline `id` regardless of its producers, after the buffers
    /// already queued for it.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`] or [`EngineError::ShutDown`].
    pub fn stop_pipeline(&self, id: PipelineId, termination: QueryTerminationType) -> Result<(), EngineError> {
        self.shared.lookup(id)?;
        self.shared.end_of_stream(id, termination)
    }

    /// Forwards `message` to the handlers of pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`]; pipeline errors.
    pub fn reconfigure(&self, id: PipelineId, message: &ReconfigurationMessage) -> Result<(), EngineError> {
        Ok(self.shared.lookup(id)?.pipeline.reconfigure(message)?)
    }

    /// Status of pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn status(&self, id: PipelineId) -> Result<PipelineStatus, EngineError> {
        Ok(self.shared.lookup(id)?.pipeline.status())
    }

    /// True once pipeline `id` stopped and its successors were notified.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn is_terminated(&self, id: PipelineId) -> Result<bool, EngineError> {
        Ok(self.shared.lookup(id)?.terminated.load(Ordering::Acquire))
    }

    /// Waits up to `timeout` for pipeline `id` to terminate. Returns whether
    /// it did.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn wait_for_termination(&self, id: PipelineId, timeout: Duration) -> Result<bool, EngineError> {
        let running = self.shared.lookup(id)?;
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.terminations.lock();
        while !running.terminated.load(Ordering::Acquire) {
            if self.shared.terminated.wait_until(&mut guard, deadline).timed_out() {
                return Ok(running.terminated.load(Ordering::Acquire));
            }
        }
        Ok(true)
    }

    /// Closes the task queue, dropping queued tasks, and joins the workers.
    /// Idempotent.
    pub fn shutdown(&self) {
        let dropped = self.shared.queue.close();
        if dropped > 0 {
            warn!(dropped, "queued tasks dropped at shutdown");
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("query manager shut down");
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
