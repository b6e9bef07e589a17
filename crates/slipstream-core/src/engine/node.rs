//! Top-level owner of one runtime process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::query_manager::{PipelineDescriptor, QueryManager};
use super::source::{Source, SourceEmitter, SourceRunner};
use super::EngineError;
use crate::config::EngineConfig;
use crate::identifiers::{OriginId, PipelineId};
use crate::memory::{BufferManager, TupleBuffer};
use crate::pipeline::{PipelineStatus, QueryTerminationType, ReconfigurationMessage};

/// Feeds the buffers of one source into a pipeline.
struct PipelineFeeder {
    queries: Arc<QueryManager>,
    target: PipelineId,
}

impl SourceEmitter for PipelineFeeder {
    fn emit(&self, origin: OriginId, buffer: TupleBuffer) {
        if let Err(e) = self.queries.submit(self.target, buffer) {
            warn!(%origin, pipeline = %self.target, error = %e, "dropping source buffer");
        }
    }

    fn end_of_stream(&self, origin: OriginId, termination: QueryTerminationType) {
        if let Err(e) = self.queries.producer_finished(self.target, termination) {
            warn!(%origin, pipeline = %self.target, error = %e, "cannot report end of stream");
        }
    }
}

/// Owns the configuration, the global buffer pool, the query manager and
/// the sources of one process.
///
/// Typical use: [`register_pipeline`](Self::register_pipeline) for every
/// pipeline (successors first), [`add_source`](Self::add_source) for every
/// source, then [`start`](Self::start).
pub struct WorkerNode {
    config: EngineConfig,
    buffers: BufferManager,
    queries: Arc<QueryManager>,
    sources: Mutex<Vec<SourceRunner>>,
}

impl fmt::Debug for WorkerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerNode")
            .field("config", &self.config)
            .field("buffers", &self.buffers)
            .field("queries", &self.queries)
            .field("sources", &self.sources.lock().len())
            .finish()
    }
}

impl WorkerNode {
    /// Validates `config`, allocates the buffer pool and spawns the worker
    /// threads.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] or [`EngineError::SpawnFailed`].
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let buffers = BufferManager::from_config(&config);
        let queries = Arc::new(QueryManager::new(buffers.clone(), &config)?);
        info!(
            buffer_size = config.buffer_size,
            buffers = config.number_of_buffers,
            workers = config.worker_threads,
            "worker node created"
        );
        Ok(Self {
            config,
            buffers,
            queries,
            sources: Mutex::new(Vec::new()),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Global buffer pool.
    #[must_use]
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffers
    }

    /// Query manager running the pipelines.
    #[must_use]
    pub fn query_manager(&self) -> &QueryManager {
        &self.queries
    }

    /// Registers a pipeline.
    ///
    /// # Errors
    ///
    /// See [`QueryManager::register`].
    pub fn register_pipeline(&self, descriptor: PipelineDescriptor) -> Result<(), EngineError> {
        self.queries.register(descriptor)
    }

    /// Attaches `source` as a producer of pipeline `target`, stamping
    /// `origin` on its buffers. The source gets its own pool of
    /// `buffers_per_source` buffers and starts with [`start`](Self::start).
    ///
    /// Blocks until the global pool can spare those buffers.
    ///
    /// # Errors
    ///
    /// [`EngineError::Buffer`] when the global pool cannot reserve the
    /// source's buffers, [`EngineError::UnknownPipeline`] or
    /// [`EngineError::SpawnFailed`].
    pub fn add_source(
        &self,
        origin: OriginId,
        source: Box<dyn Source>,
        target: PipelineId,
    ) -> Result<(), EngineError> {
        let pool = self
            .buffers
            .create_local_buffer_pool(self.config.buffers_per_source)?;
        self.queries.add_producer(target)?;
        let feeder = Arc::new(PipelineFeeder {
            queries: Arc::clone(&self.queries),
            target,
        });
        let runner = SourceRunner::spawn(origin, source, pool, feeder)?;
        self.sources.lock().push(runner);
        Ok(())
    }

    /// Starts all pipelines, then all idle sources.
    ///
    /// # Errors
    ///
    /// The first pipeline or source start failure.
    pub fn start(&self) -> Result<(), EngineError> {
        self.queries.start_all()?;
        for source in self.sources.lock().iter() {
            if source.state() == super::SourceState::Idle {
                source.start()?;
            }
        }
        Ok(())
    }

    /// Asks every source to stop. Pipelines drain and stop once their
    /// producers reported end of stream.
    pub fn stop(&self) {
        for source in self.sources.lock().iter() {
            source.stop();
        }
    }

    /// Forwards `message` to the handlers of pipeline `id`.
    ///
    /// # Errors
    ///
    /// See [`QueryManager::reconfigure`].
    pub fn reconfigure(&self, id: PipelineId, message: &ReconfigurationMessage) -> Result<(), EngineError> {
        self.queries.reconfigure(id, message)
    }

    /// Status of pipeline `id`.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn status(&self, id: PipelineId) -> Result<PipelineStatus, EngineError> {
        self.queries.status(id)
    }

    /// Waits up to `timeout` for pipeline `id` to terminate.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownPipeline`].
    pub fn wait_for_termination(&self, id: PipelineId, timeout: Duration) -> Result<bool, EngineError> {
        self.queries.wait_for_termination(id, timeout)
    }

    /// Stops and joins all sources, then shuts the query manager down.
    /// Idempotent.
    pub fn shutdown(&self) {
        let sources = std::mem::take(&mut *self.sources.lock());
        for source in &sources {
            source.stop();
        }
        for source in &sources {
            source.join();
        }
        drop(sources);
        self.queries.shutdown();
    }
}

impl Drop for WorkerNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
