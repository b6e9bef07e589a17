//! Engine configuration.
//!
//! Loading configuration files is left to the embedding process; the types
//! here only derive `serde` so that any format can be used.

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Default size of pooled buffers in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of pooled buffers.
pub const DEFAULT_NUMBER_OF_BUFFERS: usize = 1024;

/// Default budget for unpooled buffers (64 MiB).
pub const DEFAULT_MAX_UNPOOLED_BYTES: usize = 64 << 20;

/// Default number of buffers reserved per source.
pub const DEFAULT_BUFFERS_PER_SOURCE: usize = 64;

/// Default sequencer backlog above which a warning is logged.
pub const DEFAULT_SEQUENCER_BACKLOG_WARNING: usize = 1024;

/// Configuration of a [`WorkerNode`](crate::engine::WorkerNode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of pooled buffers in bytes.
    pub buffer_size: usize,

    /// Number of pooled buffers in the global pool.
    pub number_of_buffers: usize,

    /// Bytes available for unpooled buffers (text children, state payloads).
    pub max_unpooled_bytes: usize,

    /// Number of worker threads executing pipelines.
    pub worker_threads: usize,

    /// Buffers moved into each source's local pool.
    pub buffers_per_source: usize,

    /// Parked out-of-order buffers per origin above which a warning is
    /// logged.
    pub sequencer_backlog_warning: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            number_of_buffers: DEFAULT_NUMBER_OF_BUFFERS,
            max_unpooled_bytes: DEFAULT_MAX_UNPOOLED_BYTES,
            worker_threads: 1,
            buffers_per_source: DEFAULT_BUFFERS_PER_SOURCE,
            sequencer_backlog_warning: DEFAULT_SEQUENCER_BACKLOG_WARNING,
        }
    }
}

impl EngineConfig {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Checks that every size and count is usable.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), EngineError> {
        let nonzero = [
            ("buffer_size", self.buffer_size),
            ("number_of_buffers", self.number_of_buffers),
            ("worker_threads", self.worker_threads),
            ("buffers_per_source", self.buffers_per_source),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(EngineError::InvalidConfig(format!("{name} must be greater than zero")));
        }
        if self.buffers_per_source > self.number_of_buffers {
            return Err(EngineError::InvalidConfig(format!(
                "buffers_per_source ({}) exceeds number_of_buffers ({})",
                self.buffers_per_source, self.number_of_buffers
            )));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the pooled buffer size.
    #[must_use]
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    /// Sets the number of pooled buffers.
    #[must_use]
    pub fn number_of_buffers(mut self, count: usize) -> Self {
        self.config.number_of_buffers = count;
        self
    }

    /// Sets the unpooled budget.
    #[must_use]
    pub fn max_unpooled_bytes(mut self, bytes: usize) -> Self {
        self.config.max_unpooled_bytes = bytes;
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Sets the local pool size of each source.
    #[must_use]
    pub fn buffers_per_source(mut self, count: usize) -> Self {
        self.config.buffers_per_source = count;
        self
    }

    /// Sets the sequencer backlog warning threshold.
    #[must_use]
    pub fn sequencer_backlog_warning(mut self, pending: usize) -> Self {
        self.config.sequencer_backlog_warning = pending;
        self
    }

    /// Validates and returns the configuration.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::validate`].
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
