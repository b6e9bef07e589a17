//! Stages backed by natively compiled pipeline functions.
//!
//! A compiler backend produces one function per pipeline with the
//! [`CompiledPipelineFn`] signature. The function reads the input buffer,
//! uses the arena for scratch memory and calls back into the runtime through
//! the `proxy_*` functions.

#![allow(unsafe_code)]

use tracing::debug;

use super::{
    Arena, ContinuationPolicy, ExecutablePipelineStage, ExecutionError, PipelineExecutionContext,
    WorkerContext,
};
use crate::identifiers::WorkerThreadId;
use crate::memory::TupleBuffer;

/// Entry point of a compiled pipeline.
///
/// Arguments are the execution context, the input buffer and the worker's
/// scratch arena. All three are valid for the duration of the call. The
/// context must only be accessed through the `proxy_*` functions.
pub type CompiledPipelineFn =
    unsafe extern "C" fn(*mut PipelineExecutionContext, *const TupleBuffer, *mut Arena);

/// Emits a copy of the buffer handle at `buffer` to the pipeline's
/// successors.
///
/// # Safety
///
/// `ctx` and `buffer` must be the valid, non-null pointers passed to the
/// running [`CompiledPipelineFn`] or point to live objects of the right type.
pub unsafe extern "C" fn proxy_emit_buffer(
    ctx: *mut PipelineExecutionContext,
    buffer: *const TupleBuffer,
    worker: usize,
) {
    // SAFETY: the caller guarantees both pointers reference live objects for
    // the duration of this call; only shared access is taken.
    let (ctx, buffer) = unsafe { (&*ctx, &*buffer) };
    ctx.emit_buffer(buffer.clone(), WorkerThreadId(worker), ContinuationPolicy::Possible);
}

/// Stage that calls a compiled function per buffer.
#[derive(Debug, Clone)]
pub struct NativePipelineStage {
    name: String,
    function: CompiledPipelineFn,
}

impl NativePipelineStage {
    /// Wraps `function`.
    ///
    /// # Safety
    ///
    /// `function` must honour the contract of [`CompiledPipelineFn`]: it
    /// must not retain any of its pointers past the call, must not unwind,
    /// and must only reach the context through the `proxy_*` functions.
    #[must_use]
    pub unsafe fn new(name: impl Into<String>, function: CompiledPipelineFn) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }
}

impl ExecutablePipelineStage for NativePipelineStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        debug!(pipeline = %ctx.pipeline_id(), stage = %self.name, "native stage ready");
        Ok(())
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<(), ExecutionError> {
        let arena = worker.arena();
        arena.reset();
        let ctx_ptr = std::ptr::from_ref(ctx).cast_mut();
        let buffer_ptr = std::ptr::from_ref(buffer);
        let arena_ptr = std::ptr::from_mut(arena);
        // SAFETY: the constructor's contract makes `function` a valid compiled
        // pipeline; all pointers come from live references that outlive the
        // call, and the context is only read through the proxies.
        unsafe { (self.function)(ctx_ptr, buffer_ptr, arena_ptr) };
        Ok(())
    }
}
