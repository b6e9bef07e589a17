//! Pipeline stages and the interpreted operator chain.

use bumpalo::Bump;
use tracing::debug;

use super::{
    ContinuationPolicy, ExecutionError, PhysicalOperator, PipelineExecutionContext,
    QueryTerminationType, WorkerContext,
};
use crate::layout::{LayoutRef, MemoryLayout, RecordBuffer, Value};
use crate::memory::TupleBuffer;
use crate::window::{AggregationOperatorHandler, JoinOperatorHandler};

/// Scratch memory for one stage invocation, reset before every buffer.
#[derive(Debug, Default)]
pub struct Arena {
    bump: Bump,
}

impl Arena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying bump allocator.
    #[must_use]
    pub fn bump(&self) -> &Bump {
        &self.bump
    }

    /// Frees everything allocated since the last reset.
    pub fn reset(&mut self) {
        self.bump.reset();
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }
}

/// Code executed by a pipeline for every input buffer.
///
/// Implementations must be callable from several worker threads at once;
/// per-thread scratch state lives in the [`WorkerContext`].
pub trait ExecutablePipelineStage: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &str;

    /// Validates the stage against its context before the pipeline starts.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Compilation`] if the stage cannot run in `ctx`.
    fn setup(&self, _ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Called once before the first buffer. Starts the operator handlers.
    ///
    /// # Errors
    ///
    /// Handler start failures.
    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        ctx.start_handlers()
    }

    /// Processes one input buffer.
    ///
    /// # Errors
    ///
    /// Any operator failure; the pipeline fails.
    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<(), ExecutionError>;

    /// Called once after the last buffer. Stops (drains) the operator
    /// handlers.
    ///
    /// # Errors
    ///
    /// Handler stop failures.
    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError> {
        ctx.stop_handlers(termination)
    }
}

/// Runs a chain of [`PhysicalOperator`]s over the records of each buffer.
#[derive(Debug)]
pub struct InterpretedPipelineStage {
    name: String,
    input: LayoutRef,
    operators: Vec<PhysicalOperator>,
}

impl InterpretedPipelineStage {
    /// Builds a stage from `operators`.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::Compilation`] unless the chain starts with a scan,
    /// ends with exactly one sink operator and every expression only
    /// references fields of the record it sees.
    pub fn new(name: impl Into<String>, operators: Vec<PhysicalOperator>) -> Result<Self, ExecutionError> {
        let name = name.into();
        let Some(PhysicalOperator::Scan { layout }) = operators.first() else {
            return Err(ExecutionError::Compilation(format!(
                "pipeline {name} does not start with a scan"
            )));
        };
        let input = layout.clone();

        let mut width = input.schema().len();
        let last = operators.len() - 1;
        for (i, operator) in operators.iter().enumerate().skip(1) {
            let misplaced = match operator {
                PhysicalOperator::Scan { .. } => true,
                op => op.is_sink() != (i == last),
            };
            if misplaced {
                return Err(ExecutionError::Compilation(format!(
                    "pipeline {name}: {} is misplaced at position {i}",
                    operator.name()
                )));
            }
            match operator {
                PhysicalOperator::Selection { predicate } => check_width(&name, predicate.max_field(), width)?,
                PhysicalOperator::Projection { expressions } => {
                    for expression in expressions {
                        check_width(&name, expression.max_field(), width)?;
                    }
                    width = expressions.len();
                }
                PhysicalOperator::Emit { layout } => {
                    if layout.schema().len() != width {
                        return Err(ExecutionError::Compilation(format!(
                            "pipeline {name}: emit layout has {} fields, records have {width}",
                            layout.schema().len()
                        )));
                    }
                    // one result buffer per input buffer keeps chunk numbering intact
                    if layout.capacity() < input.capacity() {
                        return Err(ExecutionError::Compilation(format!(
                            "pipeline {name}: emit capacity {} below input capacity {}",
                            layout.capacity(),
                            input.capacity()
                        )));
                    }
                }
                _ => {}
            }
        }
        if !operators[last].is_sink() {
            return Err(ExecutionError::Compilation(format!(
                "pipeline {name} does not end with a sink operator"
            )));
        }
        Ok(Self {
            name,
            input,
            operators,
        })
    }

    /// Layout of input buffers.
    #[must_use]
    pub fn input_layout(&self) -> &LayoutRef {
        &self.input
    }

    /// The operator chain.
    #[must_use]
    pub fn operators(&self) -> &[PhysicalOperator] {
        &self.operators
    }
}

fn check_width(name: &str, max_field: Option<usize>, width: usize) -> Result<(), ExecutionError> {
    match max_field {
        Some(field) if field >= width => Err(ExecutionError::Compilation(format!(
            "pipeline {name}: field {field} referenced, records have {width} fields"
        ))),
        _ => Ok(()),
    }
}

impl ExecutablePipelineStage for InterpretedPipelineStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        for operator in &self.operators {
            let found = match operator {
                PhysicalOperator::AggregationBuild { handler } => {
                    ctx.handler::<AggregationOperatorHandler>(*handler).map(|_| ())
                }
                PhysicalOperator::JoinBuild { handler, .. } => {
                    ctx.handler::<JoinOperatorHandler>(*handler).map(|_| ())
                }
                PhysicalOperator::Emit { layout } if layout.buffer_size() > ctx.buffer_provider().buffer_size() => {
                    Err(ExecutionError::Operator(format!(
                        "emit buffers of {} bytes exceed provider buffers of {} bytes",
                        layout.buffer_size(),
                        ctx.buffer_provider().buffer_size()
                    )))
                }
                _ => Ok(()),
            };
            found.map_err(|e| ExecutionError::Compilation(format!("pipeline {}: {e}", self.name)))?;
        }
        debug!(pipeline = %ctx.pipeline_id(), stage = %self.name, operators = self.operators.len(), "interpreted stage ready");
        Ok(())
    }

    fn execute(
        &self,
        buffer: &TupleBuffer,
        ctx: &PipelineExecutionContext,
        worker: &mut WorkerContext,
    ) -> Result<(), ExecutionError> {
        let worker_id = worker.worker();
        let arena = worker.arena();
        arena.reset();

        let view = RecordBuffer::new(buffer, self.input.as_ref());
        let mut records = (0..view.number_of_records())
            .map(|i| view.read_record(i))
            .collect::<Result<Vec<_>, _>>()?;

        for operator in &self.operators[1..] {
            match operator {
                PhysicalOperator::Scan { .. } => {}
                PhysicalOperator::Selection { predicate } => {
                    let keep = arena.bump().alloc_slice_fill_copy(records.len(), false);
                    for (flag, record) in keep.iter_mut().zip(&records) {
                        *flag = predicate.evaluate_predicate(record.as_slice())?;
                    }
                    let mut flags = keep.iter();
                    records.retain(|_| flags.next().copied().unwrap_or(false));
                }
                PhysicalOperator::Projection { expressions } => {
                    records = records
                        .iter()
                        .map(|record| {
                            expressions
                                .iter()
                                .map(|e| e.evaluate(record.as_slice()))
                                .collect::<Result<Vec<Value>, _>>()
                        })
                        .collect::<Result<_, _>>()?;
                }
                PhysicalOperator::AggregationBuild { handler } => {
                    let handler = ctx.handler::<AggregationOperatorHandler>(*handler)?;
                    handler.build_records(worker_id, &records)?;
                    handler.trigger(
                        buffer.watermark(),
                        buffer.sequence_data(),
                        buffer.origin_id(),
                        ctx,
                        worker_id,
                    )?;
                }
                PhysicalOperator::JoinBuild { handler, side } => {
                    let handler = ctx.handler::<JoinOperatorHandler>(*handler)?;
                    handler.build_records(*side, worker_id, &records, ctx.buffer_provider())?;
                    handler.trigger(
                        buffer.watermark(),
                        buffer.sequence_data(),
                        buffer.origin_id(),
                        ctx,
                        worker_id,
                    )?;
                }
                PhysicalOperator::Emit { layout } => {
                    let provider = ctx.buffer_provider();
                    let output = provider.get_buffer_blocking();
                    output.copy_metadata_from(buffer);
                    let writer = RecordBuffer::new(&output, layout.as_ref());
                    for record in &records {
                        writer.push_record(record, provider)?;
                    }
                    ctx.emit_buffer(output, worker_id, ContinuationPolicy::Possible);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::expression::Expression;
    use crate::identifiers::{OriginId, PipelineId, WorkerThreadId};
    use crate::layout::{DataType, RowLayout, Schema};
    use crate::memory::{BufferManager, BufferProvider};
    use crate::pipeline::CollectingEmitter;
    use crate::sequence::SequenceData;
    use crate::time::Timestamp;

    fn input() -> LayoutRef {
        let schema = Schema::default()
            .with_field("id", DataType::UInt64)
            .with_field("value", DataType::Int32);
        Arc::new(RowLayout::new(schema, 120).unwrap())
    }

    fn output() -> LayoutRef {
        let schema = Schema::default()
            .with_field("id", DataType::UInt64)
            .with_field("doubled", DataType::Int64);
        Arc::new(RowLayout::new(schema, 160).unwrap())
    }

    fn filter_and_double() -> Vec<PhysicalOperator> {
        vec![
            PhysicalOperator::Scan { layout: input() },
            PhysicalOperator::Selection {
                predicate: Expression::field(1).gt(Expression::constant(Value::Int32(2))),
            },
            PhysicalOperator::Projection {
                expressions: vec![Expression::field(0), Expression::field(1).add(Expression::field(1))],
            },
            PhysicalOperator::Emit { layout: output() },
        ]
    }

    #[test]
    fn test_invalid_chains_rejected() {
        let no_scan = vec![PhysicalOperator::Emit { layout: output() }];
        assert!(InterpretedPipelineStage::new("a", no_scan).is_err());

        let no_sink = vec![PhysicalOperator::Scan { layout: input() }];
        assert!(InterpretedPipelineStage::new("b", no_sink).is_err());

        let wide = vec![
            PhysicalOperator::Scan { layout: input() },
            PhysicalOperator::Selection {
                predicate: Expression::field(5).eq(Expression::field(0)),
            },
            PhysicalOperator::Emit { layout: input() },
        ];
        assert!(matches!(
            InterpretedPipelineStage::new("c", wide),
            Err(ExecutionError::Compilation(_))
        ));

        let sink_in_middle = vec![
            PhysicalOperator::Scan { layout: input() },
            PhysicalOperator::Emit { layout: input() },
            PhysicalOperator::Emit { layout: input() },
        ];
        assert!(InterpretedPipelineStage::new("d", sink_in_middle).is_err());
    }

    #[test]
    fn test_selection_projection_emit() {
        let manager = BufferManager::new(256, 8, 0);
        let emitter = Arc::new(CollectingEmitter::new());
        let ctx = PipelineExecutionContext::new(
            PipelineId(1),
            1,
            Arc::new(manager.clone()),
            Vec::new(),
            emitter.clone(),
        );
        let stage = InterpretedPipelineStage::new("filter", filter_and_double()).unwrap();
        stage.setup(&ctx).unwrap();

        let buffer = manager.get_buffer_blocking();
        let view = RecordBuffer::new(&buffer, stage.input_layout().as_ref());
        for i in 0..5u64 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            view.push_record(&[Value::UInt64(i), Value::Int32(i as i32)], &manager)
                .unwrap();
        }
        buffer.set_origin_id(OriginId(4));
        buffer.set_sequence_data(SequenceData::new(7, 2, true));
        buffer.set_watermark(Timestamp(99));

        let mut worker = WorkerContext::new(WorkerThreadId(0));
        stage.execute(&buffer, &ctx, &mut worker).unwrap();

        let out = emitter.take();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].origin_id(), OriginId(4));
        assert_eq!(out[0].sequence_data(), SequenceData::new(7, 2, true));
        assert_eq!(out[0].watermark(), Timestamp(99));
        let output = output();
        let view = RecordBuffer::new(&out[0], output.as_ref());
        let rows: Vec<_> = (0..view.number_of_records())
            .map(|i| view.read_record(i).unwrap())
            .collect();
        assert_eq!(
            rows,
            vec![
                vec![Value::UInt64(3), Value::Int64(6)],
                vec![Value::UInt64(4), Value::Int64(8)],
            ]
        );
    }

    #[test]
    fn test_setup_checks_handlers() {
        let ctx = PipelineExecutionContext::new(
            PipelineId(2),
            1,
            Arc::new(BufferManager::new(256, 2, 0)),
            Vec::new(),
            Arc::new(CollectingEmitter::new()),
        );
        let stage = InterpretedPipelineStage::new(
            "agg",
            vec![
                PhysicalOperator::Scan { layout: input() },
                PhysicalOperator::AggregationBuild { handler: 0 },
            ],
        )
        .unwrap();
        assert!(matches!(stage.setup(&ctx), Err(ExecutionError::Compilation(_))));
    }

    #[test]
    fn test_arena_reset() {
        let mut arena = Arena::new();
        arena.bump().alloc_slice_fill_copy(128, 0u32);
        assert!(arena.allocated_bytes() >= 512);
        arena.reset();
        let again = arena.bump().alloc_slice_fill_copy(4, 1u8);
        assert_eq!(again, &[1, 1, 1, 1]);
    }
}
