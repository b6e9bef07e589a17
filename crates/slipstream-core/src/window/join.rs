//! Window joins over two inputs.
//!
//! Both sides are staged per window in [`PagedVector`]s (bucketing, one
//! slice per window). When a window triggers, every left record is paired
//! with every right record satisfying the join predicate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::{debug, info};

use super::{
    emit_window_records, PagedVector, SliceAssigner, SliceState, TriggeredWindow, WindowError,
    WindowSliceManager, WindowingStrategy,
};
use crate::expression::{BinaryOperator, Expression, JoinedRecord};
use crate::identifiers::{OriginId, WorkerThreadId};
use crate::layout::{
    DataType, KeyBytes, LayoutError, LayoutRef, MemoryLayout, RecordBuffer, RowLayout, Schema,
    Value,
};
use crate::memory::{BufferProvider, TupleBuffer};
use crate::pipeline::{
    ExecutionError, OperatorHandler, PipelineExecutionContext, QueryTerminationType,
    Reconfigurable, ReconfigurationMessage, Startable, Stoppable,
};
use crate::sequence::SequenceData;
use crate::time::Timestamp;

const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 4096;

/// Both build pipelines stop the handler; the second stop is final.
const DEFAULT_EXPECTED_TERMINATIONS: usize = 2;

/// Input side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinSide {
    /// Left input.
    Left,
    /// Right input.
    Right,
}

/// Probe algorithm of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    /// Hash the right side on equi-join keys, probe with the left side.
    HashJoin,
    /// Compare every pair.
    NestedLoopJoin,
}

impl JoinStrategy {
    /// Picks the strategy for `predicate`.
    ///
    /// Hash join applies when the predicate only combines field accesses with
    /// `AND`, `OR`, `=`, `>`, `>=`, `<` and `<=`.
    #[must_use]
    pub fn select(predicate: &Expression) -> Self {
        let mut hashable = true;
        predicate.walk(&mut |node| match node {
            Expression::Binary { op, .. } => {
                hashable &= matches!(
                    op,
                    BinaryOperator::And
                        | BinaryOperator::Or
                        | BinaryOperator::Equals
                        | BinaryOperator::Greater
                        | BinaryOperator::GreaterEquals
                        | BinaryOperator::Less
                        | BinaryOperator::LessEquals
                );
            }
            Expression::Field(_) => {}
            Expression::Constant(_) => hashable = false,
        });
        if hashable {
            Self::HashJoin
        } else {
            Self::NestedLoopJoin
        }
    }
}

/// Left and right records of one window.
#[derive(Debug)]
pub struct JoinSlice {
    left: PagedVector,
    right: PagedVector,
}

impl JoinSlice {
    /// Creates empty sides.
    #[must_use]
    pub fn new(left: LayoutRef, right: LayoutRef) -> Self {
        Self {
            left: PagedVector::new(left),
            right: PagedVector::new(right),
        }
    }

    /// Records of `side`.
    #[must_use]
    pub fn side(&self, side: JoinSide) -> &PagedVector {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    fn side_mut(&mut self, side: JoinSide) -> &mut PagedVector {
        match side {
            JoinSide::Left => &mut self.left,
            JoinSide::Right => &mut self.right,
        }
    }
}

impl SliceState for JoinSlice {
    fn merge(&mut self, other: Self) {
        self.left.append_all(other.left);
        self.right.append_all(other.right);
    }

    fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    fn number_of_records(&self) -> u64 {
        (self.left.len() + self.right.len()) as u64
    }
}

/// Validated description of a window join.
#[derive(Debug, Clone)]
pub struct JoinDefinition {
    left: LayoutRef,
    right: LayoutRef,
    left_time_field: usize,
    right_time_field: usize,
    predicate: Expression,
    assigner: SliceAssigner,
    left_origins: Vec<OriginId>,
    right_origins: Vec<OriginId>,
    output_origin: OriginId,
    output_layout: LayoutRef,
}

impl JoinDefinition {
    /// Describes a join of `left` and `right` on `predicate`.
    ///
    /// Fields in `predicate` index the concatenation `left..., right...`.
    /// Records are staged in pages of `buffer_size` bytes, which is also the
    /// size of result buffers.
    ///
    /// # Errors
    ///
    /// Unknown or non-integer time fields, predicates referencing fields past
    /// the joined width, missing origins, or schemas that do not fit a buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Schema,
        right: Schema,
        left_time_field: &str,
        right_time_field: &str,
        predicate: Expression,
        assigner: SliceAssigner,
        left_origins: &[OriginId],
        right_origins: &[OriginId],
    ) -> Result<Self, WindowError> {
        Self::with_buffer_size(
            left,
            right,
            left_time_field,
            right_time_field,
            predicate,
            assigner,
            left_origins,
            right_origins,
            DEFAULT_OUTPUT_BUFFER_SIZE,
        )
    }

    /// Like [`new`](Self::new) with an explicit page and result buffer size.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    #[allow(clippy::too_many_arguments)]
    pub fn with_buffer_size(
        left: Schema,
        right: Schema,
        left_time_field: &str,
        right_time_field: &str,
        predicate: Expression,
        assigner: SliceAssigner,
        left_origins: &[OriginId],
        right_origins: &[OriginId],
        buffer_size: usize,
    ) -> Result<Self, WindowError> {
        let left_time = time_field(&left, left_time_field)?;
        let right_time = time_field(&right, right_time_field)?;
        let width = left.len() + right.len();
        if predicate.max_field().is_some_and(|f| f >= width) {
            return Err(WindowError::InvalidDefinition(format!(
                "join predicate {predicate} references fields past {width}"
            )));
        }
        if left_origins.is_empty() || right_origins.is_empty() {
            return Err(WindowError::InvalidDefinition(
                "both join inputs need origins".into(),
            ));
        }
        let output = Schema::default()
            .with_field("window_start", DataType::UInt64)
            .with_field("window_end", DataType::UInt64)
            .concat(&left)
            .concat(&right);
        Ok(Self {
            output_layout: Arc::new(RowLayout::new(output, buffer_size)?),
            left: Arc::new(RowLayout::new(left, buffer_size)?),
            right: Arc::new(RowLayout::new(right, buffer_size)?),
            left_time_field: left_time,
            right_time_field: right_time,
            predicate,
            assigner: assigner.with_strategy(WindowingStrategy::Bucketing),
            left_origins: left_origins.to_vec(),
            right_origins: right_origins.to_vec(),
            output_origin: OriginId::INVALID,
        })
    }

    /// Sets the origin stamped on results.
    #[must_use]
    pub fn with_output_origin(mut self, origin: OriginId) -> Self {
        self.output_origin = origin;
        self
    }

    /// Layout of staged records of `side`.
    #[must_use]
    pub fn layout(&self, side: JoinSide) -> &LayoutRef {
        match side {
            JoinSide::Left => &self.left,
            JoinSide::Right => &self.right,
        }
    }

    /// Join predicate.
    #[must_use]
    pub fn predicate(&self) -> &Expression {
        &self.predicate
    }

    /// Slice assigner, always bucketing.
    #[must_use]
    pub fn assigner(&self) -> SliceAssigner {
        self.assigner
    }

    /// Origin stamped on results.
    #[must_use]
    pub fn output_origin(&self) -> OriginId {
        self.output_origin
    }

    /// Layout of emitted buffers: `window_start, window_end, left..., right...`.
    #[must_use]
    pub fn output_layout(&self) -> &LayoutRef {
        &self.output_layout
    }

    fn time_field(&self, side: JoinSide) -> usize {
        match side {
            JoinSide::Left => self.left_time_field,
            JoinSide::Right => self.right_time_field,
        }
    }

    fn origins(&self) -> Vec<OriginId> {
        let mut origins = self.left_origins.clone();
        origins.extend(self.right_origins.iter().filter(|o| !self.left_origins.contains(o)));
        origins
    }

    /// Equi-join field pairs `(left, right)` usable as hash keys.
    fn equi_keys(&self) -> Vec<(usize, usize)> {
        let left_width = self.left.schema().len();
        let mut keys = Vec::new();
        for conjunct in self.predicate.conjuncts() {
            let Expression::Binary {
                op: BinaryOperator::Equals,
                left,
                right,
            } = conjunct
            else {
                continue;
            };
            let (Expression::Field(a), Expression::Field(b)) = (left.as_ref(), right.as_ref()) else {
                continue;
            };
            let (l, r) = match (*a < left_width, *b < left_width) {
                (true, false) => (*a, *b - left_width),
                (false, true) => (*b, *a - left_width),
                _ => continue,
            };
            let lt = self.left.schema().fields()[l].data_type;
            let rt = self.right.schema().fields()[r].data_type;
            if hash_compatible(lt, rt) {
                keys.push((l, r));
            }
        }
        keys
    }
}

fn time_field(schema: &Schema, name: &str) -> Result<usize, WindowError> {
    let index = schema.require(name)?;
    let data_type = schema.fields()[index].data_type;
    if !data_type.is_numeric() || data_type.is_float() {
        return Err(WindowError::InvalidTimestamp { field: index });
    }
    Ok(index)
}

/// Values of these types produce equal key bytes exactly when they are equal.
fn hash_compatible(left: DataType, right: DataType) -> bool {
    left == right
        || (left.is_float() && right.is_float())
        || (left.is_numeric() && !left.is_float() && right.is_numeric() && !right.is_float())
}

fn key_of(record: &[Value], fields: impl Iterator<Item = usize>) -> KeyBytes {
    let mut key = KeyBytes::new();
    for field in fields {
        if let Some(value) = record.get(field) {
            value.encode_key(&mut key);
        }
    }
    key
}

/// Operator handler of a window join.
#[derive(Debug)]
pub struct JoinOperatorHandler {
    definition: Arc<JoinDefinition>,
    strategy: JoinStrategy,
    equi_keys: Vec<(usize, usize)>,
    manager: WindowSliceManager<JoinSlice>,
    terminations: AtomicUsize,
    expected_terminations: usize,
}

impl JoinOperatorHandler {
    /// Creates a handler for `workers` build threads.
    #[must_use]
    pub fn new(definition: JoinDefinition, workers: usize) -> Self {
        let strategy = JoinStrategy::select(&definition.predicate);
        let equi_keys = match strategy {
            JoinStrategy::HashJoin => definition.equi_keys(),
            JoinStrategy::NestedLoopJoin => Vec::new(),
        };
        let manager = WindowSliceManager::new(definition.assigner, workers, &definition.origins());
        Self {
            definition: Arc::new(definition),
            strategy,
            equi_keys,
            manager,
            terminations: AtomicUsize::new(0),
            expected_terminations: DEFAULT_EXPECTED_TERMINATIONS,
        }
    }

    /// Number of [`Stoppable::stop`] calls after which the drain is final.
    #[must_use]
    pub fn with_expected_terminations(mut self, expected: usize) -> Self {
        self.expected_terminations = expected.max(1);
        self
    }

    /// The join definition.
    #[must_use]
    pub fn definition(&self) -> &JoinDefinition {
        &self.definition
    }

    /// Selected probe strategy.
    #[must_use]
    pub fn strategy(&self) -> JoinStrategy {
        self.strategy
    }

    /// The slice manager.
    #[must_use]
    pub fn manager(&self) -> &WindowSliceManager<JoinSlice> {
        &self.manager
    }

    /// Stages records of one side into every window containing them.
    /// Returns the number of records accepted.
    ///
    /// # Errors
    ///
    /// Records that do not match the side's schema or carry no valid
    /// timestamp (checked before any slice is touched), and page allocation
    /// failures.
    pub fn build_records(
        &self,
        side: JoinSide,
        worker: WorkerThreadId,
        records: &[Vec<Value>],
        provider: &dyn BufferProvider,
    ) -> Result<usize, WindowError> {
        let definition = &*self.definition;
        let layout = definition.layout(side);
        let width = layout.schema().len();
        let time_field = definition.time_field(side);
        let mut ranges = Vec::with_capacity(records.len());
        for record in records {
            if record.len() != width {
                return Err(LayoutError::ArityMismatch {
                    expected: width,
                    actual: record.len(),
                }
                .into());
            }
            let ts = record[time_field]
                .as_u64()
                .ok_or(WindowError::InvalidTimestamp { field: time_field })?;
            ranges.push(definition.assigner.slices_for(ts));
        }

        let late = self.manager.with_local(worker, |store| -> Result<u64, WindowError> {
            let mut late = 0u64;
            for (record, ranges) in records.iter().zip(ranges) {
                let mut accepted = false;
                for range in ranges {
                    let factory = || JoinSlice::new(definition.left.clone(), definition.right.clone());
                    if let Some(slice) = store.find_or_create(range, factory) {
                        slice.side_mut(side).append(record, provider)?;
                        accepted = true;
                    }
                }
                if !accepted {
                    late += 1;
                }
            }
            Ok(late)
        })?;
        if late > 0 {
            self.manager.late_records().record_dropped(late);
            debug!(late, ?side, worker = %worker, "dropped late join records");
        }
        Ok(records.len() - usize::try_from(late).unwrap_or(records.len()))
    }

    /// Stages every record of `buffer`.
    ///
    /// # Errors
    ///
    /// Same as [`build_records`](Self::build_records).
    pub fn build(
        &self,
        side: JoinSide,
        worker: WorkerThreadId,
        buffer: &TupleBuffer,
        layout: &dyn MemoryLayout,
        provider: &dyn BufferProvider,
    ) -> Result<usize, WindowError> {
        let view = RecordBuffer::new(buffer, layout);
        let records = (0..view.number_of_records())
            .map(|i| view.read_record(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.build_records(side, worker, &records, provider)
    }

    /// Applies a watermark update of either side and probes every completed
    /// window.
    ///
    /// # Errors
    ///
    /// Unknown origins, predicate evaluation and emission failures.
    pub fn trigger(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
        ctx: &PipelineExecutionContext,
        worker: WorkerThreadId,
    ) -> Result<usize, WindowError> {
        self.manager
            .update_and_trigger(watermark, sequence, origin, &mut |window, slices| {
                self.probe(window, slices, ctx, worker)
            })
    }

    /// Joins the records of one window.
    ///
    /// # Errors
    ///
    /// Unreadable pages or predicate evaluation failures.
    pub fn join_window(&self, slices: &[&JoinSlice]) -> Result<Vec<(Vec<Value>, Vec<Value>)>, WindowError> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for slice in slices {
            left.extend(slice.left.to_records()?);
            right.extend(slice.right.to_records()?);
        }
        if left.is_empty() || right.is_empty() {
            return Ok(Vec::new());
        }
        let predicate = &self.definition.predicate;
        let mut matches = Vec::new();
        if self.equi_keys.is_empty() {
            for l in &left {
                for r in &right {
                    if predicate.evaluate_predicate(&JoinedRecord { left: l, right: r })? {
                        matches.push((l.clone(), r.clone()));
                    }
                }
            }
        } else {
            let mut table: FxHashMap<KeyBytes, Vec<usize>> = FxHashMap::default();
            for (i, r) in right.iter().enumerate() {
                table
                    .entry(key_of(r, self.equi_keys.iter().map(|k| k.1)))
                    .or_default()
                    .push(i);
            }
            for l in &left {
                let Some(candidates) = table.get(&key_of(l, self.equi_keys.iter().map(|k| k.0))) else {
                    continue;
                };
                for &i in candidates {
                    let r = &right[i];
                    if predicate.evaluate_predicate(&JoinedRecord { left: l, right: r })? {
                        matches.push((l.clone(), r.clone()));
                    }
                }
            }
        }
        Ok(matches)
    }

    fn probe(
        &self,
        window: &TriggeredWindow,
        slices: &[&JoinSlice],
        ctx: &PipelineExecutionContext,
        worker: WorkerThreadId,
    ) -> Result<bool, WindowError> {
        let matches = self.join_window(slices)?;
        let rows = matches.into_iter().map(|(l, r)| {
            let mut row = Vec::with_capacity(2 + l.len() + r.len());
            row.push(Value::UInt64(window.info.window_start));
            row.push(Value::UInt64(window.info.window_end));
            row.extend(l);
            row.extend(r);
            row
        });
        emit_window_records(
            window,
            rows,
            self.definition.output_layout.as_ref(),
            self.definition.output_origin,
            ctx,
            worker,
        )
    }
}

impl OperatorHandler for JoinOperatorHandler {
    fn name(&self) -> &'static str {
        "window-join"
    }

    fn as_startable(&self) -> Option<&dyn Startable> {
        Some(self)
    }

    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }

    fn as_reconfigurable(&self) -> Option<&dyn Reconfigurable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Startable for JoinOperatorHandler {
    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        self.terminations.store(0, Ordering::SeqCst);
        info!(
            pipeline = %ctx.pipeline_id(),
            strategy = ?self.strategy,
            size = self.definition.assigner.size(),
            slide = self.definition.assigner.slide(),
            "window join started"
        );
        Ok(())
    }
}

impl Stoppable for JoinOperatorHandler {
    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError> {
        let seen = self.terminations.fetch_add(1, Ordering::SeqCst) + 1;
        let final_pass = seen >= self.expected_terminations;
        let emitted = self
            .manager
            .drain(termination, final_pass, &mut |window, slices| {
                self.probe(window, slices, ctx, WorkerThreadId(0))
            })?;
        debug!(pipeline = %ctx.pipeline_id(), ?termination, final_pass, emitted, "window join stopped");
        Ok(())
    }
}

impl Reconfigurable for JoinOperatorHandler {
    fn reconfigure(
        &self,
        message: &ReconfigurationMessage,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError> {
        match message {
            ReconfigurationMessage::FlushUntil(until) => {
                self.manager.flush_until(*until, &mut |window, slices| {
                    self.probe(window, slices, ctx, WorkerThreadId(0))
                })?;
            }
            ReconfigurationMessage::Reset => {
                let dropped = self.manager.reset();
                info!(pipeline = %ctx.pipeline_id(), dropped, "window join reset");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::PipelineId;
    use crate::memory::BufferManager;
    use crate::pipeline::CollectingEmitter;

    fn left_schema() -> Schema {
        Schema::default()
            .with_field("ts", DataType::UInt64)
            .with_field("id", DataType::UInt32)
            .with_field("speed", DataType::Float64)
    }

    fn right_schema() -> Schema {
        Schema::default()
            .with_field("ts", DataType::UInt64)
            .with_field("id", DataType::Int64)
            .with_field("limit", DataType::Float64)
    }

    fn left(ts: u64, id: u32, speed: f64) -> Vec<Value> {
        vec![Value::UInt64(ts), Value::UInt32(id), Value::Float64(speed)]
    }

    fn right(ts: u64, id: i64, limit: f64) -> Vec<Value> {
        vec![Value::UInt64(ts), Value::Int64(id), Value::Float64(limit)]
    }

    /// `left.id = right.id AND left.speed > right.limit`
    fn speeding() -> Expression {
        Expression::field(1)
            .eq(Expression::field(4))
            .and(Expression::field(2).gt(Expression::field(5)))
    }

    fn definition(predicate: Expression, assigner: SliceAssigner) -> JoinDefinition {
        JoinDefinition::with_buffer_size(
            left_schema(),
            right_schema(),
            "ts",
            "ts",
            predicate,
            assigner,
            &[OriginId(1)],
            &[OriginId(2)],
            256,
        )
        .unwrap()
        .with_output_origin(OriginId(9))
    }

    fn context(manager: &BufferManager) -> (PipelineExecutionContext, Arc<CollectingEmitter>) {
        let emitter = Arc::new(CollectingEmitter::new());
        let ctx = PipelineExecutionContext::new(
            PipelineId(3),
            1,
            Arc::new(manager.clone()),
            Vec::new(),
            emitter.clone(),
        );
        (ctx, emitter)
    }

    fn output(handler: &JoinOperatorHandler, buffers: &[TupleBuffer]) -> Vec<Vec<Value>> {
        let layout = handler.definition().output_layout().clone();
        buffers
            .iter()
            .flat_map(|b| {
                let view = RecordBuffer::new(b, layout.as_ref());
                (0..view.number_of_records())
                    .map(|i| view.read_record(i).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_strategy_selection() {
        let f = Expression::field;
        let cases = [
            (f(0).eq(f(3)), JoinStrategy::HashJoin),
            (f(0).eq(f(3)).and(f(1).lt(f(4))), JoinStrategy::HashJoin),
            (f(0).eq(f(3)).or(f(1).ge(f(4))), JoinStrategy::HashJoin),
            (f(1).le(f(4)), JoinStrategy::HashJoin),
            (f(0).ne(f(3)), JoinStrategy::NestedLoopJoin),
            (f(0).eq(f(3)).and(f(1).eq(Expression::constant(Value::Int64(2)))), JoinStrategy::NestedLoopJoin),
            (f(0).add(f(1)).eq(f(3)), JoinStrategy::NestedLoopJoin),
        ];
        for (predicate, expected) in cases {
            assert_eq!(JoinStrategy::select(&predicate), expected, "{predicate}");
        }
    }

    #[test]
    fn test_equi_keys_respect_types() {
        // UInt32 = Int64 hashes, Float64 = Int64 does not
        let handler = JoinOperatorHandler::new(
            definition(speeding(), SliceAssigner::tumbling(10).unwrap()),
            1,
        );
        assert_eq!(handler.strategy(), JoinStrategy::HashJoin);
        assert_eq!(handler.equi_keys, vec![(1, 1)]);

        let mixed = JoinOperatorHandler::new(
            definition(Expression::field(2).eq(Expression::field(4)), SliceAssigner::tumbling(10).unwrap()),
            1,
        );
        assert!(mixed.equi_keys.is_empty());
    }

    #[test]
    fn test_invalid_predicate_rejected() {
        let err = JoinDefinition::new(
            left_schema(),
            right_schema(),
            "ts",
            "ts",
            Expression::field(6).eq(Expression::field(0)),
            SliceAssigner::tumbling(10).unwrap(),
            &[OriginId(1)],
            &[OriginId(2)],
        )
        .unwrap_err();
        assert!(matches!(err, WindowError::InvalidDefinition(_)));
    }

    #[test]
    fn test_tumbling_hash_join() {
        let manager = BufferManager::new(256, 64, 1 << 20);
        let (ctx, emitter) = context(&manager);
        let handler = JoinOperatorHandler::new(
            definition(speeding(), SliceAssigner::tumbling(10).unwrap()),
            2,
        );
        handler
            .build_records(
                JoinSide::Left,
                WorkerThreadId(0),
                &[left(1, 7, 80.0), left(2, 8, 40.0), left(12, 7, 90.0)],
                &manager,
            )
            .unwrap();
        handler
            .build_records(
                JoinSide::Right,
                WorkerThreadId(1),
                &[right(5, 7, 50.0), right(6, 8, 50.0), right(15, 7, 100.0)],
                &manager,
            )
            .unwrap();

        handler
            .trigger(Timestamp(20), SequenceData::single(1), OriginId(1), &ctx, WorkerThreadId(0))
            .unwrap();
        assert!(emitter.take().is_empty());
        handler
            .trigger(Timestamp(20), SequenceData::single(1), OriginId(2), &ctx, WorkerThreadId(0))
            .unwrap();

        // [10, 20) has a key match that fails the speed check
        let buffers = emitter.take();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].sequence_data(), SequenceData::new(1, 1, true));
        assert_eq!(buffers[0].origin_id(), OriginId(9));
        let mut expected = vec![Value::UInt64(0), Value::UInt64(10)];
        expected.extend(left(1, 7, 80.0));
        expected.extend(right(5, 7, 50.0));
        assert_eq!(output(&handler, &buffers), vec![expected]);
    }

    fn join_rows(
        predicate: Expression,
        lefts: &[Vec<Value>],
        rights: &[Vec<Value>],
    ) -> (JoinStrategy, Vec<Vec<Value>>) {
        let manager = BufferManager::new(256, 512, 1 << 20);
        let handler = JoinOperatorHandler::new(
            definition(predicate, SliceAssigner::sliding(10, 5).unwrap()),
            1,
        );
        handler
            .build_records(JoinSide::Left, WorkerThreadId(0), lefts, &manager)
            .unwrap();
        handler
            .build_records(JoinSide::Right, WorkerThreadId(0), rights, &manager)
            .unwrap();
        let (ctx, emitter) = context(&manager);
        for origin in [OriginId(1), OriginId(2)] {
            handler
                .trigger(Timestamp(20), SequenceData::single(1), origin, &ctx, WorkerThreadId(0))
                .unwrap();
        }
        let mut rows = output(&handler, &emitter.take());
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        (handler.strategy(), rows)
    }

    #[test]
    fn test_hash_and_nested_loop_agree() {
        let lefts: Vec<_> = (0..30u64)
            .map(|i| left(i % 20, (i % 4) as u32, (i * 7 % 11) as f64))
            .collect();
        let rights: Vec<_> = (0..30u64)
            .map(|i| right((i * 3) % 20, (i % 5) as i64, (i % 6) as f64))
            .collect();
        let hashed = join_rows(speeding(), &lefts, &rights);
        // same predicate the hash join cannot handle
        let nested = join_rows(
            speeding().and(Expression::field(0).ne(Expression::field(2).add(Expression::field(0)))),
            &lefts,
            &rights,
        );
        assert_eq!(hashed.0, JoinStrategy::HashJoin);
        assert_eq!(nested.0, JoinStrategy::NestedLoopJoin);
        assert!(!hashed.1.is_empty());
        assert_eq!(hashed.1, nested.1);
    }

    #[test]
    fn test_float_keys_match_like_predicate() {
        let speeds = [0.0, -0.0, 1.5, f64::NAN];
        let lefts: Vec<_> = (0..8u64).map(|i| left(i, 1, speeds[i as usize % 4])).collect();
        let rights: Vec<_> = (0..8u64).map(|i| right(i, 1, -speeds[i as usize % 4])).collect();
        let equal_speed = Expression::field(2).eq(Expression::field(5));

        let hashed = join_rows(equal_speed.clone(), &lefts, &rights);
        let nested = join_rows(
            equal_speed.and(Expression::field(0).add(Expression::field(3)).ge(Expression::field(0))),
            &lefts,
            &rights,
        );
        assert_eq!(hashed.0, JoinStrategy::HashJoin);
        assert_eq!(nested.0, JoinStrategy::NestedLoopJoin);
        // in each window both zeros of one side meet both zeros of the other
        let zero_pairs = hashed
            .1
            .iter()
            .filter(|row| row[4].as_f64() == Some(0.0))
            .count();
        assert!(zero_pairs > 0);
        assert!(hashed.1.iter().all(|row| !row[4].as_f64().is_some_and(f64::is_nan)));
        assert_eq!(hashed.1, nested.1);
    }

    #[test]
    fn test_slower_origin_holds_back_windows() {
        let manager = BufferManager::new(256, 64, 1 << 20);
        let (ctx, emitter) = context(&manager);
        let handler = JoinOperatorHandler::new(
            definition(speeding(), SliceAssigner::tumbling(10).unwrap()),
            1,
        );
        for ts in (0..100).step_by(10) {
            handler
                .build_records(JoinSide::Left, WorkerThreadId(0), &[left(ts, 1, 10.0)], &manager)
                .unwrap();
            handler
                .build_records(JoinSide::Right, WorkerThreadId(0), &[right(ts, 1, 5.0)], &manager)
                .unwrap();
        }
        handler
            .trigger(Timestamp(100), SequenceData::single(1), OriginId(1), &ctx, WorkerThreadId(0))
            .unwrap();
        handler
            .trigger(Timestamp(40), SequenceData::single(1), OriginId(2), &ctx, WorkerThreadId(0))
            .unwrap();
        let ends: Vec<_> = output(&handler, &emitter.take())
            .into_iter()
            .map(|r| r[1].clone())
            .collect();
        assert_eq!(ends, [10, 20, 30, 40].map(Value::UInt64).to_vec());
    }

    #[test]
    fn test_second_stop_is_final() {
        let manager = BufferManager::new(256, 64, 1 << 20);
        let (ctx, emitter) = context(&manager);
        let handler = JoinOperatorHandler::new(
            definition(speeding(), SliceAssigner::tumbling(10).unwrap()),
            1,
        );
        handler
            .build_records(JoinSide::Left, WorkerThreadId(0), &[left(3, 1, 10.0)], &manager)
            .unwrap();
        handler
            .as_stoppable()
            .unwrap()
            .stop(QueryTerminationType::Graceful, &ctx)
            .unwrap();
        assert!(emitter.take().is_empty());

        handler
            .build_records(JoinSide::Right, WorkerThreadId(0), &[right(4, 1, 5.0)], &manager)
            .unwrap();
        handler
            .as_stoppable()
            .unwrap()
            .stop(QueryTerminationType::Graceful, &ctx)
            .unwrap();
        assert_eq!(output(&handler, &emitter.take()).len(), 1);
        assert_eq!(handler.manager().number_of_global_slices(), 0);
    }

    #[test]
    fn test_late_join_records_counted() {
        let manager = BufferManager::new(256, 64, 1 << 20);
        let (ctx, _emitter) = context(&manager);
        let handler = JoinOperatorHandler::new(
            definition(speeding(), SliceAssigner::tumbling(10).unwrap()),
            1,
        );
        handler
            .build_records(JoinSide::Left, WorkerThreadId(0), &[left(3, 1, 10.0)], &manager)
            .unwrap();
        for origin in [OriginId(1), OriginId(2)] {
            handler
                .trigger(Timestamp(10), SequenceData::single(1), origin, &ctx, WorkerThreadId(0))
                .unwrap();
        }
        let accepted = handler
            .build_records(JoinSide::Right, WorkerThreadId(0), &[right(4, 1, 5.0)], &manager)
            .unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(handler.manager().late_records().dropped(), 1);
    }
}
