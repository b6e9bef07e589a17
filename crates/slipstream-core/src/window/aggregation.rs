//! Keyed and global window aggregation.

use std::sync::Arc;

use fxhash::FxHashMap;
use tracing::{debug, info};

use super::{
    emit_window_records, ManagerSnapshot, SliceAssigner, SliceState, TriggeredWindow, WindowError,
    WindowSliceManager, WindowingStrategy,
};
use crate::identifiers::{OriginId, WorkerThreadId};
use crate::layout::{
    DataType, KeyBytes, LayoutError, LayoutRef, MemoryLayout, RecordBuffer, RowLayout, Schema,
    Value,
};
use crate::memory::{BufferProvider, TupleBuffer};
use crate::pipeline::{
    ExecutionError, OperatorHandler, PipelineExecutionContext,
    QueryTerminationType, Reconfigurable, ReconfigurationMessage, Startable, Stoppable,
};
use crate::sequence::SequenceData;
use crate::state::{self, StateError};
use crate::time::Timestamp;

/// Default output buffer size of aggregation results.
const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 4096;

/// Aggregation functions over numeric fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// Number of records.
    Count,
    /// Sum of values.
    Sum,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Arithmetic mean.
    Avg,
}

impl AggregateFunction {
    /// Result type for an input of type `input` (`None` for `COUNT(*)`).
    #[must_use]
    pub fn output_type(self, input: Option<DataType>) -> DataType {
        match (self, input) {
            (Self::Count, _) => DataType::UInt64,
            (Self::Sum, Some(t)) if !t.is_float() => DataType::Int64,
            (Self::Min | Self::Max, Some(t)) => t,
            _ => DataType::Float64,
        }
    }

    fn initial_state(self, input: Option<DataType>) -> AggregateState {
        match self {
            Self::Count => AggregateState::Count(0),
            Self::Sum if input.is_some_and(DataType::is_float) => AggregateState::FloatSum(0.0),
            Self::Sum => AggregateState::IntSum(0),
            Self::Min => AggregateState::Min(None),
            Self::Max => AggregateState::Max(None),
            Self::Avg => AggregateState::Avg { sum: 0.0, count: 0 },
        }
    }
}

/// Partial result of one aggregate.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum AggregateState {
    /// Record count.
    Count(u64),
    /// Integer sum. Saturates on overflow.
    IntSum(i64),
    /// Float sum.
    FloatSum(f64),
    /// Minimum so far.
    Min(Option<Value>),
    /// Maximum so far.
    Max(Option<Value>),
    /// Sum and count for the mean.
    Avg {
        /// Sum of values.
        sum: f64,
        /// Number of values.
        count: u64,
    },
}

impl AggregateState {
    /// Adds one input value (`None` for `COUNT(*)`).
    pub fn add(&mut self, value: Option<&Value>) {
        match self {
            Self::Count(count) => *count += 1,
            Self::IntSum(sum) => {
                if let Some(v) = value.and_then(Value::as_i128) {
                    let v = i64::try_from(v).unwrap_or(if v < 0 { i64::MIN } else { i64::MAX });
                    *sum = sum.saturating_add(v);
                }
            }
            Self::FloatSum(sum) => *sum += value.and_then(Value::as_f64).unwrap_or_default(),
            Self::Min(current) => replace_if(current, value, std::cmp::Ordering::Less),
            Self::Max(current) => replace_if(current, value, std::cmp::Ordering::Greater),
            Self::Avg { sum, count } => {
                if let Some(v) = value.and_then(Value::as_f64) {
                    *sum += v;
                    *count += 1;
                }
            }
        }
    }

    /// Folds another partial of the same aggregate into this one.
    pub fn merge(&mut self, other: &AggregateState) {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => *a += b,
            (Self::IntSum(a), Self::IntSum(b)) => *a = a.saturating_add(*b),
            (Self::FloatSum(a), Self::FloatSum(b)) => *a += b,
            (Self::Min(a), Self::Min(b)) => replace_if(a, b.as_ref(), std::cmp::Ordering::Less),
            (Self::Max(a), Self::Max(b)) => replace_if(a, b.as_ref(), std::cmp::Ordering::Greater),
            (
                Self::Avg { sum, count },
                Self::Avg {
                    sum: other_sum,
                    count: other_count,
                },
            ) => {
                *sum += other_sum;
                *count += other_count;
            }
            (this, other) => debug_assert!(false, "merging {this:?} with {other:?}"),
        }
    }

    /// Final value. Empty minimum and maximum yield zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn result(&self) -> Value {
        match self {
            Self::Count(count) => Value::UInt64(*count),
            Self::IntSum(sum) => Value::Int64(*sum),
            Self::FloatSum(sum) => Value::Float64(*sum),
            Self::Min(v) | Self::Max(v) => v.clone().unwrap_or(Value::Int64(0)),
            Self::Avg { count: 0, .. } => Value::Float64(0.0),
            Self::Avg { sum, count } => Value::Float64(sum / *count as f64),
        }
    }
}

fn replace_if(current: &mut Option<Value>, candidate: Option<&Value>, wanted: std::cmp::Ordering) {
    let Some(candidate) = candidate else {
        return;
    };
    let replace = match current {
        None => true,
        Some(existing) => candidate.compare(existing) == Some(wanted),
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

/// One aggregate of an aggregation definition.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    /// Function applied.
    pub function: AggregateFunction,
    /// Input field index; `None` counts records.
    pub input: Option<usize>,
    /// Output field name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct Group {
    keys: Vec<Value>,
    states: Vec<AggregateState>,
}

/// Partial aggregates of one slice, per grouping key.
///
/// A global aggregation uses the empty key, so it holds at most one group.
#[derive(Debug, Clone, Default)]
pub struct AggregationSlice {
    groups: FxHashMap<KeyBytes, Group>,
    records: u64,
}

impl AggregationSlice {
    /// Number of distinct keys.
    #[must_use]
    pub fn number_of_groups(&self) -> usize {
        self.groups.len()
    }

    /// Key values and aggregate results per group, ordered by encoded key.
    #[must_use]
    pub fn results(&self) -> Vec<(Vec<Value>, Vec<Value>)> {
        let mut groups: Vec<_> = self.groups.iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        groups
            .into_iter()
            .map(|(_, g)| (g.keys.clone(), g.states.iter().map(AggregateState::result).collect()))
            .collect()
    }

    fn update(&mut self, key: KeyBytes, record: &[Value], definition: &AggregationDefinition) {
        let group = self.groups.entry(key).or_insert_with(|| Group {
            keys: definition
                .keys
                .iter()
                .filter_map(|&k| record.get(k).cloned())
                .collect(),
            states: definition.initial_states(),
        });
        for (state, spec) in group.states.iter_mut().zip(&definition.aggregates) {
            state.add(spec.input.and_then(|f| record.get(f)));
        }
        self.records += 1;
    }

    fn merge_from(&mut self, other: &AggregationSlice) {
        for (key, group) in &other.groups {
            match self.groups.get_mut(key) {
                Some(existing) => {
                    for (state, partial) in existing.states.iter_mut().zip(&group.states) {
                        state.merge(partial);
                    }
                }
                None => {
                    self.groups.insert(key.clone(), group.clone());
                }
            }
        }
        self.records += other.records;
    }

    fn encode(&self) -> Result<Vec<u8>, StateError> {
        let mut groups: Vec<_> = self.groups.iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        state::encode(&SliceRecord {
            groups: groups.into_iter().map(|(_, g)| g.clone()).collect(),
            records: self.records,
        })
    }

    fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        let record: SliceRecord = state::decode(bytes)?;
        let groups = record
            .groups
            .into_iter()
            .map(|group| {
                let mut key = KeyBytes::new();
                for value in &group.keys {
                    value.encode_key(&mut key);
                }
                (key, group)
            })
            .collect();
        Ok(Self {
            groups,
            records: record.records,
        })
    }
}

impl SliceState for AggregationSlice {
    fn merge(&mut self, other: Self) {
        if self.groups.is_empty() {
            self.groups = other.groups;
            self.records += other.records;
        } else {
            self.merge_from(&other);
        }
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn number_of_records(&self) -> u64 {
        self.records
    }
}

#[derive(Debug, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
struct SliceRecord {
    groups: Vec<Group>,
    records: u64,
}

/// Validated description of a window aggregation.
#[derive(Debug, Clone)]
pub struct AggregationDefinition {
    input: Schema,
    time_field: usize,
    keys: Vec<usize>,
    aggregates: Vec<AggregateSpec>,
    assigner: SliceAssigner,
    origins: Vec<OriginId>,
    output_origin: OriginId,
    output_layout: LayoutRef,
}

impl AggregationDefinition {
    /// Starts a definition over records of `input`.
    #[must_use]
    pub fn builder(input: Schema) -> AggregationDefinitionBuilder {
        AggregationDefinitionBuilder {
            input,
            time_field: None,
            keys: Vec::new(),
            aggregates: Vec::new(),
            assigner: None,
            origins: Vec::new(),
            output_origin: OriginId::INVALID,
            buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
        }
    }

    /// Input schema.
    #[must_use]
    pub fn input_schema(&self) -> &Schema {
        &self.input
    }

    /// Index of the event-time field.
    #[must_use]
    pub fn time_field(&self) -> usize {
        self.time_field
    }

    /// Indices of the grouping fields. Empty for a global aggregation.
    #[must_use]
    pub fn key_fields(&self) -> &[usize] {
        &self.keys
    }

    /// Aggregates in output order.
    #[must_use]
    pub fn aggregates(&self) -> &[AggregateSpec] {
        &self.aggregates
    }

    /// Slice assigner.
    #[must_use]
    pub fn assigner(&self) -> SliceAssigner {
        self.assigner
    }

    /// Input origins.
    #[must_use]
    pub fn origins(&self) -> &[OriginId] {
        &self.origins
    }

    /// Origin stamped on emitted buffers.
    #[must_use]
    pub fn output_origin(&self) -> OriginId {
        self.output_origin
    }

    /// Layout of emitted buffers:
    /// `window_start, window_end, keys..., aggregates...`.
    #[must_use]
    pub fn output_layout(&self) -> &LayoutRef {
        &self.output_layout
    }

    fn initial_states(&self) -> Vec<AggregateState> {
        self.aggregates
            .iter()
            .map(|spec| {
                let input = spec
                    .input
                    .and_then(|f| self.input.field(f))
                    .map(|f| f.data_type);
                spec.function.initial_state(input)
            })
            .collect()
    }
}

/// Builder for [`AggregationDefinition`].
#[derive(Debug, Clone)]
pub struct AggregationDefinitionBuilder {
    input: Schema,
    time_field: Option<String>,
    keys: Vec<String>,
    aggregates: Vec<(AggregateFunction, Option<String>, String)>,
    assigner: Option<SliceAssigner>,
    origins: Vec<OriginId>,
    output_origin: OriginId,
    buffer_size: usize,
}

impl AggregationDefinitionBuilder {
    /// Field holding the event time in ms.
    #[must_use]
    pub fn time_field(mut self, name: impl Into<String>) -> Self {
        self.time_field = Some(name.into());
        self
    }

    /// Adds a grouping field.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>) -> Self {
        self.keys.push(name.into());
        self
    }

    /// Adds `function(field) AS output`.
    #[must_use]
    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        field: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.aggregates
            .push((function, Some(field.into()), output.into()));
        self
    }

    /// Adds `COUNT(*) AS output`.
    #[must_use]
    pub fn count(mut self, output: impl Into<String>) -> Self {
        self.aggregates
            .push((AggregateFunction::Count, None, output.into()));
        self
    }

    /// Window definition.
    #[must_use]
    pub fn window(mut self, assigner: SliceAssigner) -> Self {
        self.assigner = Some(assigner);
        self
    }

    /// Origins feeding the operator.
    #[must_use]
    pub fn origins(mut self, origins: &[OriginId]) -> Self {
        self.origins = origins.to_vec();
        self
    }

    /// Origin stamped on results.
    #[must_use]
    pub fn output_origin(mut self, origin: OriginId) -> Self {
        self.output_origin = origin;
        self
    }

    /// Size of result buffers.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Unknown fields, non-numeric aggregate or time fields, a missing window
    /// or origins, or a result record that does not fit one buffer.
    pub fn build(self) -> Result<AggregationDefinition, WindowError> {
        let time_name = self
            .time_field
            .ok_or_else(|| WindowError::InvalidDefinition("missing time field".into()))?;
        let time_field = self.input.require(&time_name)?;
        if !self.input.fields()[time_field].data_type.is_numeric()
            || self.input.fields()[time_field].data_type.is_float()
        {
            return Err(WindowError::InvalidTimestamp { field: time_field });
        }
        let assigner = self
            .assigner
            .ok_or_else(|| WindowError::InvalidDefinition("missing window".into()))?
            .with_strategy(WindowingStrategy::Slicing);
        if self.origins.is_empty() {
            return Err(WindowError::InvalidDefinition("no input origins".into()));
        }
        if self.aggregates.is_empty() {
            return Err(WindowError::InvalidDefinition("no aggregates".into()));
        }

        let mut output = Schema::default()
            .with_field("window_start", DataType::UInt64)
            .with_field("window_end", DataType::UInt64);
        let mut keys = Vec::with_capacity(self.keys.len());
        for name in &self.keys {
            let index = self.input.require(name)?;
            output = output.with_field(name.clone(), self.input.fields()[index].data_type);
            keys.push(index);
        }
        let mut aggregates = Vec::with_capacity(self.aggregates.len());
        for (function, field, name) in self.aggregates {
            let input = match field {
                Some(field) => {
                    let index = self.input.require(&field)?;
                    if !self.input.fields()[index].data_type.is_numeric() {
                        return Err(WindowError::NonNumericInput { field: index });
                    }
                    Some(index)
                }
                None => None,
            };
            let input_type = input.map(|i| self.input.fields()[i].data_type);
            output = output.with_field(name.clone(), function.output_type(input_type));
            aggregates.push(AggregateSpec {
                function,
                input,
                name,
            });
        }

        Ok(AggregationDefinition {
            input: self.input,
            time_field,
            keys,
            aggregates,
            assigner,
            origins: self.origins,
            output_origin: self.output_origin,
            output_layout: Arc::new(RowLayout::new(output, self.buffer_size)?),
        })
    }
}

/// Operator handler of a window aggregation.
///
/// Build pipelines call [`build`](Self::build) per input buffer and
/// [`trigger`](Self::trigger) with the buffer's watermark afterwards. Results
/// are emitted through the pipeline context, one sequence number per window,
/// split into chunks when they do not fit one buffer.
#[derive(Debug)]
pub struct AggregationOperatorHandler {
    definition: Arc<AggregationDefinition>,
    manager: WindowSliceManager<AggregationSlice>,
}

impl AggregationOperatorHandler {
    /// Creates a handler for `workers` build threads.
    #[must_use]
    pub fn new(definition: AggregationDefinition, workers: usize) -> Self {
        let manager = WindowSliceManager::new(definition.assigner, workers, &definition.origins);
        Self {
            definition: Arc::new(definition),
            manager,
        }
    }

    /// The aggregation definition.
    #[must_use]
    pub fn definition(&self) -> &AggregationDefinition {
        &self.definition
    }

    /// The slice manager.
    #[must_use]
    pub fn manager(&self) -> &WindowSliceManager<AggregationSlice> {
        &self.manager
    }

    /// Adds records to the worker's slices. Returns the number of records
    /// accepted; late records are counted and dropped.
    ///
    /// # Errors
    ///
    /// Records with missing fields, invalid timestamps or non-numeric
    /// aggregate inputs. No slice is modified in that case.
    pub fn build_records(
        &self,
        worker: WorkerThreadId,
        records: &[Vec<Value>],
    ) -> Result<usize, WindowError> {
        let definition = &*self.definition;
        let width = definition.input.len();
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            if record.len() != width {
                return Err(LayoutError::ArityMismatch {
                    expected: width,
                    actual: record.len(),
                }
                .into());
            }
            let ts = record[definition.time_field]
                .as_u64()
                .ok_or(WindowError::InvalidTimestamp {
                    field: definition.time_field,
                })?;
            for spec in &definition.aggregates {
                if let Some(field) = spec.input {
                    if !record[field].data_type().is_numeric() {
                        return Err(WindowError::NonNumericInput { field });
                    }
                }
            }
            let mut key = KeyBytes::new();
            for &field in &definition.keys {
                record[field].encode_key(&mut key);
            }
            prepared.push((definition.assigner.slice_for(ts), key));
        }

        let late = self.manager.with_local(worker, |store| {
            let mut late = 0u64;
            for (record, (range, key)) in records.iter().zip(prepared) {
                match store.find_or_create(range, AggregationSlice::default) {
                    Some(slice) => slice.update(key, record, definition),
                    None => late += 1,
                }
            }
            late
        });
        if late > 0 {
            self.manager.late_records().record_dropped(late);
            debug!(late, worker = %worker, "dropped late records");
        }
        Ok(records.len() - usize::try_from(late).unwrap_or(records.len()))
    }

    /// Adds every record of `buffer`, read through `layout`.
    ///
    /// # Errors
    ///
    /// Same as [`build_records`](Self::build_records), plus unreadable records.
    pub fn build(
        &self,
        worker: WorkerThreadId,
        buffer: &TupleBuffer,
        layout: &dyn MemoryLayout,
    ) -> Result<usize, WindowError> {
        let view = RecordBuffer::new(buffer, layout);
        let records = (0..view.number_of_records())
            .map(|i| view.read_record(i))
            .collect::<Result<Vec<_>, _>>()?;
        self.build_records(worker, &records)
    }

    /// Applies a watermark update and emits every completed window.
    ///
    /// # Errors
    ///
    /// Unknown origins and emission failures.
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
                self.emit_window(window, slices, ctx, worker)
            })
    }

    /// Emits every window ending at or before `until`.
    ///
    /// # Errors
    ///
    /// Emission failures.
    pub fn flush(
        &self,
        until: Timestamp,
        ctx: &PipelineExecutionContext,
        worker: WorkerThreadId,
    ) -> Result<usize, WindowError> {
        self.manager.flush_until(until, &mut |window, slices| {
            self.emit_window(window, slices, ctx, worker)
        })
    }

    /// Emits all remaining windows, or discards them on failure.
    ///
    /// # Errors
    ///
    /// Emission failures.
    pub fn drain(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
        worker: WorkerThreadId,
    ) -> Result<usize, WindowError> {
        self.manager
            .drain(termination, true, &mut |window, slices| {
                self.emit_window(window, slices, ctx, worker)
            })
    }

    fn emit_window(
        &self,
        window: &TriggeredWindow,
        slices: &[&AggregationSlice],
        ctx: &PipelineExecutionContext,
        worker: WorkerThreadId,
    ) -> Result<bool, WindowError> {
        let mut combined = AggregationSlice::default();
        for slice in slices {
            combined.merge_from(slice);
        }
        let rows = combined.results().into_iter().map(|(keys, values)| {
            let mut row = Vec::with_capacity(2 + keys.len() + values.len());
            row.push(Value::UInt64(window.info.window_start));
            row.push(Value::UInt64(window.info.window_end));
            row.extend(keys);
            row.extend(values);
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

    /// Captures the complete operator state for comparison or migration.
    ///
    /// # Errors
    ///
    /// Encoding failures.
    pub fn snapshot(&self) -> Result<ManagerSnapshot, WindowError> {
        Ok(self.manager.export(AggregationSlice::encode)?)
    }

    /// Writes the complete operator state into a buffer chain.
    ///
    /// # Errors
    ///
    /// Encoding or allocation failures.
    pub fn serialize(&self, provider: &dyn BufferProvider) -> Result<TupleBuffer, WindowError> {
        let snapshot = self.snapshot()?;
        Ok(state::encode_to_buffer(&snapshot, provider)?)
    }

    /// Rebuilds a handler from state written by [`serialize`](Self::serialize).
    ///
    /// # Errors
    ///
    /// Decoding failures or a snapshot taken for a different window.
    pub fn deserialize(
        buffer: &TupleBuffer,
        definition: AggregationDefinition,
        workers: usize,
    ) -> Result<Self, WindowError> {
        let snapshot: ManagerSnapshot = state::decode_from_buffer(buffer)?;
        let handler = Self::new(definition, workers);
        handler.manager.import(snapshot, AggregationSlice::decode)?;
        Ok(handler)
    }
}

impl OperatorHandler for AggregationOperatorHandler {
    fn name(&self) -> &'static str {
        "window-aggregation"
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

impl Startable for AggregationOperatorHandler {
    fn start(&self, ctx: &PipelineExecutionContext) -> Result<(), ExecutionError> {
        info!(
            pipeline = %ctx.pipeline_id(),
            size = self.definition.assigner.size(),
            slide = self.definition.assigner.slide(),
            keys = self.definition.keys.len(),
            "window aggregation started"
        );
        Ok(())
    }
}

impl Stoppable for AggregationOperatorHandler {
    fn stop(
        &self,
        termination: QueryTerminationType,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError> {
        let emitted = self.drain(termination, ctx, WorkerThreadId(0))?;
        debug!(pipeline = %ctx.pipeline_id(), ?termination, emitted, "window aggregation stopped");
        Ok(())
    }
}

impl Reconfigurable for AggregationOperatorHandler {
    fn reconfigure(
        &self,
        message: &ReconfigurationMessage,
        ctx: &PipelineExecutionContext,
    ) -> Result<(), ExecutionError> {
        match message {
            ReconfigurationMessage::FlushUntil(until) => {
                self.flush(*until, ctx, WorkerThreadId(0))?;
            }
            ReconfigurationMessage::Reset => {
                let dropped = self.manager.reset();
                info!(pipeline = %ctx.pipeline_id(), dropped, "window aggregation reset");
            }
        }
        Ok(())
    }
}
