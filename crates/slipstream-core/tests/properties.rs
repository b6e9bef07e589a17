//! Property-based tests for ordering, watermarks, layouts and window state.
//!
//! Covers: sequencer release order, watermark monotonicity, window
//! completeness on drain, record layout round-trips including text, and
//! operator state serialization.

use std::sync::Arc;

use proptest::prelude::*;
use slipstream_core::identifiers::{OriginId, PipelineId, WorkerThreadId};
use slipstream_core::layout::{
    ColumnLayout, DataType, LayoutRef, RecordBuffer, RowLayout, Schema, Value,
};
use slipstream_core::memory::{BufferManager, BufferProvider};
use slipstream_core::pipeline::{CollectingEmitter, PipelineExecutionContext, QueryTerminationType};
use slipstream_core::sequence::{SequenceData, Sequencer};
use slipstream_core::time::{MultiOriginWatermarkProcessor, Timestamp};
use slipstream_core::window::{
    AggregateFunction, AggregationDefinition, AggregationOperatorHandler, SliceAssigner,
};

fn readings() -> Schema {
    Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("sensor", DataType::UInt32)
        .with_field("value", DataType::Int64)
}

fn count_per_window(assigner: SliceAssigner) -> AggregationDefinition {
    AggregationDefinition::builder(readings())
        .time_field("ts")
        .key("sensor")
        .aggregate(AggregateFunction::Sum, "value", "sum")
        .count("cnt")
        .window(assigner)
        .origins(&[OriginId(1)])
        .output_origin(OriginId(2))
        .buffer_size(512)
        .build()
        .unwrap()
}

fn context(manager: &BufferManager) -> (PipelineExecutionContext, Arc<CollectingEmitter>) {
    let emitter = Arc::new(CollectingEmitter::new());
    let ctx = PipelineExecutionContext::new(
        PipelineId(1),
        1,
        Arc::new(manager.clone()),
        Vec::new(),
        emitter.clone(),
    );
    (ctx, emitter)
}

/// Strategy for a permutation of `1..=n` sequence numbers.
fn arb_permutation(max: u64) -> impl Strategy<Value = Vec<u64>> {
    (1..=max).prop_flat_map(|n| Just((1..=n).collect::<Vec<_>>()).prop_shuffle())
}

/// Strategy for sensor readings with timestamps below 200.
fn arb_readings() -> impl Strategy<Value = Vec<Vec<Value>>> {
    prop::collection::vec((0u64..200, 0u32..4, -1000i64..1000), 1..60).prop_map(|rows| {
        rows.into_iter()
            .map(|(ts, sensor, value)| vec![Value::UInt64(ts), Value::UInt32(sensor), Value::Int64(value)])
            .collect()
    })
}

/// Strategy for records of the mixed schema used by the layout tests.
fn arb_mixed_record() -> impl Strategy<Value = Vec<Value>> {
    (
        any::<u64>(),
        any::<i32>(),
        "[a-zA-Z0-9 ]{0,40}",
        any::<f64>().prop_filter("must be finite", |f| f.is_finite()),
        any::<bool>(),
    )
        .prop_map(|(id, delta, label, reading, flag)| {
            vec![
                Value::UInt64(id),
                Value::Int32(delta),
                Value::Text(label),
                Value::Float64(reading),
                Value::Bool(flag),
            ]
        })
}

fn mixed_schema() -> Schema {
    Schema::default()
        .with_field("id", DataType::UInt64)
        .with_field("delta", DataType::Int32)
        .with_field("label", DataType::Text)
        .with_field("reading", DataType::Float64)
        .with_field("flag", DataType::Bool)
}

proptest! {
    /// Items leave the sequencer in sequence order whatever order they arrive in.
    #[test]
    fn sequencer_releases_in_order(arrival in arb_permutation(40)) {
        let sequencer = Sequencer::new();
        let mut released = Vec::new();
        for seq in arrival.iter().copied() {
            let mut next = sequencer.is_next(SequenceData::single(seq), seq);
            while let Some(item) = next {
                released.push(item);
                next = sequencer
                    .advance_and_get_next(SequenceData::single(item))
                    .unwrap();
            }
        }
        let expected: Vec<u64> = (1..=arrival.len() as u64).collect();
        prop_assert_eq!(released, expected);
        prop_assert_eq!(sequencer.pending(), 0);
    }

    /// The combined watermark never decreases and ends at the minimum of the
    /// per-origin maxima once every sequence number arrived.
    #[test]
    fn watermark_is_monotonic(
        updates in prop::collection::vec((0u64..2, 0u64..10_000), 1..40),
    ) {
        let origins = [OriginId(1), OriginId(2)];
        let processor = MultiOriginWatermarkProcessor::new(&origins);
        let mut next_sequence = [0u64; 2];
        let mut assigned = Vec::with_capacity(updates.len());
        for (origin, watermark) in &updates {
            let index = usize::try_from(*origin).unwrap();
            next_sequence[index] += 1;
            assigned.push((origins[index], next_sequence[index], Timestamp(*watermark)));
        }
        // deliver in reverse assignment order to force reordering
        let mut previous = Timestamp::MIN;
        for (origin, sequence, watermark) in assigned.iter().rev() {
            let current = processor
                .update_watermark(*watermark, SequenceData::single(*sequence), *origin)
                .unwrap();
            prop_assert!(current >= previous);
            previous = current;
        }
        let expected = origins
            .iter()
            .map(|o| {
                assigned
                    .iter()
                    .filter(|(origin, ..)| origin == o)
                    .map(|(.., w)| *w)
                    .max()
                    .unwrap_or(Timestamp::MIN)
            })
            .min()
            .unwrap_or(Timestamp::MIN);
        prop_assert_eq!(processor.current_watermark(), expected);
    }

    /// Draining emits every record once per window containing it.
    #[test]
    fn drain_covers_every_record(
        records in arb_readings(),
        slide in 1u64..6,
        factor in 1u64..4,
        workers in 1usize..4,
    ) {
        let manager = BufferManager::new(512, 512, 0);
        let (ctx, emitter) = context(&manager);
        let assigner = SliceAssigner::sliding(slide * factor, slide).unwrap();
        let definition = count_per_window(assigner);
        let handler = AggregationOperatorHandler::new(definition.clone(), workers);
        for (i, record) in records.iter().enumerate() {
            handler
                .build_records(WorkerThreadId(i % workers), std::slice::from_ref(record))
                .unwrap();
        }
        handler
            .drain(QueryTerminationType::Graceful, &ctx, WorkerThreadId(0))
            .unwrap();

        let layout = definition.output_layout();
        let mut counted = 0u64;
        for buffer in emitter.take() {
            let view = RecordBuffer::new(&buffer, layout.as_ref());
            for i in 0..view.number_of_records() {
                counted += view.read_value(i, 4).unwrap().as_u64().unwrap();
            }
        }
        let expected: usize = records
            .iter()
            .map(|r| assigner.windows_containing(r[0].as_u64().unwrap()).len())
            .sum();
        prop_assert_eq!(counted, expected as u64);
        prop_assert_eq!(handler.manager().number_of_global_slices(), 0);
    }

    /// Records read back unchanged through row and column layouts.
    #[test]
    fn layouts_round_trip(records in prop::collection::vec(arb_mixed_record(), 0..12), columnar in any::<bool>()) {
        // short text lives in pooled child buffers
        let manager = BufferManager::new(512, 32, 1 << 20);
        let layout: LayoutRef = if columnar {
            Arc::new(ColumnLayout::new(mixed_schema(), 512).unwrap())
        } else {
            Arc::new(RowLayout::new(mixed_schema(), 512).unwrap())
        };
        let buffer = manager.get_buffer_blocking();
        let view = RecordBuffer::new(&buffer, layout.as_ref());
        for record in &records {
            view.push_record(record, &manager).unwrap();
        }
        prop_assert_eq!(view.number_of_records(), records.len());
        for (i, record) in records.iter().enumerate() {
            prop_assert_eq!(&view.read_record(i).unwrap(), record);
        }
        drop(buffer);
        prop_assert_eq!(manager.available_buffers(), 32);
    }

    /// Operator state survives serialization into buffers.
    #[test]
    fn aggregation_state_round_trip(records in arb_readings(), watermark in 0u64..200) {
        let manager = BufferManager::new(512, 512, 0);
        let (ctx, _emitter) = context(&manager);
        let definition = count_per_window(SliceAssigner::sliding(20, 10).unwrap());
        let handler = AggregationOperatorHandler::new(definition.clone(), 2);
        for (i, record) in records.iter().enumerate() {
            handler
                .build_records(WorkerThreadId(i % 2), std::slice::from_ref(record))
                .unwrap();
        }
        handler
            .trigger(Timestamp(watermark), SequenceData::single(1), OriginId(1), &ctx, WorkerThreadId(0))
            .unwrap();

        let buffer = handler.serialize(&manager).unwrap();
        let restored = AggregationOperatorHandler::deserialize(&buffer, definition, 2).unwrap();
        prop_assert_eq!(restored.snapshot().unwrap(), handler.snapshot().unwrap());
        prop_assert_eq!(
            restored.manager().next_output_sequence(),
            handler.manager().next_output_sequence()
        );
    }

    /// Watermark progress, including out-of-order pending entries, survives
    /// serialization.
    #[test]
    fn watermark_state_round_trip(arrival in arb_permutation(20), skip in 0usize..20) {
        let manager = BufferManager::new(256, 64, 0);
        let origins = [OriginId(1), OriginId(2)];
        let processor = MultiOriginWatermarkProcessor::new(&origins);
        for (i, seq) in arrival.iter().enumerate() {
            if i == skip {
                continue;
            }
            let origin = origins[i % 2];
            processor
                .update_watermark(Timestamp(seq * 10), SequenceData::single(*seq), origin)
                .unwrap();
        }
        let buffer = processor.serialize_watermarks(&manager).unwrap();
        let restored = MultiOriginWatermarkProcessor::new(&origins);
        restored.restore_watermarks(&buffer).unwrap();
        prop_assert_eq!(restored.snapshot(), processor.snapshot());
        prop_assert_eq!(restored.current_watermark(), processor.current_watermark());
    }
}
