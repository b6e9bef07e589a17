//! End-to-end runs of sources, pipelines and sinks on a worker node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use slipstream_core::engine::{CollectingSink, MemorySource, PipelineDescriptor, Successor};
use slipstream_core::expression::Expression;
use slipstream_core::identifiers::{OriginId, PipelineId};
use slipstream_core::layout::{DataType, LayoutRef, RowLayout, Schema, Value};
use slipstream_core::memory::BufferProvider;
use slipstream_core::pipeline::{
    InterpretedPipelineStage, PhysicalOperator, PipelineStatus, QueryTerminationType,
};
use slipstream_core::window::{
    AggregateFunction, AggregationDefinition, AggregationOperatorHandler, JoinDefinition,
    JoinOperatorHandler, JoinSide, SliceAssigner,
};
use slipstream_core::{EngineConfig, WorkerNode};

const BUFFER_SIZE: usize = 1024;
const TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> EngineConfig {
    EngineConfig::builder()
        .buffer_size(BUFFER_SIZE)
        .number_of_buffers(64)
        .buffers_per_source(8)
        .worker_threads(3)
        .max_unpooled_bytes(4 << 20)
        .build()
        .unwrap()
}

fn readings() -> Schema {
    Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("sensor", DataType::UInt32)
        .with_field("value", DataType::Int64)
}

fn layout(schema: Schema) -> LayoutRef {
    Arc::new(RowLayout::new(schema, BUFFER_SIZE).unwrap())
}

#[test]
fn test_windowed_aggregation_end_to_end() {
    let node = WorkerNode::new(config()).unwrap();
    let definition = AggregationDefinition::builder(readings())
        .time_field("ts")
        .key("sensor")
        .aggregate(AggregateFunction::Sum, "value", "sum")
        .count("cnt")
        .window(SliceAssigner::tumbling(10).unwrap())
        .origins(&[OriginId(1)])
        .output_origin(OriginId(50))
        .buffer_size(BUFFER_SIZE)
        .build()
        .unwrap();
    let sink = Arc::new(CollectingSink::new("per-sensor", definition.output_layout().clone()));
    let handler = Arc::new(AggregationOperatorHandler::new(definition, 3));

    let input = layout(readings());
    let stage = InterpretedPipelineStage::new(
        "per-sensor-sum",
        vec![
            PhysicalOperator::Scan { layout: input.clone() },
            PhysicalOperator::AggregationBuild { handler: 0 },
        ],
    )
    .unwrap();
    node.register_pipeline(
        PipelineDescriptor::new(PipelineId(1), Box::new(stage))
            .with_handler(handler.clone())
            .with_successor(Successor::Sink(sink.clone())),
    )
    .unwrap();

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let records: Vec<Vec<Value>> = (0..100u64)
        .map(|ts| vec![Value::UInt64(ts), Value::UInt32((ts % 3) as u32), Value::Int64(ts as i64)])
        .collect();
    let mut expected: BTreeMap<(u64, u32), (i64, u64)> = BTreeMap::new();
    for record in &records {
        let (Value::UInt64(ts), Value::UInt32(sensor), Value::Int64(value)) =
            (&record[0], &record[1], &record[2])
        else {
            unreachable!()
        };
        let entry = expected.entry((ts - ts % 10, *sensor)).or_default();
        entry.0 += value;
        entry.1 += 1;
    }

    let source = MemorySource::new(
        "readings",
        input,
        records,
        0,
        Arc::new(node.buffer_manager().clone()),
    )
    .with_records_per_buffer(7);
    node.add_source(OriginId(1), Box::new(source), PipelineId(1)).unwrap();
    node.start().unwrap();

    assert!(node.wait_for_termination(PipelineId(1), TIMEOUT).unwrap());
    assert_eq!(node.status(PipelineId(1)).unwrap(), PipelineStatus::Stopped);
    assert_eq!(sink.termination(), Some(QueryTerminationType::Graceful));

    let mut batches = sink.batches();
    batches.sort_by_key(|b| b.sequence.sequence_number);
    let sequences: Vec<u64> = batches.iter().map(|b| b.sequence.sequence_number).collect();
    assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
    assert!(batches.iter().all(|b| b.origin == OriginId(50) && b.sequence.last_chunk));

    let mut actual = BTreeMap::new();
    for row in sink.records() {
        let (Value::UInt64(start), Value::UInt32(sensor), Value::Int64(sum), Value::UInt64(cnt)) =
            (&row[0], &row[2], &row[3], &row[4])
        else {
            panic!("unexpected row {row:?}");
        };
        assert_eq!(row[1], Value::UInt64(start + 10));
        assert!(actual.insert((*start, *sensor), (*sum, *cnt)).is_none());
    }
    assert_eq!(actual, expected);
    assert_eq!(handler.manager().late_records().dropped(), 0);

    node.shutdown();
    assert_eq!(node.buffer_manager().available_buffers(), 64);
}

#[test]
fn test_window_join_of_two_sources() {
    let node = WorkerNode::new(config()).unwrap();
    let left = Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("id", DataType::UInt32);
    let right = Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("id", DataType::UInt32);
    let definition = JoinDefinition::with_buffer_size(
        left.clone(),
        right.clone(),
        "ts",
        "ts",
        Expression::field(1).eq(Expression::field(3)),
        SliceAssigner::tumbling(10).unwrap(),
        &[OriginId(1)],
        &[OriginId(2)],
        BUFFER_SIZE,
    )
    .unwrap()
    .with_output_origin(OriginId(70));
    let sink = Arc::new(CollectingSink::new("joined", definition.output_layout().clone()));
    let handler = Arc::new(JoinOperatorHandler::new(definition, 3));

    let sides = [
        (PipelineId(2), OriginId(1), JoinSide::Left, layout(left)),
        (PipelineId(3), OriginId(2), JoinSide::Right, layout(right)),
    ];
    for (id, _, side, input) in &sides {
        let stage = InterpretedPipelineStage::new(
            format!("join-{side:?}"),
            vec![
                PhysicalOperator::Scan { layout: input.clone() },
                PhysicalOperator::JoinBuild { handler: 0, side: *side },
            ],
        )
        .unwrap();
        node.register_pipeline(
            PipelineDescriptor::new(*id, Box::new(stage))
                .with_handler(handler.clone())
                .with_successor(Successor::Sink(sink.clone())),
        )
        .unwrap();
    }

    #[allow(clippy::cast_possible_truncation)]
    let lefts: Vec<(u64, u32)> = (0..60u64).map(|ts| (ts, (ts % 3) as u32)).collect();
    #[allow(clippy::cast_possible_truncation)]
    let rights: Vec<(u64, u32)> = (0..60u64).step_by(2).map(|ts| (ts, (ts % 4) as u32)).collect();
    let expected = lefts
        .iter()
        .flat_map(|l| rights.iter().map(move |r| (l, r)))
        .filter(|(l, r)| l.0 / 10 == r.0 / 10 && l.1 == r.1)
        .count();

    for ((id, origin, _, input), rows) in sides.iter().zip([&lefts, &rights]) {
        let records = rows
            .iter()
            .map(|(ts, key)| vec![Value::UInt64(*ts), Value::UInt32(*key)])
            .collect();
        let source = MemorySource::new(
            format!("side-{origin}"),
            input.clone(),
            records,
            0,
            Arc::new(node.buffer_manager().clone()),
        )
        .with_records_per_buffer(5);
        node.add_source(*origin, Box::new(source), *id).unwrap();
    }
    node.start().unwrap();

    for (id, ..) in &sides {
        assert!(node.wait_for_termination(*id, TIMEOUT).unwrap());
    }
    assert_eq!(sink.termination(), Some(QueryTerminationType::Graceful));

    let records = sink.records();
    assert_eq!(records.len(), expected);
    for row in &records {
        let (Value::UInt64(start), Value::UInt64(end)) = (&row[0], &row[1]) else {
            panic!("unexpected row {row:?}");
        };
        assert_eq!(end - start, 10);
        assert_eq!(row[3], row[5]);
        for ts in [&row[2], &row[4]] {
            let ts = ts.as_u64().unwrap();
            assert!((*start..*end).contains(&ts));
        }
    }
    let mut sequences: Vec<u64> = sink.batches().iter().map(|b| b.sequence.sequence_number).collect();
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
    assert_eq!(handler.manager().number_of_global_slices(), 0);
}

#[test]
fn test_failed_pipeline_reports_failure() {
    let node = WorkerNode::new(config()).unwrap();
    let definition = AggregationDefinition::builder(readings())
        .time_field("ts")
        .aggregate(AggregateFunction::Sum, "value", "sum")
        .window(SliceAssigner::tumbling(10).unwrap())
        // origin 1 is not an input of this aggregation
        .origins(&[OriginId(9)])
        .buffer_size(BUFFER_SIZE)
        .build()
        .unwrap();
    let sink = Arc::new(CollectingSink::new("sums", definition.output_layout().clone()));
    let input = layout(readings());
    let stage = InterpretedPipelineStage::new(
        "sum",
        vec![
            PhysicalOperator::Scan { layout: input.clone() },
            PhysicalOperator::AggregationBuild { handler: 0 },
        ],
    )
    .unwrap();
    node.register_pipeline(
        PipelineDescriptor::new(PipelineId(1), Box::new(stage))
            .with_handler(Arc::new(AggregationOperatorHandler::new(definition, 3)))
            .with_successor(Successor::Sink(sink.clone())),
    )
    .unwrap();
    let records = (0..10u64)
        .map(|ts| vec![Value::UInt64(ts), Value::UInt32(0), Value::Int64(1)])
        .collect();
    let source = MemorySource::new("readings", input, records, 0, Arc::new(node.buffer_manager().clone()));
    node.add_source(OriginId(1), Box::new(source), PipelineId(1)).unwrap();
    node.start().unwrap();

    assert!(node.wait_for_termination(PipelineId(1), TIMEOUT).unwrap());
    assert_eq!(node.status(PipelineId(1)).unwrap(), PipelineStatus::Failed);
    assert_eq!(sink.termination(), Some(QueryTerminationType::Failure));
    assert_eq!(sink.number_of_batches(), 0);
}
