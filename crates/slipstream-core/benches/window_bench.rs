//! Window operator benchmarks
//!
//! Run with: cargo bench --bench window_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slipstream_core::identifiers::{OriginId, PipelineId, WorkerThreadId};
use slipstream_core::layout::{DataType, Schema, Value};
use slipstream_core::memory::BufferManager;
use slipstream_core::pipeline::{CollectingEmitter, PipelineExecutionContext};
use slipstream_core::sequence::SequenceData;
use slipstream_core::time::{MultiOriginWatermarkProcessor, Timestamp};
use slipstream_core::window::{
    AggregateFunction, AggregationDefinition, AggregationOperatorHandler, SliceAssigner,
};

fn definition(assigner: SliceAssigner) -> AggregationDefinition {
    let schema = Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("sensor", DataType::UInt32)
        .with_field("value", DataType::Int64);
    AggregationDefinition::builder(schema)
        .time_field("ts")
        .key("sensor")
        .aggregate(AggregateFunction::Sum, "value", "sum")
        .aggregate(AggregateFunction::Max, "value", "max")
        .count("cnt")
        .window(assigner)
        .origins(&[OriginId(1)])
        .output_origin(OriginId(2))
        .build()
        .unwrap()
}

fn records(count: u64, start: u64) -> Vec<Vec<Value>> {
    (start..start + count)
        .map(|ts| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let record = vec![Value::UInt64(ts), Value::UInt32((ts % 16) as u32), Value::Int64(ts as i64)];
            record
        })
        .collect()
}

/// Benchmark slice assignment
fn bench_slice_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_assign");

    for (name, assigner) in [
        ("tumbling", SliceAssigner::tumbling(1000).unwrap()),
        ("sliding", SliceAssigner::sliding(1000, 250).unwrap()),
    ] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("slice_for", name), &assigner, |b, assigner| {
            let mut ts = 0u64;
            b.iter(|| {
                let slice = assigner.slice_for(black_box(ts));
                ts += 7;
                black_box(slice)
            })
        });
        group.bench_with_input(BenchmarkId::new("windows_containing", name), &assigner, |b, assigner| {
            let mut ts = 0u64;
            b.iter(|| {
                let windows = assigner.windows_containing(black_box(ts));
                ts += 7;
                black_box(windows.len())
            })
        });
    }

    group.finish();
}

/// Benchmark building records into thread-local slices
fn bench_aggregation_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation_build");

    for batch in [64u64, 1024] {
        let handler = AggregationOperatorHandler::new(definition(SliceAssigner::tumbling(1000).unwrap()), 1);
        let batch_records = records(batch, 0);

        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::new("tumbling", batch), &batch_records, |b, rows| {
            b.iter(|| {
                let accepted = handler.build_records(WorkerThreadId(0), black_box(rows)).unwrap();
                black_box(accepted)
            })
        });
    }

    group.finish();
}

/// Benchmark build + trigger + emit of complete windows
fn bench_aggregation_trigger(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation_trigger");
    let manager = BufferManager::new(4096, 256, 0);

    for (name, assigner) in [
        ("tumbling", SliceAssigner::tumbling(100).unwrap()),
        ("sliding", SliceAssigner::sliding(100, 25).unwrap()),
    ] {
        group.throughput(Throughput::Elements(1000));
        group.bench_function(name, |b| {
            b.iter(|| {
                let emitter = Arc::new(CollectingEmitter::new());
                let ctx = PipelineExecutionContext::new(
                    PipelineId(1),
                    1,
                    Arc::new(manager.clone()),
                    Vec::new(),
                    emitter.clone(),
                );
                let handler = AggregationOperatorHandler::new(definition(assigner), 1);
                for (i, start) in (0..1000u64).step_by(100).enumerate() {
                    handler.build_records(WorkerThreadId(0), &records(100, start)).unwrap();
                    handler
                        .trigger(
                            Timestamp(start + 100),
                            SequenceData::single(i as u64 + 1),
                            OriginId(1),
                            &ctx,
                            WorkerThreadId(0),
                        )
                        .unwrap();
                    // release result buffers every round
                    black_box(emitter.take().len());
                }
            })
        });
    }

    group.finish();
}

/// Benchmark combined watermark updates across origins
fn bench_watermark_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("watermark_update");

    for origins in [1u64, 4, 16] {
        let ids: Vec<OriginId> = (1..=origins).map(OriginId).collect();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("in_order", origins), &ids, |b, ids| {
            let processor = MultiOriginWatermarkProcessor::new(ids);
            let mut sequence = 0u64;
            b.iter(|| {
                let width = ids.len() as u64;
                #[allow(clippy::cast_possible_truncation)]
                let origin = ids[(sequence % width) as usize];
                let round = sequence / width + 1;
                sequence += 1;
                let current = processor
                    .update_watermark(Timestamp(round * 10), SequenceData::single(round), origin)
                    .unwrap();
                black_box(current)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_slice_assign,
    bench_aggregation_build,
    bench_aggregation_trigger,
    bench_watermark_update
);
criterion_main!(benches);
