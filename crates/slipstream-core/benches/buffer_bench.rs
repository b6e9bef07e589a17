//! Buffer pool and sequencer benchmarks
//!
//! Run with: cargo bench --bench buffer_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slipstream_core::layout::{DataType, MemoryLayout, RecordBuffer, RowLayout, Schema, Value};
use slipstream_core::memory::{BufferManager, BufferProvider};
use slipstream_core::sequence::{SequenceData, Sequencer};

/// Benchmark acquire + release of pooled buffers
fn bench_buffer_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_acquire");

    for size in [1024usize, 4096, 65_536] {
        let manager = BufferManager::new(size, 64, 0);
        let local = manager.create_local_buffer_pool(16).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("global", size), &manager, |b, manager| {
            b.iter(|| {
                let buffer = manager.get_buffer_blocking();
                black_box(buffer.capacity())
            })
        });
        group.bench_with_input(BenchmarkId::new("local", size), &local, |b, local| {
            b.iter(|| {
                let buffer = local.get_buffer_blocking();
                black_box(buffer.capacity())
            })
        });
    }

    group.finish();
}

/// Benchmark writing and reading records through a row layout
fn bench_record_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_access");

    let schema = Schema::default()
        .with_field("ts", DataType::UInt64)
        .with_field("sensor", DataType::UInt32)
        .with_field("value", DataType::Float64);
    let layout = RowLayout::new(schema, 4096).unwrap();
    let manager = BufferManager::new(4096, 4, 0);
    let capacity = layout.capacity();

    group.throughput(Throughput::Elements(capacity as u64));
    group.bench_function("fill_buffer", |b| {
        b.iter(|| {
            let buffer = manager.get_buffer_blocking();
            let view = RecordBuffer::new(&buffer, &layout);
            for i in 0..capacity as u64 {
                #[allow(clippy::cast_precision_loss)]
                let record = [Value::UInt64(i), Value::UInt32(7), Value::Float64(i as f64)];
                view.push_record(&record, &manager).unwrap();
            }
            black_box(view.number_of_records())
        })
    });

    let buffer = manager.get_buffer_blocking();
    let view = RecordBuffer::new(&buffer, &layout);
    for i in 0..capacity as u64 {
        view.push_record(&[Value::UInt64(i), Value::UInt32(7), Value::Float64(1.0)], &manager)
            .unwrap();
    }
    group.bench_function("scan_buffer", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for i in 0..view.number_of_records() {
                if let Ok(Value::UInt64(ts)) = view.read_value(i, 0) {
                    sum += ts;
                }
            }
            black_box(sum)
        })
    });

    group.finish();
}

/// Benchmark releasing a reversed run of sequence numbers
fn bench_sequencer(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer");

    for run in [16u64, 256, 4096] {
        group.throughput(Throughput::Elements(run));
        group.bench_with_input(BenchmarkId::new("reversed", run), &run, |b, &run| {
            b.iter(|| {
                let sequencer = Sequencer::new();
                let mut released = 0u64;
                for seq in (1..=run).rev() {
                    let mut next = sequencer.is_next(SequenceData::single(seq), seq);
                    while let Some(item) = next {
                        released += 1;
                        next = sequencer
                            .advance_and_get_next(SequenceData::single(item))
                            .unwrap();
                    }
                }
                black_box(released)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_buffer_acquire, bench_record_access, bench_sequencer);
criterion_main!(benches);
