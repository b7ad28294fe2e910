//! Benchmarks for batch size selection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use selfheal::extraction::{calculate_optimal_batch_size, BatchSizeBounds, BatchSizingInput, SourceType};

fn batch_sizing_benchmark(c: &mut Criterion) {
    let Ok(bounds) = BatchSizeBounds::new(100, 100_000) else {
        return;
    };
    let mut group = c.benchmark_group("calculate_optimal_batch_size");

    for source_type in [SourceType::Storage, SourceType::Relational, SourceType::Api, SourceType::Unknown] {
        let input = BatchSizingInput {
            source_type,
            estimated_total_records: Some(5_000_000),
            memory_limit_mb: Some(512.0),
            avg_record_size_bytes: Some(2048.0),
        };
        group.bench_with_input(BenchmarkId::from_parameter(source_type), &input, |b, input| {
            b.iter(|| calculate_optimal_batch_size(black_box(10_000), black_box(input), bounds));
        });
    }

    group.finish();
}

criterion_group!(benches, batch_sizing_benchmark);
criterion_main!(benches);
