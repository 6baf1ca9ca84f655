//! Benchmarks for queue loading and weighted sampling

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lora_train_core::load_training_records;
use lora_train_core::WeightedSampler;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;

fn bench_weighted_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_sampling");

    for size in [100usize, 1_000, 10_000].iter() {
        // Mix of critical, improvement and normal weights
        let weights: Vec<f64> = (0..*size)
            .map(|i| match i % 10 {
                0 => 10.0,
                1 | 2 => 3.0,
                _ => 1.0,
            })
            .collect();
        let sampler = WeightedSampler::new(&weights, *size).expect("bench: sampler");

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut rng = StdRng::seed_from_u64(42);
            b.iter(|| black_box(sampler.sample(&mut rng)));
        });
    }

    group.finish();
}

fn bench_queue_loading(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_loading");

    for lines in [100usize, 1_000].iter() {
        let mut file = tempfile::NamedTempFile::new().expect("bench: temp file");
        for i in 0..*lines {
            writeln!(
                file,
                r#"{{"query": "question {i}", "response": "answer {i}", "weight": {}}}"#,
                1 + i % 10
            )
            .expect("bench: write");
        }
        let path = file.path().to_path_buf();

        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, _| {
            b.iter(|| black_box(load_training_records(&path).expect("bench: load")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_weighted_sampling, bench_queue_loading);
criterion_main!(benches);
