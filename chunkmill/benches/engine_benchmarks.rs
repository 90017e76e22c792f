use chunkmill::{BoxError, Engine, EngineConfig, SegmentView};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::{fs::File, io::Write, num::NonZeroUsize, path::PathBuf};
use tempfile::tempdir;

fn create_test_file(dir: &tempfile::TempDir, lines: usize) -> std::io::Result<PathBuf> {
    let path = dir.path().join(format!("input_{}.txt", lines));
    let mut file = File::create(&path)?;
    for j in 0..lines {
        writeln!(
            file,
            "{} status=ok latency_ms={} path=/api/v1/items/{} user={}",
            j,
            j % 997,
            j,
            j % 31
        )?;
    }
    Ok(path)
}

fn create_engine(workers: usize, mmap_threshold: u64) -> Engine {
    Engine::new(
        EngineConfig::default()
            .with_worker_count(NonZeroUsize::new(workers).unwrap())
            .with_mmap_threshold(mmap_threshold),
    )
    .unwrap()
}

fn count_records(view: SegmentView<'_>) -> Result<u64, BoxError> {
    Ok(view.records().count() as u64)
}

fn sum_latency(view: SegmentView<'_>) -> Result<u64, BoxError> {
    let mut sum = 0;
    for line in view.lines() {
        let line = line?;
        if let Some(value) = line
            .split_whitespace()
            .find_map(|field| field.strip_prefix("latency_ms="))
        {
            sum += value.parse::<u64>()?;
        }
    }
    Ok(sum)
}

fn bench_fold(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = create_test_file(&dir, 200_000).unwrap();
    let engine = create_engine(num_cpus::get(), u64::MAX);

    let mut group = c.benchmark_group("Fold");
    group.bench_function("count_records", |b| {
        b.iter(|| {
            let input = engine.open(&path).unwrap();
            black_box(engine.fold(input, count_records, |a, b| a + b, 0).unwrap())
        });
    });
    group.bench_function("sum_field", |b| {
        b.iter(|| {
            let input = engine.open(&path).unwrap();
            black_box(engine.fold(input, sum_latency, |a, b| a + b, 0).unwrap())
        });
    });
    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = create_test_file(&dir, 200_000).unwrap();
    let engine = create_engine(num_cpus::get(), u64::MAX);
    let upper = |line: &str| -> Result<String, BoxError> { Ok(line.to_uppercase()) };

    let mut group = c.benchmark_group("Transform");
    group.bench_function("uppercase", |b| {
        b.iter(|| {
            let input = engine.open(&path).unwrap();
            let mut out = Vec::new();
            engine.transform(input, &mut out, &upper).unwrap();
            black_box(out.len())
        });
    });
    group.finish();
}

fn bench_worker_scaling(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = create_test_file(&dir, 500_000).unwrap();

    let mut group = c.benchmark_group("Worker Scaling");
    for workers in [1, 2, 4, 8] {
        let engine = create_engine(workers, u64::MAX);
        group.bench_function(format!("workers_{}", workers), |b| {
            b.iter(|| {
                let input = engine.open(&path).unwrap();
                black_box(engine.fold(input, sum_latency, |a, b| a + b, 0).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_input_source(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let path = create_test_file(&dir, 200_000).unwrap();

    let mut group = c.benchmark_group("Input Source");

    // Always buffered
    let buffered = create_engine(4, u64::MAX);
    group.bench_function("buffered", |b| {
        b.iter(|| {
            let input = buffered.open(&path).unwrap();
            black_box(buffered.fold(input, count_records, |a, b| a + b, 0).unwrap())
        });
    });

    // Always mapped
    let mapped = create_engine(4, 0);
    group.bench_function("mapped", |b| {
        b.iter(|| {
            let input = mapped.open(&path).unwrap();
            black_box(mapped.fold(input, count_records, |a, b| a + b, 0).unwrap())
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_fold, bench_transform, bench_worker_scaling, bench_input_source
}

criterion_main!(benches);
