//! Grouping engine benchmarks
//!
//! - bench_window_assign: assigner cost per timestamp
//! - bench_process_element: per-element cost with the default trigger
//! - bench_session_merge: per-element cost when sessions keep merging
//! - bench_watermark_fire: firing and collecting many windows at once
//! - bench_stage_bundle: partitioned bundle processing
//!
//! Run with: cargo bench --bench engine_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventide_core::engine::{GroupByKeyEngine, Input, Record, Stage, StageConfig, WindowingStrategy};
use eventide_core::pane::{AccumulationMode, SumAggregator};
use eventide_core::trigger::Trigger;
use eventide_core::window::WindowAssigner;

const KEYS: u64 = 1024;

fn fixed_strategy() -> WindowingStrategy {
    WindowingStrategy::new(WindowAssigner::fixed(60_000).unwrap())
}

/// Benchmark window assignment
fn bench_window_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_assign");
    group.throughput(Throughput::Elements(1));

    let assigners = [
        ("fixed", WindowAssigner::fixed(60_000).unwrap()),
        ("sliding_x4", WindowAssigner::sliding(60_000, 15_000).unwrap()),
        ("session", WindowAssigner::session(30_000).unwrap()),
    ];
    for (name, assigner) in assigners {
        group.bench_with_input(BenchmarkId::new("assign", name), &assigner, |b, assigner| {
            let mut ts = 0i64;
            b.iter(|| {
                let windows = assigner.assign(black_box(ts));
                ts += 100;
                black_box(windows)
            });
        });
    }

    group.finish();
}

/// Benchmark element ingestion across keys
fn bench_process_element(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_element");
    group.throughput(Throughput::Elements(1));

    for mode in [AccumulationMode::Discarding, AccumulationMode::Accumulating] {
        let strategy = fixed_strategy()
            .with_trigger(Trigger::after_end_of_window().with_early_firings(Trigger::after_count(100)))
            .with_accumulation_mode(mode);
        group.bench_function(BenchmarkId::new("early_firings", format!("{mode:?}")), |b| {
            let mut engine = GroupByKeyEngine::new(strategy.clone(), SumAggregator).unwrap();
            let mut i = 0u64;
            b.iter(|| {
                let key = i % KEYS;
                let ts = i64::try_from(i / KEYS).unwrap();
                let panes = engine.process_element(key, 1, ts).unwrap();
                i += 1;
                black_box(panes)
            });
        });
    }

    group.finish();
}

/// Benchmark session merging
fn bench_session_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_merge");
    group.throughput(Throughput::Elements(1));

    group.bench_function("chained", |b| {
        let strategy = WindowingStrategy::new(WindowAssigner::session(1_000).unwrap());
        let mut engine = GroupByKeyEngine::new(strategy, SumAggregator).unwrap();
        let mut ts = 0i64;
        b.iter(|| {
            let panes = engine.process_element(ts % 64, 1, ts).unwrap();
            ts += 7;
            black_box(panes)
        });
    });

    group.finish();
}

/// Benchmark a watermark advance that fires and collects every window
fn bench_watermark_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("watermark_fire");

    for windows in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(windows));
        group.bench_with_input(BenchmarkId::new("fixed", windows), &windows, |b, &windows| {
            b.iter_batched(
                || {
                    let mut engine = GroupByKeyEngine::new(fixed_strategy(), SumAggregator).unwrap();
                    for key in 0..windows {
                        engine.process_element(key, 1, 10).unwrap();
                    }
                    engine
                },
                |mut engine| black_box(engine.advance_watermark(60_000).unwrap()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark partitioned bundle processing
fn bench_stage_bundle(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_bundle");
    let bundle_size = 4096u64;
    group.throughput(Throughput::Elements(bundle_size));

    for partitions in [1usize, 2, 4] {
        group.bench_with_input(
            BenchmarkId::new("partitions", partitions),
            &partitions,
            |b, &partitions| {
                let (stage, _rx) =
                    Stage::open(StageConfig::new("bench", partitions), fixed_strategy(), SumAggregator)
                        .unwrap();
                let mut base = 0i64;
                b.iter(|| {
                    let bundle: Vec<Input<u64, i64>> = (0..bundle_size)
                        .map(|i| Input::Element(Record::new(i % KEYS, 1, base)))
                        .collect();
                    base += 1;
                    black_box(stage.process_bundle(bundle).unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_window_assign,
    bench_process_element,
    bench_session_merge,
    bench_watermark_fire,
    bench_stage_bundle,
);
criterion_main!(benches);
