//! Trigger evaluation benchmarks
//!
//! - bench_compile: flattening a trigger tree
//! - bench_element: on_element + evaluate for common trigger shapes
//! - bench_merge_states: combining the states of merged windows
//! - bench_state_bytes: trigger state checkpoint encoding
//!
//! Run with: cargo bench --bench trigger_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventide_core::trigger::{Trigger, TriggerContext, TriggerEvaluator, TriggerState};
use eventide_core::window::Window;

fn triggers() -> Vec<(&'static str, Trigger)> {
    vec![
        ("default", Trigger::default()),
        ("count", Trigger::repeatedly(Trigger::after_count(10))),
        (
            "early_late",
            Trigger::after_end_of_window()
                .with_early_firings(Trigger::after_processing_time(1_000))
                .with_late_firings(Trigger::after_count(1)),
        ),
        (
            "nested",
            Trigger::repeatedly(Trigger::after_first(vec![
                Trigger::after_count(100),
                Trigger::after_all(vec![
                    Trigger::after_processing_time(500),
                    Trigger::after_count(10),
                ]),
            ]))
            .or_finally(Trigger::after_watermark()),
        ),
    ]
}

fn context(watermark: i64, processing_time: i64) -> TriggerContext {
    TriggerContext {
        window: Window::interval(0, 60_000),
        watermark,
        processing_time,
    }
}

/// Benchmark compiling trigger trees
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger_compile");

    for (name, trigger) in triggers() {
        group.bench_with_input(BenchmarkId::new("compile", name), &trigger, |b, trigger| {
            b.iter(|| black_box(TriggerEvaluator::new(black_box(trigger)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark per-element evaluation
fn bench_element(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger_element");
    group.throughput(Throughput::Elements(1));

    for (name, trigger) in triggers() {
        let evaluator = TriggerEvaluator::new(&trigger).unwrap();
        group.bench_with_input(BenchmarkId::new("element", name), &evaluator, |b, evaluator| {
            let mut state = evaluator.new_state();
            let mut now = 0i64;
            b.iter(|| {
                let ctx = context(-1, now);
                evaluator.on_element(&mut state, &ctx);
                let result = evaluator.evaluate(&mut state, &ctx);
                if state.is_finished() {
                    state = evaluator.new_state();
                }
                now += 10;
                black_box(result)
            });
        });
    }

    group.finish();
}

/// Benchmark merging trigger states
fn bench_merge_states(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger_merge");

    for sources in [2usize, 8, 32] {
        let evaluator = TriggerEvaluator::new(&triggers()[3].1).unwrap();
        let ctx = context(-1, 0);
        let states: Vec<TriggerState> = (0..sources)
            .map(|i| {
                let mut state = evaluator.new_state();
                for _ in 0..i {
                    evaluator.on_element(&mut state, &ctx);
                }
                state
            })
            .collect();

        group.throughput(Throughput::Elements(sources as u64));
        group.bench_with_input(BenchmarkId::new("nested", sources), &states, |b, states| {
            let refs: Vec<&TriggerState> = states.iter().collect();
            b.iter(|| black_box(evaluator.merge_states(black_box(&refs), &ctx)));
        });
    }

    group.finish();
}

/// Benchmark trigger state encoding
fn bench_state_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("trigger_state_bytes");

    let evaluator = TriggerEvaluator::new(&triggers()[3].1).unwrap();
    let mut state = evaluator.new_state();
    evaluator.on_element(&mut state, &context(-1, 0));

    group.bench_function("to_bytes", |b| {
        b.iter(|| black_box(state.to_bytes().unwrap()));
    });

    let bytes = state.to_bytes().unwrap();
    group.bench_function("from_bytes", |b| {
        b.iter(|| black_box(TriggerState::from_bytes(black_box(&bytes)).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_element,
    bench_merge_states,
    bench_state_bytes,
);
criterion_main!(benches);
