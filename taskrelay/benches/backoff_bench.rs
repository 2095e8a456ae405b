//! Benchmarks for backoff computation and the retry fast path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

use taskrelay::events::NoOpEventSink;
use taskrelay::retry::{RetryConfig, RetryExecutor};

fn backoff_benchmark(c: &mut Criterion) {
    let policy = RetryConfig::default().backoff();
    let mut rng = StdRng::seed_from_u64(7);

    c.bench_function("backoff_delay_seeded", |b| {
        b.iter(|| policy.delay_with_rng(black_box(4), &mut rng));
    });

    c.bench_function("backoff_delay_thread_rng", |b| {
        b.iter(|| policy.delay(black_box(4)));
    });
}

fn retry_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let executor = RetryExecutor::new(Arc::new(NoOpEventSink));
    let config = RetryConfig::default();

    c.bench_function("retry_first_attempt_success", |b| {
        b.iter(|| {
            runtime.block_on(executor.run("noop", || async { Ok(black_box(42)) }, &config))
        });
    });
}

criterion_group!(benches, backoff_benchmark, retry_benchmark);
criterion_main!(benches);
