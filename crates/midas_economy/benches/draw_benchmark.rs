//! Benchmark for prize draw performance.
//!
//! TARGET: 1,000,000 draws per second on one resolver
//!
//! Run with: cargo bench --package midas_economy --bench draw_benchmark

// The criterion_group! macro expands to an undocumented public function,
// which the workspace-wide `missing_docs = "deny"` lint would reject.
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use midas_economy::{PoolEntry, PrizePool, PrizeResolver};
use midas_shared::Tier;

fn create_test_pool() -> PrizePool {
    PrizePool::compile(
        &[
            PoolEntry {
                tier: Tier::D,
                item: 100,
                weight: 55.0,
            },
            PoolEntry {
                tier: Tier::B,
                item: 101,
                weight: 25.0,
            },
            PoolEntry {
                tier: Tier::S,
                item: 102,
                weight: 15.0,
            },
            PoolEntry {
                tier: Tier::SS,
                item: 103,
                weight: 4.0,
            },
            PoolEntry {
                tier: Tier::SSS,
                item: 104,
                weight: 1.0,
            },
        ],
        false,
    )
    .expect("pool rejected")
}

fn benchmark_single_draw(c: &mut Criterion) {
    let pool = create_test_pool();
    let resolver = PrizeResolver::with_seed([11; 32]);

    c.bench_function("single_draw", |b| {
        b.iter(|| black_box(resolver.draw(black_box(&pool))));
    });
}

fn benchmark_million_draws(c: &mut Criterion) {
    let pool = create_test_pool();
    let resolver = PrizeResolver::with_seed([11; 32]);

    let mut group = c.benchmark_group("million_draws");
    group.throughput(Throughput::Elements(1_000_000));
    group.sample_size(10);

    group.bench_function("1M_draws", |b| {
        b.iter(|| {
            for _ in 0..1_000_000u32 {
                black_box(resolver.draw(&pool));
            }
        });
    });

    group.finish();
}

fn benchmark_purchase_batch(c: &mut Criterion) {
    let pool = create_test_pool();
    let resolver = PrizeResolver::with_seed([11; 32]);

    // Ten units is the per-order cap; this is the hot allocation path.
    c.bench_function("draw_batch_10", |b| {
        b.iter(|| black_box(resolver.draw_batch(black_box(&pool), black_box(10))));
    });
}

fn benchmark_settlement_pick(c: &mut Criterion) {
    let resolver = PrizeResolver::with_seed([11; 32]);

    // A 120-slot raffle drawing 3 distinct winners.
    c.bench_function("pick_distinct_3_of_120", |b| {
        b.iter(|| black_box(resolver.pick_distinct(black_box(120), black_box(3))));
    });
}

fn benchmark_statistics(c: &mut Criterion) {
    let pool = create_test_pool();
    let resolver = PrizeResolver::with_seed([11; 32]);

    c.bench_function("statistics_100k", |b| {
        b.iter(|| black_box(resolver.run_statistics(black_box(&pool), black_box(100_000))));
    });
}

criterion_group!(
    benches,
    benchmark_single_draw,
    benchmark_million_draws,
    benchmark_purchase_batch,
    benchmark_settlement_pick,
    benchmark_statistics
);
criterion_main!(benches);
