//! # Pool and Batcher Benchmark
//!
//! Checkout/return cost of the array pool and fan-out cost of a batch.
//!
//! Run with: `cargo bench --package strata_core`

// Benchmarks don't need docs
#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_core::{ArrayPool, ThreadPool};

/// Cells in an 8x8-chunk tile with a 2-chunk border.
const TILE_CELLS: usize = (12 * 16) * (12 * 16);

fn bench_array_checkout(c: &mut Criterion) {
    let pool: ArrayPool<u64> = ArrayPool::new(4);
    pool.warm(4, TILE_CELLS);

    c.bench_function("array_pool_checkout_return", |b| {
        b.iter(|| {
            let mut array = pool.get(TILE_CELLS);
            array[0] = 1;
            black_box(array.len())
        });
    });

    c.bench_function("array_fresh_allocation", |b| {
        b.iter(|| {
            let array = vec![0_u64; TILE_CELLS];
            black_box(array.len())
        });
    });
}

fn bench_batch_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_fan_out");

    for threads in [1, 4, 8] {
        let pool = ThreadPool::new(threads).expect("thread pool");
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                let sum = Arc::new(AtomicU64::new(0));
                let mut batch = pool.batcher();
                batch.size(16);
                for i in 0..16_u64 {
                    let sum = Arc::clone(&sum);
                    batch
                        .submit(move || {
                            sum.fetch_add(i, Ordering::Relaxed);
                        })
                        .expect("sized for 16");
                }
                batch.close();
                black_box(sum.load(Ordering::Relaxed))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_array_checkout, bench_batch_fan_out);
criterion_main!(benches);
