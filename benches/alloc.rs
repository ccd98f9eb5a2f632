// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 libworld contributors
//
// Shared pool allocator benchmarks.
//
// Run with:
//   cargo bench --bench alloc
//
// Groups:
//   pool_alloc_free — allocate + free one block per iteration (steady state,
//                     the free list stays a single span)
//   pool_churn      — allocate a batch, free in reverse, forcing splits and
//                     coalescing on every iteration
//   heap_baseline   — Vec<u8> via the global allocator, for scale

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use libworld::{World, WorldConfig};

const SMALL: usize = 48;
const MEDIUM: usize = 256;
const LARGE: usize = 4096;

const SIZES: &[(&str, usize)] = &[
    ("small_48", SMALL),
    ("medium_256", MEDIUM),
    ("large_4096", LARGE),
];

fn bench_world() -> World {
    let mut cfg = WorldConfig::new(0x00be_9c00 | (std::process::id() & 0xff));
    cfg.pool_size = 4 << 20;
    World::create(cfg).expect("create bench world")
}

fn bench_alloc_free(c: &mut Criterion) {
    let world = bench_world();
    let pool = world.default_pool();

    let mut group = c.benchmark_group("pool_alloc_free");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let r = pool.allocate(&world, sz).expect("allocate");
                black_box(r);
                pool.free(&world, r).expect("free");
            });
        });
    }
    group.finish();

    world.destroy().expect("destroy bench world");
}

fn bench_churn(c: &mut Criterion) {
    let world = bench_world();
    let pool = world.default_pool();

    let mut group = c.benchmark_group("pool_churn");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes((size * 32) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut refs = Vec::with_capacity(32);
            b.iter(|| {
                for _ in 0..32 {
                    refs.push(pool.allocate(&world, sz).expect("allocate"));
                }
                while let Some(r) = refs.pop() {
                    pool.free(&world, r).expect("free");
                }
            });
        });
    }
    group.finish();

    world.destroy().expect("destroy bench world");
}

fn bench_heap_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_baseline");
    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let v: Vec<u8> = vec![0xABu8; sz];
                black_box(v)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_churn, bench_heap_baseline);
criterion_main!(benches);
