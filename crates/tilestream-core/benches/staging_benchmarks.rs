//! Staging Benchmarks
//!
//! Performance benchmarks for the host staging pool

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tilestream_core::{HostPageAllocator, MemoryBudget};

const BLOCK_SIZE: usize = 64 * 1024;

fn bench_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("staging_allocate_release");

    for count in [16, 128, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let pool = HostPageAllocator::new(BLOCK_SIZE, MemoryBudget::for_blocks(BLOCK_SIZE, count));
            b.iter(|| {
                let blocks: Vec<_> = (0..count)
                    .map(|_| pool.allocate(BLOCK_SIZE).unwrap())
                    .collect();
                black_box(&blocks);
                drop(blocks);
            });
        });
    }

    group.finish();
}

fn bench_fragmented_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("staging_fragmented");

    for count in [128, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let pool = HostPageAllocator::new(BLOCK_SIZE, MemoryBudget::for_blocks(BLOCK_SIZE, count));
            // Keep every other block so multi-block runs must search
            let held: Vec<_> = (0..count)
                .map(|_| pool.allocate(BLOCK_SIZE).unwrap())
                .enumerate()
                .filter_map(|(i, block)| (i % 2 == 0).then_some(block))
                .collect();

            b.iter(|| black_box(pool.allocate(BLOCK_SIZE).unwrap()));
            drop(held);
        });
    }

    group.finish();
}

fn bench_write(c: &mut Criterion) {
    let pool = HostPageAllocator::new(BLOCK_SIZE, MemoryBudget::for_blocks(BLOCK_SIZE, 4));
    let data = vec![0xffu8; BLOCK_SIZE];

    c.bench_function("staging_write_tile", |b| {
        let mut block = pool.allocate(BLOCK_SIZE).unwrap();
        b.iter(|| block.write(black_box(&data)).unwrap());
    });
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_fragmented_allocate,
    bench_write,
);

criterion_main!(benches);
