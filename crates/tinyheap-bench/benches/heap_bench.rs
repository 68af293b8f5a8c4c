//! Single-heap allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tinyheap_bench::bench_heap;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");
    let heap = bench_heap(1 << 20);

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("tinyheap", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = heap.allocate(sz).expect("fits");
                heap.free(criterion::black_box(ptr));
            });
        });
    }
    group.finish();
}

fn bench_fragmented_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmented_fit");
    let heap = bench_heap(1 << 20);
    // Checkerboard of 64-byte holes between live blocks.
    let mut live = Vec::new();
    while let Ok(ptr) = heap.allocate(48) {
        live.push(ptr);
    }
    for ptr in live.iter().step_by(2) {
        heap.free(*ptr);
    }

    group.bench_function("best_fit_48B", |b| {
        b.iter(|| {
            let ptr = heap.allocate(48).expect("hole available");
            heap.free(criterion::black_box(ptr));
        });
    });
    group.finish();
}

fn bench_memalign(c: &mut Criterion) {
    let alignments: &[usize] = &[16, 64, 256, 4096];
    let mut group = c.benchmark_group("memalign");
    let heap = bench_heap(1 << 20);

    for &alignment in alignments {
        group.bench_with_input(
            BenchmarkId::new("tinyheap", alignment),
            &alignment,
            |b, &align| {
                b.iter(|| {
                    let ptr = heap.memalign(align, 100).expect("fits");
                    heap.free(criterion::black_box(ptr));
                });
            },
        );
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");
    let heap = bench_heap(1 << 20);

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<usize> = (0..1000).map(|_| heap.allocate(64).expect("fits")).collect();
            for ptr in criterion::black_box(ptrs) {
                heap.free(ptr);
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_fragmented_fit,
    bench_memalign,
    bench_alloc_burst
);
criterion_main!(benches);
