use criterion::{Criterion, criterion_group, criterion_main};
use portalloc::{PortAllocator, PortAllocatorConfig};
use std::hint::black_box;

fn allocate_release_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocator");

    let allocator = PortAllocator::new(PortAllocatorConfig::default());

    group.bench_function("allocate_release_default_range", |b| {
        b.iter(|| {
            let port = allocator.allocate(black_box("bench-svc"), None).unwrap();
            allocator.release(black_box(port));
        })
    });

    // Half-full range: first-fit has to scan past existing allocations
    let crowded = PortAllocator::new(PortAllocatorConfig::default());
    for i in 0..500 {
        crowded.allocate(&format!("filler-{i}"), None).unwrap();
    }

    group.bench_function("allocate_release_crowded_range", |b| {
        b.iter(|| {
            let port = crowded.allocate(black_box("bench-svc"), None).unwrap();
            crowded.release(black_box(port));
        })
    });

    group.bench_function("classify", |b| {
        b.iter(|| portalloc::classify(black_box("payments-postgres-replica")))
    });

    group.finish();
}

criterion_group!(benches, allocate_release_benchmark);
criterion_main!(benches);
