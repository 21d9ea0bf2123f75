use criterion::{Criterion, criterion_group, criterion_main};
use discovery::{DiscoveryClient, DiscoveryClientConfig, StaticResolver};
use portalloc::PortAllocator;
use registry::{ServiceRecord, ServiceRegistry};
use std::hint::black_box;
use std::sync::Arc;

fn client() -> DiscoveryClient {
    DiscoveryClient::new(
        DiscoveryClientConfig::default(),
        Arc::new(ServiceRegistry::default()),
        Arc::new(PortAllocator::default()),
    )
    .with_dns_resolver(Arc::new(
        StaticResolver::new().with_entry("external", "10.0.0.1", 443),
    ))
}

fn discover_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("discover");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let client = client();

    rt.block_on(async {
        for i in 0..100 {
            client
                .register(ServiceRecord::new(format!("svc-{i}"), "10.0.0.2", 20000 + i))
                .await
                .unwrap();
        }
    });

    // Registry fast path
    group.bench_function("registry_hit", |b| {
        b.iter(|| rt.block_on(async { black_box(client.discover("svc-42").await) }))
    });

    // Registry miss, resolver hit
    group.bench_function("resolver_fallback", |b| {
        b.iter(|| rt.block_on(async { black_box(client.discover("external").await) }))
    });

    group.bench_function("miss", |b| {
        b.iter(|| rt.block_on(async { black_box(client.discover("nobody").await) }))
    });

    group.finish();
}

fn register_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("register");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let client = client();

    group.bench_function("auto_port_register_deregister", |b| {
        b.iter(|| {
            rt.block_on(async {
                let stored = client
                    .register(ServiceRecord::new("bench-api", "10.0.0.3", 0))
                    .await
                    .unwrap();
                client.deregister("bench-api").await.unwrap();
                black_box(stored.port)
            })
        })
    });

    group.finish();
}

criterion_group!(benches, discover_benchmark, register_benchmark);
criterion_main!(benches);
