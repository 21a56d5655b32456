// Criterion benchmarks for fanrpc-client
//
// Run benchmarks with:
//   cargo bench -p fanrpc-client
//
// For detailed output with plots:
//   cargo bench -p fanrpc-client -- --save-baseline main

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fanrpc_client::{
    addr_kind, Backoff, CircuitBreaker, ConsecutiveFailureBreaker, ExponentialBackoff, Registry,
};

fn addrs(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.{}.{}:8081", i / 250, i % 250)).collect()
}

fn filled(count: usize) -> (Registry<u64>, Vec<String>) {
    let registry = Registry::new();
    let addrs = addrs(count);
    for (i, addr) in addrs.iter().enumerate() {
        registry.store(addr, Arc::new(i as u64));
    }
    // promote the overlay so loads hit the snapshot
    let _ = registry.range(|_, _| true);
    (registry, addrs)
}

fn bench_registry_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_load");

    for count in [4, 32, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let (registry, addrs) = filled(count);
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % addrs.len();
                black_box(registry.load(black_box(&addrs[i])));
            });
        });
    }

    group.bench_function("miss", |b| {
        let (registry, _) = filled(32);
        b.iter(|| black_box(registry.load(black_box("10.9.9.9:8081"))));
    });

    group.finish();
}

fn bench_registry_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_swap");

    group.bench_function("existing_key", |b| {
        let (registry, addrs) = filled(32);
        let value = Arc::new(7u64);
        b.iter(|| black_box(registry.swap(black_box(&addrs[3]), Arc::clone(&value))));
    });

    group.bench_function("store_then_delete", |b| {
        let (registry, _) = filled(32);
        let value = Arc::new(7u64);
        b.iter(|| {
            registry.store(black_box("10.9.9.9:8081"), Arc::clone(&value));
            black_box(registry.delete(black_box("10.9.9.9:8081")));
        });
    });

    group.finish();
}

fn bench_registry_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_entries");

    for count in [4, 32, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let (registry, _) = filled(count);
            b.iter(|| black_box(registry.entries()));
        });
    }

    group.finish();
}

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("policies");

    group.bench_function("backoff_next_delay", |b| {
        let backoff = ExponentialBackoff::default();
        b.iter(|| {
            for retry in 1..=4 {
                black_box(backoff.next_delay(black_box(retry)));
            }
        });
    });

    group.bench_function("breaker_allow_closed", |b| {
        let breaker = ConsecutiveFailureBreaker::default();
        b.iter(|| breaker.allow(black_box("search/10.0.0.1:8081")));
    });

    group.bench_function("addr_kind", |b| {
        b.iter(|| {
            black_box(addr_kind(black_box("10.0.0.1:8081")));
            black_box(addr_kind(black_box("agent-0.agent.svc:8081")));
            black_box(addr_kind(black_box("[::1]:8081")));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_registry_load,
    bench_registry_swap,
    bench_registry_entries,
    bench_policies
);
criterion_main!(benches);
