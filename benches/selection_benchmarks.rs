//! # Selection Benchmarks
//!
//! Hot-path cost of picking an instance: each strategy over candidate lists of
//! different sizes, and the registry's healthy-instance lookup.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use service_router::core::config::StrategyKind;
use service_router::load_balancing::strategies::{create_strategy, ConnectionTracker};
use service_router::{ServiceInstance, ServiceRegistration, ServiceRegistry};

const POOL_SIZES: [usize; 3] = [3, 30, 300];

fn create_pool(size: usize) -> Vec<ServiceInstance> {
    (0..size)
        .map(|i| {
            ServiceInstance::new(
                ServiceRegistration::new("bench-svc", "127.0.0.1", 10_000 + i as u16).with_metadata("weight", (i % 5 + 1) as u64),
            )
        })
        .collect()
}

/// Benchmark every strategy over growing candidate lists
fn benchmark_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_select");

    for kind in [
        StrategyKind::RoundRobin,
        StrategyKind::LeastConnections,
        StrategyKind::WeightedRoundRobin,
        StrategyKind::Random,
    ] {
        for &size in &POOL_SIZES {
            let pool = create_pool(size);
            let tracker = Arc::new(ConnectionTracker::new());
            for (i, instance) in pool.iter().enumerate() {
                for _ in 0..(i % 7) {
                    tracker.increment(&instance.id);
                }
            }
            let strategy = create_strategy(kind, tracker);

            group.throughput(Throughput::Elements(1));
            group.bench_with_input(BenchmarkId::new(kind.as_str(), size), &pool, |b, pool| {
                b.iter(|| black_box(strategy.select("bench-svc", black_box(pool))));
            });
        }
    }

    group.finish();
}

/// Benchmark registry lookups that every request performs
fn benchmark_registry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_lookup");

    for &size in &POOL_SIZES {
        let registry = ServiceRegistry::with_defaults();
        for i in 0..size {
            let id = registry.register_service(ServiceRegistration::new("bench-svc", "127.0.0.1", 10_000 + i as u16));
            registry.update_heartbeat("bench-svc", &id);
        }

        group.bench_with_input(BenchmarkId::new("get_healthy_service", size), &registry, |b, registry| {
            b.iter(|| black_box(registry.get_healthy_service(black_box("bench-svc"))));
        });
        group.bench_with_input(BenchmarkId::new("get_healthy_instances", size), &registry, |b, registry| {
            b.iter(|| black_box(registry.get_healthy_instances(black_box("bench-svc"))));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_strategies, benchmark_registry_lookup);
criterion_main!(benches);
