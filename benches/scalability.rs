//! Scalability benchmarks for the concealment server
//!
//! Measures the conceal scan, index queries and the visibility veto at
//! increasing world sizes.
//!
//! Run with: cargo bench --bench scalability

use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use concealment_server::concealment::{ConcealmentController, ConcealmentIndex};
use concealment_server::config::{ConcealmentSettings, ConfigStore, DynamicVisibilityRule, VisibilityCategory};
use concealment_server::host::memory::MemoryWorld;
use concealment_server::host::{EntityId, UpdatePhase};
use concealment_server::metrics::Metrics;
use concealment_server::util::bounds::Aabb;
use concealment_server::util::vec3::Vec3;
use concealment_server::visibility::DynamicVisibilityManager;
use rand::Rng;

const WORLD_RADIUS: f64 = 100_000.0;

fn random_point(rng: &mut impl Rng) -> Vec3 {
    Vec3::new(
        rng.gen_range(-WORLD_RADIUS..WORLD_RADIUS),
        rng.gen_range(-WORLD_RADIUS..WORLD_RADIUS),
        rng.gen_range(-WORLD_RADIUS..WORLD_RADIUS),
    )
}

/// World with `count` randomly placed clusters and a handful of observers
fn create_world(count: usize) -> (Arc<MemoryWorld>, Vec<EntityId>) {
    let world = Arc::new(MemoryWorld::new());
    let mut rng = rand::thread_rng();
    let mut turrets = Vec::with_capacity(count);

    for i in 0..count {
        let owner = (i % 4) as u64 + 1;
        let grid = world.spawn_structure(&format!("Grid{}", i), random_point(&mut rng), rng.gen_range(5.0..50.0), Some(owner));
        turrets.push(world.spawn_block(grid, "Turret", "Gatling"));
    }
    for i in 0..8 {
        world.add_observer(i % 4 + 1, random_point(&mut rng));
    }
    (world, turrets)
}

fn settings() -> ConcealmentSettings {
    ConcealmentSettings {
        conceal_distance: 20_000.0,
        reveal_distance: 15_000.0,
        conceal_interval: 1,
        reveal_interval: 1,
        ..Default::default()
    }
}

/// Benchmark a full conceal scan from an all-active world
fn bench_conceal_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("conceal_scan");
    group.sample_size(20);

    for count in [100, 1000, 10000] {
        let (world, _) = create_world(count);
        let store = Arc::new(ConfigStore::new(settings()).unwrap());

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter_batched(
                || ConcealmentController::new(world.services(), store.clone(), Arc::new(Metrics::new())),
                |mut controller| {
                    black_box(controller.conceal_grids(20_000.0));
                    controller.reveal_all();
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark sphere queries against a populated index
fn bench_index_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_query");
    group.sample_size(50);

    for count in [100, 1000, 10000] {
        let mut rng = rand::thread_rng();
        let index = ConcealmentIndex::new();
        for i in 0..count {
            index.insert(i as u64, Aabb::from_center(random_point(&mut rng), rng.gen_range(5.0..50.0)));
        }
        let centers: Vec<Vec3> = (0..64).map(|_| random_point(&mut rng)).collect();

        group.throughput(Throughput::Elements(centers.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                for center in &centers {
                    black_box(index.query_sphere(*center, 15_000.0));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark the per-update veto with warm decisions
fn bench_visibility_veto(c: &mut Criterion) {
    let mut group = c.benchmark_group("visibility_veto");
    group.sample_size(50);

    for count in [100, 1000, 10000] {
        let (world, turrets) = create_world(count);
        let store = Arc::new(
            ConfigStore::new(ConcealmentSettings {
                dynamic_rules: vec![DynamicVisibilityRule::new(
                    "Turret",
                    None,
                    VisibilityCategory::HostileGrids,
                    5_000.0,
                )],
                ..settings()
            })
            .unwrap(),
        );
        let manager =
            DynamicVisibilityManager::new(world.services(), world.clone(), store, Arc::new(Metrics::new())).unwrap();
        let now = Instant::now();
        for turret in &turrets {
            manager.refresh_entity(*turret, now);
        }
        manager.wait_idle(std::time::Duration::from_secs(30));

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                for turret in &turrets {
                    black_box(manager.before_update(*turret, UpdatePhase::BeforeSimulation, now));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_conceal_scan, bench_index_query, bench_visibility_veto);
criterion_main!(benches);
