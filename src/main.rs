use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use concealment_server::concealment::ConcealmentController;
use concealment_server::config::{ConcealmentSettings, ConfigStore};
use concealment_server::host::memory::MemoryWorld;
use concealment_server::host::{EntityId, FactionRelation, PlayerId};
use concealment_server::metrics::{self, Metrics};
use concealment_server::util::vec3::Vec3;
#[cfg(feature = "dynamic_visibility")]
use concealment_server::host::UpdatePhase;
#[cfg(feature = "dynamic_visibility")]
use concealment_server::visibility::DynamicVisibilityManager;

/// Simulation tick rate of the host loop
const TICK_HZ: u64 = 60;

/// Seconds between status lines
const STATUS_INTERVAL_SECS: u64 = 30;

/// Populated demo world
struct DemoWorld {
    world: Arc<MemoryWorld>,
    observers: Vec<PlayerId>,
    /// Blocks whose type the demo visibility rules govern
    governed: Vec<EntityId>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn random_point(rng: &mut impl Rng, radius: f64) -> Vec3 {
    Vec3::new(
        rng.gen_range(-radius..radius),
        rng.gen_range(-radius..radius),
        rng.gen_range(-radius..radius),
    )
}

/// Scatter structures, a few characters and observers across a cube
fn populate(clusters: usize, observers: usize, radius: f64) -> DemoWorld {
    let world = Arc::new(MemoryWorld::new());
    let mut rng = rand::thread_rng();

    for identity in 1..=8u64 {
        world.set_faction(identity, (identity % 3) as u32 + 1);
    }
    world.set_relation(1, 2, FactionRelation::Neutral);

    let mut governed = Vec::new();
    for i in 0..clusters {
        let owner = rng.gen_range(1..=8u64);
        let position = random_point(&mut rng, radius);
        let grid = world.spawn_structure(&format!("Grid {}", i), position, rng.gen_range(5.0..60.0), Some(owner));
        world.spawn_block(grid, "Reactor", "LargeBlockSmallGenerator");
        if rng.gen_bool(0.3) {
            governed.push(world.spawn_block(grid, "LargeGatlingTurret", "LargeGatlingTurret"));
        }
        if rng.gen_bool(0.1) {
            let docked = world.spawn_structure(
                &format!("Grid {} (docked)", i),
                position + Vec3::new(40.0, 0.0, 0.0),
                8.0,
                Some(owner),
            );
            world.link(grid, docked);
        }
    }
    for _ in 0..clusters / 20 {
        world.spawn_character(random_point(&mut rng, radius), rng.gen_range(1..=8u64));
    }

    let observers = (0..observers)
        .map(|i| world.add_observer(i as u64 % 8 + 1, random_point(&mut rng, radius)))
        .collect();

    DemoWorld {
        world,
        observers,
        governed,
    }
}

/// Move every observer a small random step
fn wander(demo: &DemoWorld, step: f64) {
    let mut rng = rand::thread_rng();
    for player in &demo.observers {
        let offset = random_point(&mut rng, step);
        if let Some(o) = demo.world.observer(*player) {
            demo.world.move_observer(*player, o.position + offset);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Concealment Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = ConcealmentSettings::load_or_default();
    info!(
        "Configuration loaded: conceal={} reveal={} intervals={}/{} rules={}",
        settings.conceal_distance,
        settings.reveal_distance,
        settings.conceal_interval,
        settings.reveal_interval,
        settings.dynamic_rules.len()
    );
    let store = Arc::new(ConfigStore::new(settings)?);

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    let metrics_port: u16 = env_or("METRICS_PORT", 9090);
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let demo = populate(
        env_or("DEMO_CLUSTERS", 2_000),
        env_or("DEMO_OBSERVERS", 8),
        env_or("DEMO_WORLD_RADIUS", 200_000.0),
    );
    info!(
        "Demo world ready: {} observers, {} governed blocks",
        demo.observers.len(),
        demo.governed.len()
    );

    let mut controller = ConcealmentController::new(demo.world.services(), store.clone(), metrics.clone());

    #[cfg(feature = "dynamic_visibility")]
    let visibility = {
        let manager =
            DynamicVisibilityManager::new(demo.world.services(), demo.world.clone(), store.clone(), metrics.clone())?;
        controller = controller.with_visibility(manager.clone());
        manager
    };

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / TICK_HZ));
    let mut last_status = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                wander(&demo, 50.0);
                controller.tick();

                #[cfg(feature = "dynamic_visibility")]
                {
                    let now = Instant::now();
                    for entity in demo.governed.iter().filter(|e| !controller.is_concealed(**e)) {
                        visibility.before_update(*entity, UpdatePhase::BeforeSimulation, now);
                    }
                }

                if last_status.elapsed() >= Duration::from_secs(STATUS_INTERVAL_SECS) {
                    last_status = Instant::now();
                    info!(
                        "Status: {} clusters concealed, index height {}",
                        controller.concealed_clusters().len(),
                        controller.index().height()
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
    }

    // Cleanup
    controller.shutdown();
    info!("Server stopped");

    Ok(())
}
