//! Per-entity dynamic visibility
//!
//! Governed entities (those whose type has thresholds configured) have their
//! per-tick updates vetoed unless some other owner's entity is close enough.
//! The veto itself only reads cached state. Nearby lists and decisions are
//! rebuilt on the refresh pool and published under short write locks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::config::{ConfigStore, ConcealmentSettings, VisibilityCategory};
use crate::host::{
    ClusterId, EntityId, EntityInfo, EntityKind, HostServices, InterceptionPoint, UpdateDecision,
    UpdatePhase,
};
use crate::metrics::Metrics;
use crate::visibility::relation::{category_for, classify_relation, worst_relation};
use crate::visibility::rules::{slot, DynamicVisibilityConfig, VisibilityTable, CATEGORY_ORDER};
use crate::visibility::scheduler::{InFlight, RefreshScheduler, SchedulerError, StaggerWindow};

/// Cached verdict for one governed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityDecision {
    pub suppressed: bool,
    /// Category that made the entity visible
    pub reason: Option<VisibilityCategory>,
}

struct DecisionState {
    /// Table version the config was resolved against
    version: u64,
    config: Arc<DynamicVisibilityConfig>,
    cluster: ClusterId,
    reason: Option<VisibilityCategory>,
    next_due: Instant,
}

struct EntityRuntime {
    id: EntityId,
    /// Read lock-free by the veto
    suppressed: AtomicBool,
    in_flight: Arc<InFlight>,
    state: RwLock<DecisionState>,
}

struct NearbyState {
    version: u64,
    /// Grows to the largest max distance of any governed member
    radius: f64,
    /// Top-level entities outside the cluster; may contain dead ids
    entities: Vec<EntityId>,
    next_due: Instant,
}

struct ClusterNearby {
    id: ClusterId,
    in_flight: Arc<InFlight>,
    state: RwLock<NearbyState>,
}

/// Dynamic visibility tables and the update veto
pub struct DynamicVisibilityManager {
    host: HostServices,
    interception: Arc<dyn InterceptionPoint>,
    config: Arc<ConfigStore>,
    table: RwLock<Arc<VisibilityTable>>,
    /// Settings version last compared against the table's rules
    settings_seen: AtomicU64,
    runtimes: RwLock<FxHashMap<EntityId, Arc<EntityRuntime>>>,
    nearby: RwLock<FxHashMap<ClusterId, Arc<ClusterNearby>>>,
    hooked_types: Mutex<FxHashSet<String>>,
    failed_types: RwLock<FxHashSet<String>>,
    nearby_window: Mutex<StaggerWindow<ClusterId>>,
    decision_window: Mutex<StaggerWindow<EntityId>>,
    scheduler: RefreshScheduler,
    metrics: Arc<Metrics>,
}

impl DynamicVisibilityManager {
    /// Build the threshold table and install the veto for every governed type
    pub fn new(
        host: HostServices,
        interception: Arc<dyn InterceptionPoint>,
        config: Arc<ConfigStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, SchedulerError> {
        let snapshot = config.snapshot();
        let settings = &snapshot.settings;
        let now = Instant::now();
        let table = Arc::new(VisibilityTable::build(1, &settings.dynamic_rules));

        let manager = Arc::new(Self {
            scheduler: RefreshScheduler::new(settings.worker_threads, metrics.clone())?,
            nearby_window: Mutex::new(StaggerWindow::new(settings.rebalance(), now)),
            decision_window: Mutex::new(StaggerWindow::new(settings.rebalance(), now)),
            host,
            interception,
            config,
            table: RwLock::new(table.clone()),
            settings_seen: AtomicU64::new(snapshot.version),
            runtimes: RwLock::new(FxHashMap::default()),
            nearby: RwLock::new(FxHashMap::default()),
            hooked_types: Mutex::new(FxHashSet::default()),
            failed_types: RwLock::new(FxHashSet::default()),
            metrics,
        });
        manager.install_hooks(&table);
        Ok(manager)
    }

    // ========================================================================
    // Interception
    // ========================================================================

    /// Veto check run before an entity's update phase
    pub fn before_update(self: &Arc<Self>, entity: EntityId, phase: UpdatePhase, now: Instant) -> UpdateDecision {
        if self.host.world.is_controlled(entity) {
            return self.count(UpdateDecision::PassThrough);
        }
        let Some(runtime) = self.runtime(entity, now) else {
            return self.count(UpdateDecision::PassThrough);
        };

        // A decision being published counts as fresh
        let stale = runtime
            .state
            .try_read()
            .map_or(false, |state| now >= state.next_due);
        if stale {
            self.schedule_decision(&runtime, now);
        }

        if runtime.suppressed.load(Ordering::Acquire) {
            trace!("Suppressed {:?} for entity {}", phase, entity);
            self.count(UpdateDecision::Suppress)
        } else {
            self.count(UpdateDecision::PassThrough)
        }
    }

    #[inline]
    fn count(&self, decision: UpdateDecision) -> UpdateDecision {
        #[cfg(feature = "metrics_extended")]
        {
            let counter = match decision {
                UpdateDecision::Suppress => &self.metrics.updates_suppressed,
                UpdateDecision::PassThrough => &self.metrics.updates_passed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Recompute an entity's decision from its cluster's cached nearby list.
    ///
    /// Never waits for the nearby list; a stale one is rebuilt in the
    /// background and picked up by a later refresh.
    pub fn refresh_entity(self: &Arc<Self>, entity: EntityId, now: Instant) -> Option<VisibilityDecision> {
        let runtime = self.runtime(entity, now)?;
        let world = self.host.world.as_ref();
        let Some(info) = world.entity(entity) else {
            self.on_entity_removed(entity);
            return None;
        };

        let (version, config, cluster) = {
            let state = runtime.state.read();
            (state.version, state.config.clone(), state.cluster)
        };
        let nearby = self.cluster_nearby(cluster, version, now);
        let (candidates, nearby_stale) = {
            let mut state = nearby.state.write();
            state.radius = state.radius.max(config.max_distance());
            (state.entities.clone(), now >= state.next_due)
        };
        if nearby_stale {
            self.schedule_nearby(&nearby, now);
        }

        let reason = self.evaluate(&info, &config, &candidates);
        let suppressed = reason.is_none();
        let settings = self.config.snapshot();

        {
            let mut state = runtime.state.write();
            if state.version != version {
                // Settings changed while computing; the reset already rescheduled us
                return None;
            }
            state.reason = reason;
            state.next_due = now + settings.settings.rebuild_decision();
            let previous = runtime.suppressed.swap(suppressed, Ordering::AcqRel);
            if previous != suppressed {
                match reason {
                    Some(category) => debug!("Revealing entity {} ({}) because of {:?}", entity, info.name, category),
                    None => debug!("Suppressing entity {} ({})", entity, info.name),
                }
            }
        }

        self.decision_window.lock().register(entity);
        self.metrics.decision_refreshes.fetch_add(1, Ordering::Relaxed);
        self.rebalance(now, &settings.settings);

        Some(VisibilityDecision { suppressed, reason })
    }

    /// First category, in `CATEGORY_ORDER`, with a neighbour strictly inside its threshold
    fn evaluate(
        &self,
        subject: &EntityInfo,
        config: &DynamicVisibilityConfig,
        candidates: &[EntityId],
    ) -> Option<VisibilityCategory> {
        let world = self.host.world.as_ref();
        let factions = self.host.factions.as_ref();
        let origin = subject.bounds.center();
        let mut closest = [f64::MAX; 5];

        for id in candidates {
            if *id == subject.id {
                continue;
            }
            // Dead ids fall out here and are dropped at the next rebuild
            let Some(other) = world.entity(*id) else {
                continue;
            };
            let relation = match other.kind {
                EntityKind::Structure => worst_relation(factions, subject.owner, &other.owners),
                EntityKind::Character => classify_relation(factions, subject.owner, other.owner),
                EntityKind::Block | EntityKind::Other => continue,
            };
            let Some(category) = category_for(other.kind, relation) else {
                continue;
            };
            let dist_sq = other.bounds.center().distance_sq_to(origin);
            let best = &mut closest[slot(category)];
            if dist_sq < *best {
                *best = dist_sq;
            }
        }

        CATEGORY_ORDER.iter().copied().find(|category| {
            config
                .threshold_sq(*category)
                .map_or(false, |threshold| closest[slot(*category)] < threshold)
        })
    }

    /// Rebuild the list of top-level entities around a cluster
    pub fn refresh_nearby(&self, cluster: ClusterId, now: Instant) {
        let version = self.current_table().version();
        let world = self.host.world.as_ref();
        let Some(bounds) = world.cluster_bounds(cluster) else {
            self.forget_cluster(cluster);
            return;
        };
        let nearby = self.cluster_nearby(cluster, version, now);
        let radius = nearby.state.read().radius;

        let entities: Vec<EntityId> = world
            .entities_in_box(&bounds.inflate(radius))
            .into_iter()
            .filter(|id| world.cluster_of(*id) != Some(cluster))
            .collect();

        let settings = self.config.snapshot();
        {
            let mut state = nearby.state.write();
            if state.version != version {
                return;
            }
            trace!("Cluster {} sees {} entities within {:.0}", cluster, entities.len(), radius);
            state.entities = entities;
            state.next_due = now + settings.settings.rebuild_nearby();
        }

        self.nearby_window.lock().register(cluster);
        self.metrics.nearby_refreshes.fetch_add(1, Ordering::Relaxed);
        self.rebalance(now, &settings.settings);
    }

    fn schedule_decision(self: &Arc<Self>, runtime: &Arc<EntityRuntime>, now: Instant) {
        let this = self.clone();
        let id = runtime.id;
        self.scheduler.submit(runtime.in_flight.clone(), "decision", move || {
            this.refresh_entity(id, now);
        });
    }

    fn schedule_nearby(self: &Arc<Self>, nearby: &Arc<ClusterNearby>, now: Instant) {
        let this = self.clone();
        let id = nearby.id;
        self.scheduler.submit(nearby.in_flight.clone(), "nearby", move || {
            this.refresh_nearby(id, now);
        });
    }

    /// Spread next due times of everything refreshed during the last window
    fn rebalance(&self, now: Instant, settings: &ConcealmentSettings) {
        let nearby_due = {
            let mut window = self.nearby_window.lock();
            window.set_period(settings.rebalance());
            window.rebalance(now, settings.rebuild_nearby())
        };
        if let Some(due) = nearby_due {
            let map = self.nearby.read();
            for (id, at) in due {
                if let Some(nearby) = map.get(&id) {
                    nearby.state.write().next_due = at;
                }
            }
        }

        let decision_due = {
            let mut window = self.decision_window.lock();
            window.set_period(settings.rebalance());
            window.rebalance(now, settings.rebuild_decision())
        };
        if let Some(due) = decision_due {
            let map = self.runtimes.read();
            for (id, at) in due {
                if let Some(runtime) = map.get(&id) {
                    runtime.state.write().next_due = at;
                }
            }
        }
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Threshold table for the current rules.
    ///
    /// Any settings publish triggers a comparison, but the table and its
    /// version only change when `dynamic_rules` did.
    fn current_table(&self) -> Arc<VisibilityTable> {
        if self.settings_seen.load(Ordering::Acquire) == self.config.version() {
            return self.table.read().clone();
        }

        let rebuilt = {
            let mut table = self.table.write();
            let snapshot = self.config.snapshot();
            self.settings_seen.store(snapshot.version, Ordering::Release);
            if table.built_from(&snapshot.settings.dynamic_rules) {
                return table.clone();
            }
            let version = table.version() + 1;
            *table = Arc::new(VisibilityTable::build(version, &snapshot.settings.dynamic_rules));
            table.clone()
        };
        debug!("Rebuilt dynamic visibility table v{}", rebuilt.version());
        self.install_hooks(&rebuilt);
        rebuilt
    }

    fn install_hooks(&self, table: &VisibilityTable) {
        let mut hooked = self.hooked_types.lock();
        for type_id in table.governed_types() {
            if hooked.contains(&type_id) || self.failed_types.read().contains(&type_id) {
                continue;
            }
            match self.interception.install(&type_id, &UpdatePhase::ALL) {
                Ok(phases) => {
                    debug!("Installed update veto for {} ({} phases)", type_id, phases);
                    hooked.insert(type_id);
                }
                Err(e) => {
                    warn!("{}; entities of type {} stay visible", e, type_id);
                    self.metrics.hook_failures.fetch_add(1, Ordering::Relaxed);
                    self.failed_types.write().insert(type_id);
                }
            }
        }
    }

    /// Config for an entity, `None` when ungoverned or its veto failed to install
    fn resolve(&self, info: &EntityInfo, table: &VisibilityTable) -> Option<Arc<DynamicVisibilityConfig>> {
        let config = table.resolve(&info.type_id, &info.subtype_id, info.base_types.as_slice())?;
        if config.is_empty() {
            return None;
        }
        let failed = self.failed_types.read();
        if failed.contains(config.type_id()) || failed.contains(&info.type_id) {
            return None;
        }
        Some(config)
    }

    /// Runtime record for a governed entity, reset when the table version moved.
    /// Ungoverned entities get no record.
    fn runtime(&self, entity: EntityId, now: Instant) -> Option<Arc<EntityRuntime>> {
        let table = self.current_table();
        let existing = self.runtimes.read().get(&entity).cloned();
        if let Some(runtime) = &existing {
            if runtime.state.read().version == table.version() {
                return existing;
            }
        }

        let info = self.host.world.entity(entity)?;
        let Some(config) = self.resolve(&info, &table) else {
            if existing.is_some() && self.runtimes.write().remove(&entity).is_some() {
                self.update_governed_gauge();
            }
            return None;
        };
        let cluster = self.host.world.cluster_of(entity).unwrap_or(entity);
        // Starts suppressed; the first refresh is due at once
        let state = DecisionState {
            version: table.version(),
            config,
            cluster,
            reason: None,
            next_due: now,
        };

        if let Some(runtime) = existing {
            {
                let mut current = runtime.state.write();
                if current.version != table.version() {
                    *current = state;
                    runtime.suppressed.store(true, Ordering::Release);
                }
            }
            return Some(runtime);
        }

        let runtime = Arc::new(EntityRuntime {
            id: entity,
            suppressed: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::default()),
            state: RwLock::new(state),
        });
        let runtime = self.runtimes.write().entry(entity).or_insert(runtime).clone();
        self.update_governed_gauge();
        Some(runtime)
    }

    /// Nearby cache for a cluster, reset when the table version moved
    fn cluster_nearby(&self, cluster: ClusterId, version: u64, now: Instant) -> Arc<ClusterNearby> {
        if let Some(nearby) = self.nearby.read().get(&cluster) {
            if nearby.state.read().version == version {
                return nearby.clone();
            }
        }
        let mut map = self.nearby.write();
        let nearby = map
            .entry(cluster)
            .or_insert_with(|| {
                Arc::new(ClusterNearby {
                    id: cluster,
                    in_flight: Arc::new(InFlight::default()),
                    state: RwLock::new(NearbyState {
                        version,
                        radius: 0.0,
                        entities: Vec::new(),
                        next_due: now,
                    }),
                })
            })
            .clone();
        {
            let mut state = nearby.state.write();
            if state.version != version {
                state.version = version;
                state.radius = 0.0;
                state.entities.clear();
                state.next_due = now;
            }
        }
        nearby
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Drop everything held for an entity. Called on destroy.
    pub fn on_entity_removed(&self, entity: EntityId) {
        let removed = self.runtimes.write().remove(&entity).is_some();
        self.nearby.write().remove(&entity);
        if removed {
            self.update_governed_gauge();
        }
    }

    /// Drop every listed entity; used when their cluster is concealed
    pub fn forget_entities(&self, entities: &[EntityId]) {
        {
            let mut runtimes = self.runtimes.write();
            for id in entities {
                runtimes.remove(id);
            }
        }
        {
            let mut nearby = self.nearby.write();
            for id in entities {
                nearby.remove(id);
            }
        }
        self.update_governed_gauge();
    }

    /// Drop a cluster's nearby cache
    pub fn forget_cluster(&self, cluster: ClusterId) {
        self.nearby.write().remove(&cluster);
    }

    fn update_governed_gauge(&self) {
        let count = self.runtimes.read().len() as u64;
        self.metrics.governed_entities.store(count, Ordering::Relaxed);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Cached decision for a governed entity
    pub fn decision(&self, entity: EntityId) -> Option<VisibilityDecision> {
        let runtime = self.runtimes.read().get(&entity).cloned()?;
        let state = runtime.state.read();
        Some(VisibilityDecision {
            suppressed: runtime.suppressed.load(Ordering::Acquire),
            reason: state.reason,
        })
    }

    /// Entities with a runtime record
    pub fn tracked_entities(&self) -> usize {
        self.runtimes.read().len()
    }

    /// Whether a cluster currently has a nearby cache
    pub fn has_nearby_cache(&self, cluster: ClusterId) -> bool {
        self.nearby.read().contains_key(&cluster)
    }

    /// Types whose veto could not be installed
    pub fn failed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.failed_types.read().iter().cloned().collect();
        types.sort_unstable();
        types
    }

    /// Wait for background refreshes to drain
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }
}
