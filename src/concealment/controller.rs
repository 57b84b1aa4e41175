//! Concealment lifecycle
//!
//! Clusters far from every observer are detached from simulation and parked
//! in the spatial index; clusters an observer comes near are reattached.
//!
//! Invariant: a cluster is in the index if and only if it is tracked here as
//! concealed. Every path that conceals or reveals goes through
//! `conceal_batch` and `reveal_group`, which update both together.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use hashbrown::HashSet;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::concealment::cluster::EntityCluster;
use crate::concealment::eligibility;
use crate::concealment::index::ConcealmentIndex;
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::host::{collect_hierarchy, ClusterId, EntityId, HostServices, IdentityId, PlayerId};
use crate::metrics::Metrics;
use crate::util::vec3::Vec3;
#[cfg(feature = "dynamic_visibility")]
use crate::visibility::DynamicVisibilityManager;

/// Drives concealment from the simulation thread
pub struct ConcealmentController {
    host: HostServices,
    config: Arc<ConfigStore>,
    config_rx: Receiver<u64>,
    settings: Arc<ConfigSnapshot>,
    index: ConcealmentIndex,
    /// Concealed clusters by id
    tracked: FxHashMap<ClusterId, EntityCluster>,
    /// Top-level member to its concealed cluster
    member_index: FxHashMap<EntityId, ClusterId>,
    /// Clusters a settings change made ineligible, revealed on the next reveal pass
    pending_reveal: HashSet<ClusterId>,
    counter: u64,
    metrics: Arc<Metrics>,
    #[cfg(feature = "dynamic_visibility")]
    visibility: Option<Arc<DynamicVisibilityManager>>,
}

impl ConcealmentController {
    pub fn new(host: HostServices, config: Arc<ConfigStore>, metrics: Arc<Metrics>) -> Self {
        let config_rx = config.subscribe();
        let settings = config.snapshot();
        Self {
            host,
            config,
            config_rx,
            settings,
            index: ConcealmentIndex::new(),
            tracked: FxHashMap::default(),
            member_index: FxHashMap::default(),
            pending_reveal: HashSet::new(),
            counter: 0,
            metrics,
            #[cfg(feature = "dynamic_visibility")]
            visibility: None,
        }
    }

    /// Drop concealed members from the dynamic visibility tables
    #[cfg(feature = "dynamic_visibility")]
    pub fn with_visibility(mut self, manager: Arc<DynamicVisibilityManager>) -> Self {
        self.visibility = Some(manager);
        self
    }

    // ========================================================================
    // Driving loop
    // ========================================================================

    /// One simulation tick
    pub fn tick(&mut self) {
        self.counter = self.counter.wrapping_add(1);
        self.metrics.tick_count.fetch_add(1, Ordering::Relaxed);
        self.sync_settings();

        let snapshot = self.settings.clone();
        let settings = &snapshot.settings;
        if !settings.enabled {
            if !self.tracked.is_empty() {
                let count = self.reveal_all();
                info!("Concealment disabled, revealed {} entities", count);
            }
            return;
        }

        if self.counter % settings.conceal_interval == 0 {
            self.conceal_grids(settings.conceal_distance);
        }
        if self.counter % settings.reveal_interval == 0 {
            self.reveal_grids(settings.reveal_distance);
        }
    }

    /// Pick up published settings; queue clusters a rule change made ineligible
    fn sync_settings(&mut self) {
        let notified = self.config_rx.try_iter().count() > 0;
        if !notified && self.config.version() == self.settings.version {
            return;
        }
        let snapshot = self.config.snapshot();
        if snapshot.version == self.settings.version {
            return;
        }

        let previous = std::mem::replace(&mut self.settings, snapshot);
        info!("Concealment settings updated to v{}", self.settings.version);

        if previous.settings.exclusion_changed(&self.settings.settings) {
            let settings = &self.settings.settings;
            let host = &self.host;
            let excluded: Vec<ClusterId> = self
                .tracked
                .par_iter()
                .filter(|(_, cluster)| eligibility::is_excluded(cluster, settings, host))
                .map(|(id, _)| *id)
                .collect();
            if !excluded.is_empty() {
                debug!("{} concealed clusters no longer eligible, revealing on next pass", excluded.len());
            }
            self.pending_reveal.extend(excluded);
        }
    }

    // ========================================================================
    // Conceal
    // ========================================================================

    /// Conceal every eligible cluster farther than `distance` from all observers.
    /// Returns the number of top-level entities concealed.
    pub fn conceal_grids(&mut self, distance: f64) -> usize {
        let started = Instant::now();
        let spheres = self.host.observer_spheres(distance);
        let settings = self.settings.clone();
        let host = &self.host;
        let member_index = &self.member_index;
        let metrics = &self.metrics;

        let staged: Vec<EntityCluster> = host
            .world
            .physical_clusters()
            .into_par_iter()
            .filter(|snapshot| !snapshot.members.iter().any(|m| member_index.contains_key(m)))
            .filter_map(|snapshot| {
                let cluster = EntityCluster::from_snapshot(snapshot, host.world.as_ref());
                let bounds = cluster.bounds()?;
                if spheres.iter().any(|s| s.intersects(&bounds)) {
                    return None;
                }
                if let Some(reason) = eligibility::exclusion_reason(&cluster, &settings.settings, host) {
                    trace!("Not concealing {} ({}): {}", cluster.id(), cluster.display_names(), reason);
                    metrics.excluded_total.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(cluster)
            })
            .collect();

        let count = self.conceal_batch(staged);
        self.metrics.record_scan_time(started.elapsed());
        if count > 0 {
            info!("Concealed {} entities distant from observers", count);
        }
        count
    }

    /// Conceal one cluster. Returns 0 if any member is already concealed.
    pub fn conceal_group(&mut self, cluster: EntityCluster) -> usize {
        if cluster.members().iter().any(|m| self.member_index.contains_key(m)) {
            return 0;
        }
        self.conceal_batch(vec![cluster])
    }

    /// Detach, index and track a staged batch. Actuation is serial; bounds and
    /// anchor caching run in parallel before anything becomes visible in the index.
    fn conceal_batch(&mut self, mut staged: Vec<EntityCluster>) -> usize {
        staged.retain(|c| c.bounds().is_some() && !c.members().is_empty());
        if staged.is_empty() {
            return 0;
        }

        let mut detached = Vec::new();
        for cluster in &staged {
            self.detach(cluster, &mut detached);
        }

        let world = self.host.world.as_ref();
        staged.par_iter_mut().for_each(|cluster| cluster.prepare_concealed(world));

        let mut count = 0;
        for mut cluster in staged {
            let Some(bounds) = cluster.bounds() else {
                continue;
            };
            let proxy = self.index.insert(cluster.id(), bounds);
            cluster.mark_concealed(proxy);
            for member in cluster.members() {
                self.host.substrate.subscribe_destroy(*member);
                self.member_index.insert(*member, cluster.id());
            }
            debug!("Concealed cluster {} ({})", cluster.id(), cluster.display_names());
            count += cluster.members().len();
            self.tracked.insert(cluster.id(), cluster);
            self.metrics.conceals_total.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "dynamic_visibility")]
        if let Some(visibility) = &self.visibility {
            visibility.forget_entities(&detached);
        }

        self.update_gauges();
        count
    }

    /// Remove a cluster from simulation. Appends every detached entity id.
    fn detach(&self, cluster: &EntityCluster, detached: &mut Vec<EntityId>) {
        let world = self.host.world.as_ref();
        let substrate = self.host.substrate.as_ref();
        for member in cluster.members() {
            substrate.remove_from_broadphase(*member);
            substrate.deactivate_motion(*member);
            let hierarchy = collect_hierarchy(world, *member);
            for id in &hierarchy {
                substrate.unregister_updates(*id);
            }
            substrate.suppress_projections(*member);
            detached.extend(hierarchy);
        }
    }

    /// Put a cluster back into simulation. Members gone from the world are skipped.
    fn reattach(&self, cluster: &EntityCluster) {
        let world = self.host.world.as_ref();
        let substrate = self.host.substrate.as_ref();
        for member in cluster.members() {
            let Some(info) = world.entity(*member) else {
                continue;
            };
            substrate.add_to_broadphase(*member);
            if !info.is_static {
                substrate.activate_motion(*member, true);
            }
            for id in collect_hierarchy(world, *member) {
                substrate.register_updates(id);
            }
            substrate.restore_projections(*member);
        }
    }

    // ========================================================================
    // Reveal
    // ========================================================================

    /// Reveal concealed clusters within `distance` of any observer, plus any
    /// queued by a settings change. Returns the number of entities revealed.
    pub fn reveal_grids(&mut self, distance: f64) -> usize {
        let mut hits: Vec<ClusterId> = self
            .host
            .observers
            .observers()
            .iter()
            .flat_map(|o| self.index.query_sphere(o.position, distance))
            .collect();
        hits.extend(self.pending_reveal.drain());
        hits.sort_unstable();
        hits.dedup();

        let count: usize = hits.into_iter().map(|id| self.reveal_if_concealed(id)).sum();
        if count > 0 {
            info!("Revealed {} entities near observers", count);
        }
        count
    }

    /// Reveal concealed clusters intersecting a sphere
    pub fn reveal_in_sphere(&mut self, center: Vec3, radius: f64) -> usize {
        let mut hits = self.index.query_sphere(center, radius);
        hits.sort_unstable();
        hits.dedup();
        hits.into_iter().map(|id| self.reveal_if_concealed(id)).sum()
    }

    /// Reveal every concealed cluster
    pub fn reveal_all(&mut self) -> usize {
        let ids: Vec<ClusterId> = self.tracked.keys().copied().collect();
        let count: usize = ids.into_iter().map(|id| self.reveal_if_concealed(id)).sum();
        if count > 0 {
            info!("Revealed all {} concealed entities", count);
        }
        count
    }

    /// Reveal one cluster. Warns and returns 0 when it is not concealed.
    pub fn reveal_group(&mut self, id: ClusterId) -> usize {
        if !self.tracked.contains_key(&id) {
            warn!("Cluster {} is not concealed, nothing to reveal", id);
            return 0;
        }
        self.reveal_if_concealed(id)
    }

    fn reveal_if_concealed(&mut self, id: ClusterId) -> usize {
        let Some(mut cluster) = self.tracked.remove(&id) else {
            return 0;
        };
        self.pending_reveal.remove(&id);

        if let Some(proxy) = cluster.mark_revealed() {
            if let Err(e) = self.index.remove(proxy) {
                warn!("Cluster {} had a stale index entry: {}", id, e);
            }
        }
        for member in cluster.members() {
            self.host.substrate.unsubscribe_destroy(*member);
            self.member_index.remove(member);
        }
        self.reattach(&cluster);

        debug!("Revealed cluster {} ({})", id, cluster.display_names());
        self.metrics.reveals_total.fetch_add(1, Ordering::Relaxed);
        self.update_gauges();
        cluster.members().len()
    }

    /// Destroy notification for a top-level entity. Reveals its concealed
    /// cluster before returning so no index entry outlives the entity.
    pub fn on_entity_destroyed(&mut self, entity: EntityId) -> usize {
        let Some(cluster) = self.member_index.get(&entity).copied() else {
            return 0;
        };
        debug!("Entity {} destroyed while concealed, revealing cluster {}", entity, cluster);
        self.metrics.forced_reveals.fetch_add(1, Ordering::Relaxed);
        self.reveal_if_concealed(cluster)
    }

    /// Reveal clusters holding a working medical room `identity` can respawn at
    pub fn reveal_spawns(&mut self, identity: IdentityId) -> usize {
        let world = self.host.world.as_ref();
        let ids: Vec<ClusterId> = self
            .tracked
            .values()
            .filter(|c| c.is_medical_room_available(world, identity))
            .map(EntityCluster::id)
            .collect();
        let count: usize = ids.into_iter().map(|id| self.reveal_if_concealed(id)).sum();
        if count > 0 {
            debug!("Revealed {} entities with spawn points for identity {}", count, identity);
        }
        count
    }

    /// Reveal the cluster whose cryo chamber holds a joining player
    pub fn reveal_cryo_pod(&mut self, player: PlayerId) -> usize {
        let world = self.host.world.as_ref();
        let found = self
            .tracked
            .values()
            .find(|c| c.is_cryo_occupied(world, player))
            .map(EntityCluster::id);
        match found {
            Some(id) => {
                debug!("Revealing cluster {} for cryo occupant {}", id, player);
                self.reveal_if_concealed(id)
            }
            None => 0,
        }
    }

    /// A client asked for `entity` right away; reveal its cluster if concealed
    pub fn reveal_for_request(&mut self, entity: EntityId) -> usize {
        let Some(cluster) = self.concealed_cluster_of(entity) else {
            return 0;
        };
        self.reveal_if_concealed(cluster)
    }

    /// Reveal and stop tracking everything
    pub fn shutdown(&mut self) -> usize {
        let count = self.reveal_all();
        #[cfg(feature = "dynamic_visibility")]
        if let Some(visibility) = &self.visibility {
            visibility.wait_idle(std::time::Duration::from_secs(5));
        }
        info!("Concealment shut down, revealed {} entities", count);
        count
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Append every concealed top-level entity
    pub fn get_concealed_entities(&self, out: &mut Vec<EntityId>) {
        for cluster in self.tracked.values() {
            out.extend_from_slice(cluster.members());
        }
    }

    /// Whether an exclusion rule keeps `cluster` simulated under current settings
    pub fn is_excluded(&self, cluster: &EntityCluster) -> bool {
        eligibility::is_excluded(cluster, &self.settings.settings, &self.host)
    }

    /// Whether the entity, or the structure it belongs to, is concealed
    pub fn is_concealed(&self, entity: EntityId) -> bool {
        self.concealed_cluster_of(entity).is_some()
    }

    /// Remove concealed entities from a target list
    pub fn filter_concealed(&self, targets: &mut Vec<EntityId>) {
        targets.retain(|id| !self.is_concealed(*id));
    }

    /// Ids of every concealed cluster, sorted
    pub fn concealed_clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.tracked.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn concealed_cluster(&self, id: ClusterId) -> Option<&EntityCluster> {
        self.tracked.get(&id)
    }

    #[inline]
    pub fn index(&self) -> &ConcealmentIndex {
        &self.index
    }

    /// Clusters queued for reveal by a settings change
    pub fn pending_reveals(&self) -> usize {
        self.pending_reveal.len()
    }

    fn concealed_cluster_of(&self, entity: EntityId) -> Option<ClusterId> {
        let world = self.host.world.as_ref();
        let mut current = entity;
        // Walk up to the top-level entity
        loop {
            if let Some(cluster) = self.member_index.get(&current) {
                return Some(*cluster);
            }
            current = world.entity(current)?.parent?;
        }
    }

    fn update_gauges(&self) {
        let entities: usize = self.tracked.values().map(|c| c.members().len()).sum();
        self.metrics
            .concealed_clusters
            .store(self.tracked.len() as u64, Ordering::Relaxed);
        self.metrics
            .concealed_entities
            .store(entities as u64, Ordering::Relaxed);
    }
}
