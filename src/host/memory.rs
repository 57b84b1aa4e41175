//! In-process host implementation
//!
//! Keeps a flat entity table with a parent/child hierarchy and explicit
//! physical links between structures. Substrate calls only flip per-entity
//! flags, which makes detach/reattach observable from tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use smallvec::{smallvec, SmallVec};
use uuid::Uuid;

use crate::host::{
    AnchorInfo, ClusterId, ClusterSnapshot, EntityId, EntityInfo, EntityKind, FactionId,
    FactionRelation, FactionResolver, HookError, HostServices, IdentityId, InterceptionPoint,
    Observer, ObserverProvider, PlayerId, ProductionState, SimulationSubstrate, UpdatePhase,
    WorldView,
};
use crate::util::bounds::Aabb;
use crate::util::vec3::Vec3;

/// Type id given to structures spawned through `spawn_structure`
pub const STRUCTURE_TYPE: &str = "CubeGrid";

/// Type id given to characters spawned through `spawn_character`
pub const CHARACTER_TYPE: &str = "Character";

/// Half extent of a character's bounding cube
const CHARACTER_HALF_EXTENT: f64 = 1.0;

/// Substrate flags for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstrateState {
    pub in_broadphase: bool,
    pub motion_active: bool,
    pub updates_registered: bool,
    pub projections_enabled: bool,
    pub destroy_subscribed: bool,
}

impl Default for SubstrateState {
    fn default() -> Self {
        Self {
            in_broadphase: true,
            motion_active: true,
            updates_registered: true,
            projections_enabled: true,
            destroy_subscribed: false,
        }
    }
}

impl SubstrateState {
    /// Fully detached from simulation
    pub fn is_detached(&self) -> bool {
        !self.in_broadphase && !self.motion_active && !self.updates_registered
    }

    /// Fully attached to simulation
    pub fn is_attached(&self) -> bool {
        self.in_broadphase && self.motion_active && self.updates_registered
    }
}

struct EntityRecord {
    info: EntityInfo,
    children: Vec<EntityId>,
    /// Physical links to other structures (welds, connectors)
    links: SmallVec<[EntityId; 2]>,
    state: SubstrateState,
}

/// In-memory world implementing every host trait
pub struct MemoryWorld {
    entities: RwLock<HashMap<EntityId, EntityRecord>>,
    next_id: AtomicU64,
    observers: RwLock<Vec<Observer>>,
    factions: RwLock<HashMap<IdentityId, FactionId>>,
    relations: RwLock<HashMap<(FactionId, FactionId), FactionRelation>>,
    npcs: RwLock<HashSet<IdentityId>>,
    controlled: RwLock<HashSet<EntityId>>,
    hook_failures: RwLock<HashSet<String>>,
    installed_hooks: Mutex<Vec<String>>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
            factions: RwLock::new(HashMap::new()),
            relations: RwLock::new(HashMap::new()),
            npcs: RwLock::new(HashSet::new()),
            controlled: RwLock::new(HashSet::new()),
            hook_failures: RwLock::new(HashSet::new()),
            installed_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Bundle this world as every host collaborator at once
    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices {
            world: self.clone(),
            substrate: self.clone(),
            observers: self.clone(),
            factions: self.clone(),
        }
    }

    fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, info: EntityInfo) -> EntityId {
        let id = info.id;
        let parent = info.parent;
        let mut entities = self.entities.write();
        if let Some(parent) = parent.and_then(|p| entities.get_mut(&p)) {
            parent.children.push(id);
        }
        entities.insert(
            id,
            EntityRecord {
                info,
                children: Vec::new(),
                links: SmallVec::new(),
                state: SubstrateState::default(),
            },
        );
        id
    }

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    /// Spawn a top-level structure: a cube of `half_extent` around `position`
    pub fn spawn_structure(
        &self,
        name: &str,
        position: Vec3,
        half_extent: f64,
        owner: Option<IdentityId>,
    ) -> EntityId {
        let id = self.allocate_id();
        self.insert(EntityInfo {
            id,
            kind: EntityKind::Structure,
            name: name.to_string(),
            parent: None,
            position,
            bounds: Aabb::from_center(position, half_extent),
            owner,
            owners: owner.into_iter().collect(),
            type_id: STRUCTURE_TYPE.to_string(),
            subtype_id: String::new(),
            base_types: SmallVec::new(),
            production: ProductionState::NotProduction,
            keep_alive: false,
            is_static: false,
            anchor: None,
        })
    }

    /// Spawn a block under `parent`, sharing its position and owner
    pub fn spawn_block(&self, parent: EntityId, type_id: &str, subtype_id: &str) -> EntityId {
        let (position, bounds, owner) = {
            let entities = self.entities.read();
            match entities.get(&parent) {
                Some(p) => (p.info.position, p.info.bounds, p.info.owner),
                None => (Vec3::ZERO, Aabb::from_point(Vec3::ZERO), None),
            }
        };
        let id = self.allocate_id();
        self.insert(EntityInfo {
            id,
            kind: EntityKind::Block,
            name: format!("{}:{}", type_id, subtype_id),
            parent: Some(parent),
            position,
            bounds,
            owner,
            owners: owner.into_iter().collect(),
            type_id: type_id.to_string(),
            subtype_id: subtype_id.to_string(),
            base_types: SmallVec::new(),
            production: ProductionState::NotProduction,
            keep_alive: false,
            is_static: false,
            anchor: None,
        })
    }

    /// Spawn a character owned by `identity`
    pub fn spawn_character(&self, position: Vec3, identity: IdentityId) -> EntityId {
        let id = self.allocate_id();
        self.insert(EntityInfo {
            id,
            kind: EntityKind::Character,
            name: format!("Character {}", identity),
            parent: None,
            position,
            bounds: Aabb::from_center(position, CHARACTER_HALF_EXTENT),
            owner: Some(identity),
            owners: smallvec![identity],
            type_id: CHARACTER_TYPE.to_string(),
            subtype_id: String::new(),
            base_types: SmallVec::new(),
            production: ProductionState::NotProduction,
            keep_alive: false,
            is_static: false,
            anchor: None,
        })
    }

    /// Physically connect two structures into one cluster
    pub fn link(&self, a: EntityId, b: EntityId) {
        let mut entities = self.entities.write();
        if !entities.contains_key(&a) || !entities.contains_key(&b) || a == b {
            return;
        }
        if let Some(rec) = entities.get_mut(&a) {
            if !rec.links.contains(&b) {
                rec.links.push(b);
            }
        }
        if let Some(rec) = entities.get_mut(&b) {
            if !rec.links.contains(&a) {
                rec.links.push(a);
            }
        }
    }

    /// Move a top-level entity and everything under it
    pub fn set_position(&self, id: EntityId, position: Vec3) {
        let mut entities = self.entities.write();
        let delta = match entities.get(&id) {
            Some(rec) => position - rec.info.position,
            None => return,
        };
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(rec) = entities.get_mut(&current) {
                rec.info.position += delta;
                rec.info.bounds = Aabb::new(rec.info.bounds.min + delta, rec.info.bounds.max + delta);
                stack.extend(rec.children.iter().copied());
            }
        }
    }

    fn edit(&self, id: EntityId, f: impl FnOnce(&mut EntityInfo)) {
        if let Some(rec) = self.entities.write().get_mut(&id) {
            f(&mut rec.info);
        }
    }

    /// Add a secondary owner to a structure
    pub fn add_owner(&self, id: EntityId, owner: IdentityId) {
        self.edit(id, |info| {
            if !info.owners.contains(&owner) {
                info.owners.push(owner);
            }
        });
    }

    pub fn set_production(&self, id: EntityId, production: ProductionState) {
        self.edit(id, |info| info.production = production);
    }

    pub fn set_keep_alive(&self, id: EntityId, keep_alive: bool) {
        self.edit(id, |info| info.keep_alive = keep_alive);
    }

    pub fn set_anchor(&self, id: EntityId, anchor: Option<AnchorInfo>) {
        self.edit(id, |info| info.anchor = anchor);
    }

    pub fn set_static(&self, id: EntityId, is_static: bool) {
        self.edit(id, |info| info.is_static = is_static);
    }

    pub fn set_base_types(&self, id: EntityId, base_types: &[&str]) {
        self.edit(id, |info| {
            info.base_types = base_types.iter().map(|s| s.to_string()).collect();
        });
    }

    pub fn set_controlled(&self, id: EntityId, controlled: bool) {
        let mut set = self.controlled.write();
        if controlled {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    /// Remove an entity and its hierarchy.
    ///
    /// Returns the destroyed ids that had a destroy subscription; the caller
    /// forwards those to the concealment controller before anything else.
    pub fn destroy(&self, id: EntityId) -> Vec<EntityId> {
        let mut entities = self.entities.write();
        let mut notified = Vec::new();

        if let Some(parent) = entities.get(&id).and_then(|r| r.info.parent) {
            if let Some(p) = entities.get_mut(&parent) {
                p.children.retain(|c| *c != id);
            }
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(rec) = entities.remove(&current) {
                if rec.state.destroy_subscribed {
                    notified.push(current);
                }
                stack.extend(rec.children);
                for link in rec.links {
                    if let Some(other) = entities.get_mut(&link) {
                        other.links.retain(|l| *l != current);
                    }
                }
            }
        }
        self.controlled.write().remove(&id);
        notified
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.read().contains_key(&id)
    }

    /// Substrate flags of an entity
    pub fn state(&self, id: EntityId) -> Option<SubstrateState> {
        self.entities.read().get(&id).map(|r| r.state)
    }

    // ------------------------------------------------------------------
    // Observers and factions
    // ------------------------------------------------------------------

    pub fn add_observer(&self, identity: IdentityId, position: Vec3) -> PlayerId {
        let player = Uuid::new_v4();
        self.observers.write().push(Observer {
            player,
            identity,
            position,
        });
        player
    }

    pub fn observer(&self, player: PlayerId) -> Option<Observer> {
        self.observers.read().iter().find(|o| o.player == player).copied()
    }

    pub fn move_observer(&self, player: PlayerId, position: Vec3) {
        if let Some(o) = self.observers.write().iter_mut().find(|o| o.player == player) {
            o.position = position;
        }
    }

    pub fn set_faction(&self, identity: IdentityId, faction: FactionId) {
        self.factions.write().insert(identity, faction);
    }

    /// Declare the relation between two factions (symmetric)
    pub fn set_relation(&self, a: FactionId, b: FactionId, relation: FactionRelation) {
        let mut relations = self.relations.write();
        relations.insert((a, b), relation);
        relations.insert((b, a), relation);
    }

    pub fn mark_npc(&self, identity: IdentityId) {
        self.npcs.write().insert(identity);
    }

    /// Make hook installation fail for a type
    pub fn fail_hook_for(&self, type_id: &str) {
        self.hook_failures.write().insert(type_id.to_string());
    }

    /// Types the veto was installed for, in installation order
    pub fn installed_hooks(&self) -> Vec<String> {
        self.installed_hooks.lock().clone()
    }

    fn with_state(&self, id: EntityId, f: impl FnOnce(&mut SubstrateState)) {
        if let Some(rec) = self.entities.write().get_mut(&id) {
            f(&mut rec.state);
        }
    }

    /// Connected component of structures reachable from `start` through links
    fn component(entities: &HashMap<EntityId, EntityRecord>, start: EntityId) -> Vec<EntityId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut out = Vec::new();
        seen.insert(start);
        queue.push_back(start);
        while let Some(id) = queue.pop_front() {
            out.push(id);
            if let Some(rec) = entities.get(&id) {
                for link in &rec.links {
                    if seen.insert(*link) {
                        queue.push_back(*link);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn top_most(entities: &HashMap<EntityId, EntityRecord>, mut id: EntityId) -> Option<EntityId> {
        loop {
            let rec = entities.get(&id)?;
            match rec.info.parent {
                Some(parent) => id = parent,
                None => return Some(id),
            }
        }
    }
}

impl Default for MemoryWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldView for MemoryWorld {
    fn physical_clusters(&self) -> Vec<ClusterSnapshot> {
        let entities = self.entities.read();
        let mut roots: Vec<EntityId> = entities
            .values()
            .filter(|r| r.info.kind == EntityKind::Structure && r.info.parent.is_none())
            .map(|r| r.info.id)
            .collect();
        roots.sort_unstable();

        let mut assigned = HashSet::new();
        let mut clusters = Vec::new();
        for root in roots {
            if assigned.contains(&root) {
                continue;
            }
            let members = Self::component(&entities, root);
            assigned.extend(members.iter().copied());
            clusters.push(ClusterSnapshot {
                id: members[0],
                members: members.into_iter().collect(),
            });
        }
        clusters
    }

    fn entity(&self, id: EntityId) -> Option<EntityInfo> {
        self.entities.read().get(&id).map(|r| r.info.clone())
    }

    fn children(&self, id: EntityId) -> Vec<EntityId> {
        self.entities
            .read()
            .get(&id)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    fn entities_in_box(&self, bounds: &Aabb) -> Vec<EntityId> {
        self.entities
            .read()
            .values()
            .filter(|r| r.info.parent.is_none() && r.info.bounds.overlaps(bounds))
            .map(|r| r.info.id)
            .collect()
    }

    fn cluster_of(&self, id: EntityId) -> Option<ClusterId> {
        let entities = self.entities.read();
        let top = Self::top_most(&entities, id)?;
        if entities.get(&top)?.info.kind != EntityKind::Structure {
            return None;
        }
        Self::component(&entities, top).first().copied()
    }

    fn cluster_bounds(&self, id: ClusterId) -> Option<Aabb> {
        let entities = self.entities.read();
        let members = Self::component(&entities, id);
        let boxes: Vec<Aabb> = members
            .iter()
            .filter_map(|m| entities.get(m).map(|r| r.info.bounds))
            .collect();
        Aabb::enclosing(boxes.iter())
    }

    fn is_controlled(&self, id: EntityId) -> bool {
        self.controlled.read().contains(&id)
    }
}

impl SimulationSubstrate for MemoryWorld {
    fn add_to_broadphase(&self, id: EntityId) {
        self.with_state(id, |s| s.in_broadphase = true);
    }

    fn remove_from_broadphase(&self, id: EntityId) {
        self.with_state(id, |s| s.in_broadphase = false);
    }

    fn deactivate_motion(&self, id: EntityId) {
        self.with_state(id, |s| s.motion_active = false);
    }

    fn activate_motion(&self, id: EntityId, _dynamic: bool) {
        self.with_state(id, |s| s.motion_active = true);
    }

    fn register_updates(&self, id: EntityId) {
        self.with_state(id, |s| s.updates_registered = true);
    }

    fn unregister_updates(&self, id: EntityId) {
        self.with_state(id, |s| s.updates_registered = false);
    }

    fn suppress_projections(&self, id: EntityId) {
        self.with_state(id, |s| s.projections_enabled = false);
    }

    fn restore_projections(&self, id: EntityId) {
        self.with_state(id, |s| s.projections_enabled = true);
    }

    fn subscribe_destroy(&self, id: EntityId) {
        self.with_state(id, |s| s.destroy_subscribed = true);
    }

    fn unsubscribe_destroy(&self, id: EntityId) {
        self.with_state(id, |s| s.destroy_subscribed = false);
    }
}

impl ObserverProvider for MemoryWorld {
    fn observers(&self) -> Vec<Observer> {
        self.observers.read().clone()
    }
}

impl FactionResolver for MemoryWorld {
    fn faction_of(&self, identity: IdentityId) -> Option<FactionId> {
        self.factions.read().get(&identity).copied()
    }

    fn relation_between(&self, a: FactionId, b: FactionId) -> FactionRelation {
        self.relations
            .read()
            .get(&(a, b))
            .copied()
            .unwrap_or(FactionRelation::Enemies)
    }

    fn is_npc(&self, identity: IdentityId) -> bool {
        self.npcs.read().contains(&identity)
    }
}

impl InterceptionPoint for MemoryWorld {
    fn install(&self, type_id: &str, phases: &[UpdatePhase]) -> Result<usize, HookError> {
        if self.hook_failures.read().contains(type_id) {
            return Err(HookError::Unavailable {
                type_id: type_id.to_string(),
                reason: "no update dispatch found".to_string(),
            });
        }
        if phases.is_empty() {
            return Err(HookError::NoUpdatePhases(type_id.to_string()));
        }
        self.installed_hooks.lock().push(type_id.to_string());
        Ok(phases.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clusters_follow_links() {
        let world = MemoryWorld::new();
        let a = world.spawn_structure("A", Vec3::ZERO, 5.0, None);
        let b = world.spawn_structure("B", Vec3::new(8.0, 0.0, 0.0), 5.0, None);
        let c = world.spawn_structure("C", Vec3::new(500.0, 0.0, 0.0), 5.0, None);
        world.link(a, b);

        let clusters = world.physical_clusters();
        assert_eq!(clusters.len(), 2);
        let ab = clusters.iter().find(|c| c.id == a).unwrap();
        assert_eq!(ab.members.as_slice(), &[a, b]);
        assert!(clusters.iter().any(|cl| cl.id == c));
        assert_eq!(world.cluster_of(b), Some(a));
    }

    #[test]
    fn test_blocks_are_not_clusters() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 5.0, Some(3));
        let block = world.spawn_block(grid, "Refinery", "LargeRefinery");

        assert_eq!(world.physical_clusters().len(), 1);
        assert_eq!(world.cluster_of(block), Some(grid));
        assert_eq!(world.entity(block).unwrap().owner, Some(3));
    }

    #[test]
    fn test_set_position_moves_hierarchy() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 5.0, None);
        let block = world.spawn_block(grid, "Gyro", "Large");
        world.set_position(grid, Vec3::new(100.0, 0.0, 0.0));

        assert_eq!(world.entity(block).unwrap().position, Vec3::new(100.0, 0.0, 0.0));
        let bounds = world.entity(grid).unwrap().bounds;
        assert_eq!(bounds.center(), Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_entities_in_box_top_level_only() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 5.0, None);
        world.spawn_block(grid, "Gyro", "Large");
        let ch = world.spawn_character(Vec3::new(3.0, 0.0, 0.0), 9);
        world.spawn_character(Vec3::new(300.0, 0.0, 0.0), 10);

        let mut found = world.entities_in_box(&Aabb::from_center(Vec3::ZERO, 10.0));
        found.sort_unstable();
        assert_eq!(found, vec![grid, ch]);
    }

    #[test]
    fn test_destroy_reports_subscribed() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 5.0, None);
        let block = world.spawn_block(grid, "Gyro", "Large");
        world.subscribe_destroy(grid);

        let notified = world.destroy(grid);
        assert_eq!(notified, vec![grid]);
        assert!(!world.contains(grid));
        assert!(!world.contains(block));
    }

    #[test]
    fn test_substrate_flags() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 5.0, None);
        assert!(world.state(grid).unwrap().is_attached());

        world.remove_from_broadphase(grid);
        world.deactivate_motion(grid);
        world.unregister_updates(grid);
        assert!(world.state(grid).unwrap().is_detached());
    }

    #[test]
    fn test_faction_relation_default_enemies() {
        let world = MemoryWorld::new();
        world.set_relation(1, 2, FactionRelation::Neutral);
        assert_eq!(world.relation_between(2, 1), FactionRelation::Neutral);
        assert_eq!(world.relation_between(1, 3), FactionRelation::Enemies);
    }

    #[test]
    fn test_hook_install_failure() {
        let world = MemoryWorld::new();
        world.fail_hook_for("Beacon");
        assert!(world.install("Beacon", &UpdatePhase::ALL).is_err());
        assert_eq!(world.install("Turret", &UpdatePhase::ALL), Ok(6));
        assert_eq!(world.installed_hooks(), vec!["Turret".to_string()]);
    }
}
