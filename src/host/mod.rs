//! Host engine capabilities consumed by the concealment core
//!
//! The core never talks to an engine directly. Everything it needs to read
//! (topology, entity state, observers, factions) and everything it needs to
//! actuate (broadphase, motion, update hooks) goes through these traits. The
//! host integration layer implements them; `memory::MemoryWorld` is a complete
//! in-process implementation used by the binary, tests and benchmarks.

pub mod memory;

use smallvec::SmallVec;
use uuid::Uuid;

use crate::util::bounds::{Aabb, Sphere};
use crate::util::vec3::Vec3;

/// Stable engine entity id
pub type EntityId = u64;

/// Cluster id: entity id of the cluster's root member
pub type ClusterId = u64;

/// Player identity that can own entities
pub type IdentityId = u64;

pub type FactionId = u32;

/// Connected player
pub type PlayerId = Uuid;

/// Broad classification of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Top-level physical structure (a grid); clusters are made of these
    Structure,
    /// Functional sub-component of a structure (a block)
    Block,
    /// Player or NPC character
    Character,
    Other,
}

/// Production state of a production-type block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionState {
    NotProduction,
    Idle,
    Producing,
}

/// Respawn-relevant sub-component data
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorInfo {
    /// Respawn point usable by the listed identities
    MedicalRoom {
        access: SmallVec<[IdentityId; 4]>,
        working: bool,
    },
    /// Cryo chamber, possibly holding a disconnected player
    CryoChamber { occupant: Option<PlayerId> },
}

/// Point-in-time view of one entity
#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// Parent in the entity hierarchy, `None` for top-level entities
    pub parent: Option<EntityId>,
    pub position: Vec3,
    pub bounds: Aabb,
    /// Primary owner, `None` when unowned
    pub owner: Option<IdentityId>,
    /// Every identity owning part of a structure
    pub owners: SmallVec<[IdentityId; 4]>,
    /// Definition type id, e.g. `LargeGatlingTurret`
    pub type_id: String,
    pub subtype_id: String,
    /// Base type ids, nearest first, consulted when no config exists for `type_id`
    pub base_types: SmallVec<[String; 2]>,
    pub production: ProductionState,
    /// A scripted action asked for this entity to keep simulating
    pub keep_alive: bool,
    /// Static structures never get their motion reactivated
    pub is_static: bool,
    pub anchor: Option<AnchorInfo>,
}

/// Physical cluster as currently present in the engine topology
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub id: ClusterId,
    pub members: SmallVec<[EntityId; 4]>,
}

/// Live observer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observer {
    pub player: PlayerId,
    pub identity: IdentityId,
    pub position: Vec3,
}

/// Declared relation between two factions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactionRelation {
    Neutral,
    Enemies,
}

/// Read access to engine topology and entity state. Safe to call from workers.
pub trait WorldView: Send + Sync {
    /// Every physical cluster currently in the world
    fn physical_clusters(&self) -> Vec<ClusterSnapshot>;

    fn entity(&self, id: EntityId) -> Option<EntityInfo>;

    /// Direct children of an entity in the hierarchy
    fn children(&self, id: EntityId) -> Vec<EntityId>;

    /// Top-level entities whose bounds overlap `bounds`
    fn entities_in_box(&self, bounds: &Aabb) -> Vec<EntityId>;

    /// Cluster containing an entity (through its top-most parent)
    fn cluster_of(&self, id: EntityId) -> Option<ClusterId>;

    /// Live bounds of a cluster
    fn cluster_bounds(&self, id: ClusterId) -> Option<Aabb>;

    /// Whether a live observer is actively controlling the entity
    fn is_controlled(&self, id: EntityId) -> bool;
}

/// Engine actuation used to detach and reattach clusters.
///
/// Calls are made serially from the simulation thread only.
pub trait SimulationSubstrate: Send + Sync {
    fn add_to_broadphase(&self, id: EntityId);
    fn remove_from_broadphase(&self, id: EntityId);

    /// Zero velocities, put bodies to sleep and freeze them
    fn deactivate_motion(&self, id: EntityId);
    /// Wake bodies; `dynamic` restores a movable motion type
    fn activate_motion(&self, id: EntityId, dynamic: bool);

    /// Register one entity (not its children) for per-tick updates
    fn register_updates(&self, id: EntityId);
    fn unregister_updates(&self, id: EntityId);

    /// Disable projection side effects owned by the entity's hierarchy
    fn suppress_projections(&self, id: EntityId);
    fn restore_projections(&self, id: EntityId);

    /// Ask for destroy notifications for the entity
    fn subscribe_destroy(&self, id: EntityId);
    fn unsubscribe_destroy(&self, id: EntityId);
}

/// Live observer positions
pub trait ObserverProvider: Send + Sync {
    fn observers(&self) -> Vec<Observer>;
}

/// Ownership and faction lookups
pub trait FactionResolver: Send + Sync {
    fn faction_of(&self, identity: IdentityId) -> Option<FactionId>;
    fn relation_between(&self, a: FactionId, b: FactionId) -> FactionRelation;
    /// NPC/environment identities form the protected owner category
    fn is_npc(&self, identity: IdentityId) -> bool;
}

/// Update phases the host can veto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdatePhase {
    BeforeSimulation,
    BeforeSimulation10,
    BeforeSimulation100,
    AfterSimulation,
    AfterSimulation10,
    AfterSimulation100,
}

impl UpdatePhase {
    pub const ALL: [UpdatePhase; 6] = [
        UpdatePhase::BeforeSimulation,
        UpdatePhase::BeforeSimulation10,
        UpdatePhase::BeforeSimulation100,
        UpdatePhase::AfterSimulation,
        UpdatePhase::AfterSimulation10,
        UpdatePhase::AfterSimulation100,
    ];
}

/// Verdict of the before-update veto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    PassThrough,
    Suppress,
}

/// Install point for the before-update veto
pub trait InterceptionPoint: Send + Sync {
    /// Route the given entity type's update phases through the veto
    fn install(&self, type_id: &str, phases: &[UpdatePhase]) -> Result<usize, HookError>;
}

/// Failure to install the update veto for a type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("Unable to determine entity type of {0}")]
    UnknownType(String),
    #[error("Type {0} has no interceptable update phases")]
    NoUpdatePhases(String),
    #[error("Interception unavailable for {type_id}: {reason}")]
    Unavailable { type_id: String, reason: String },
}

/// Every collaborator the controller needs, bundled
#[derive(Clone)]
pub struct HostServices {
    pub world: std::sync::Arc<dyn WorldView>,
    pub substrate: std::sync::Arc<dyn SimulationSubstrate>,
    pub observers: std::sync::Arc<dyn ObserverProvider>,
    pub factions: std::sync::Arc<dyn FactionResolver>,
}

impl HostServices {
    /// Spheres of `radius` around every live observer
    pub fn observer_spheres(&self, radius: f64) -> Vec<Sphere> {
        self.observers
            .observers()
            .into_iter()
            .map(|o| Sphere::new(o.position, radius))
            .collect()
    }
}

/// Every entity in the hierarchy below and including `root`, parents first.
///
/// Iterative so deep hierarchies cannot overflow the stack.
pub fn collect_hierarchy(world: &dyn WorldView, root: EntityId) -> Vec<EntityId> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        out.push(id);
        let children = world.children(id);
        // Reverse so children are visited in declaration order
        stack.extend(children.into_iter().rev());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryWorld;

    #[test]
    fn test_collect_hierarchy_order() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Ship", Vec3::ZERO, 10.0, Some(1));
        let a = world.spawn_block(grid, "Refinery", "LargeRefinery");
        let b = world.spawn_block(grid, "Assembler", "LargeAssembler");
        let sub = world.spawn_block(a, "Conveyor", "Small");

        let all = collect_hierarchy(&world, grid);
        assert_eq!(all, vec![grid, a, sub, b]);
    }

    #[test]
    fn test_collect_hierarchy_leaf() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Lone", Vec3::ZERO, 5.0, None);
        assert_eq!(collect_hierarchy(&world, grid), vec![grid]);
    }

    #[test]
    fn test_observer_spheres() {
        let world = std::sync::Arc::new(MemoryWorld::new());
        world.add_observer(7, Vec3::new(10.0, 0.0, 0.0));
        let host = world.services();
        let spheres = host.observer_spheres(250.0);
        assert_eq!(spheres.len(), 1);
        assert_eq!(spheres[0].radius, 250.0);
        assert_eq!(spheres[0].center, Vec3::new(10.0, 0.0, 0.0));
    }
}
