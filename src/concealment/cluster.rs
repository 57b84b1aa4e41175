//! Entity clusters: the unit of concealment

use smallvec::SmallVec;

use crate::concealment::index::ProxyId;
use crate::host::{
    collect_hierarchy, AnchorInfo, ClusterId, ClusterSnapshot, EntityId, IdentityId, PlayerId,
    WorldView,
};
use crate::util::bounds::Aabb;

/// Concealment state of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Active,
    Concealed,
}

/// Respawn-relevant sub-component cached at conceal time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    MedicalRoom,
    CryoChamber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub entity: EntityId,
    pub kind: AnchorKind,
}

/// Connected group of physically linked structures sharing one concealment decision
#[derive(Debug, Clone)]
pub struct EntityCluster {
    id: ClusterId,
    members: SmallVec<[EntityId; 4]>,
    names: Vec<String>,
    bounds: Option<Aabb>,
    state: ClusterState,
    anchors: Vec<Anchor>,
    proxy: Option<ProxyId>,
    destroy_hooked: bool,
}

impl EntityCluster {
    /// Fresh, active cluster built from the current topology
    pub fn from_snapshot(snapshot: ClusterSnapshot, world: &dyn WorldView) -> Self {
        let mut names = Vec::with_capacity(snapshot.members.len());
        let mut boxes = Vec::with_capacity(snapshot.members.len());
        for info in snapshot.members.iter().filter_map(|m| world.entity(*m)) {
            names.push(info.name);
            boxes.push(info.bounds);
        }
        Self {
            id: snapshot.id,
            members: snapshot.members,
            names,
            bounds: Aabb::enclosing(boxes.iter()),
            state: ClusterState::Active,
            anchors: Vec::new(),
            proxy: None,
            destroy_hooked: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ClusterId {
        self.id
    }

    #[inline]
    pub fn members(&self) -> &[EntityId] {
        &self.members
    }

    #[inline]
    pub fn state(&self) -> ClusterState {
        self.state
    }

    #[inline]
    pub fn is_concealed(&self) -> bool {
        self.state == ClusterState::Concealed
    }

    /// Bounds as last computed; fixed while concealed
    #[inline]
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    #[inline]
    pub fn proxy(&self) -> Option<ProxyId> {
        self.proxy
    }

    #[inline]
    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    #[inline]
    pub fn is_destroy_hooked(&self) -> bool {
        self.destroy_hooked
    }

    /// Comma separated member names, for log lines
    pub fn display_names(&self) -> String {
        self.names.join(", ")
    }

    /// Recompute bounds from member boxes. Keeps the previous bounds when no
    /// member is still present.
    pub fn update_bounds(&mut self, world: &dyn WorldView) {
        let boxes: Vec<Aabb> = self
            .members
            .iter()
            .filter_map(|m| world.entity(*m))
            .map(|info| info.bounds)
            .collect();
        if let Some(b) = Aabb::enclosing(boxes.iter()) {
            self.bounds = Some(b);
        }
    }

    /// Cache every respawn anchor in the members' hierarchies
    pub fn cache_anchors(&mut self, world: &dyn WorldView) {
        self.anchors.clear();
        for member in &self.members {
            for id in collect_hierarchy(world, *member) {
                let kind = match world.entity(id).and_then(|info| info.anchor) {
                    Some(AnchorInfo::MedicalRoom { .. }) => AnchorKind::MedicalRoom,
                    Some(AnchorInfo::CryoChamber { .. }) => AnchorKind::CryoChamber,
                    None => continue,
                };
                self.anchors.push(Anchor { entity: id, kind });
            }
        }
    }

    /// Work done after detaching, off the actuation path
    pub fn prepare_concealed(&mut self, world: &dyn WorldView) {
        self.update_bounds(world);
        self.cache_anchors(world);
    }

    pub(crate) fn mark_concealed(&mut self, proxy: ProxyId) {
        self.state = ClusterState::Concealed;
        self.proxy = Some(proxy);
        self.destroy_hooked = true;
    }

    /// Back to active; returns the proxy to free
    pub(crate) fn mark_revealed(&mut self) -> Option<ProxyId> {
        self.state = ClusterState::Active;
        self.destroy_hooked = false;
        self.proxy.take()
    }

    /// Whether a working medical room in the cluster accepts `identity`
    pub fn is_medical_room_available(&self, world: &dyn WorldView, identity: IdentityId) -> bool {
        self.anchors
            .iter()
            .filter(|a| a.kind == AnchorKind::MedicalRoom)
            .filter_map(|a| world.entity(a.entity))
            .any(|info| match info.anchor {
                Some(AnchorInfo::MedicalRoom { access, working }) => working && access.contains(&identity),
                _ => false,
            })
    }

    /// Whether a cryo chamber in the cluster holds `player`
    pub fn is_cryo_occupied(&self, world: &dyn WorldView, player: PlayerId) -> bool {
        self.anchors
            .iter()
            .filter(|a| a.kind == AnchorKind::CryoChamber)
            .filter_map(|a| world.entity(a.entity))
            .any(|info| {
                matches!(info.anchor, Some(AnchorInfo::CryoChamber { occupant: Some(p) }) if p == player)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryWorld;
    use crate::util::vec3::Vec3;
    use smallvec::smallvec;
    use uuid::Uuid;

    fn cluster_for(world: &MemoryWorld, members: &[EntityId]) -> EntityCluster {
        EntityCluster::from_snapshot(
            ClusterSnapshot {
                id: members[0],
                members: members.iter().copied().collect(),
            },
            world,
        )
    }

    #[test]
    fn test_from_snapshot_bounds() {
        let world = MemoryWorld::new();
        let a = world.spawn_structure("A", Vec3::ZERO, 5.0, None);
        let b = world.spawn_structure("B", Vec3::new(20.0, 0.0, 0.0), 5.0, None);
        let cluster = cluster_for(&world, &[a, b]);

        let bounds = cluster.bounds().unwrap();
        assert_eq!(bounds.min, Vec3::new(-5.0, -5.0, -5.0));
        assert_eq!(bounds.max, Vec3::new(25.0, 5.0, 5.0));
        assert_eq!(cluster.display_names(), "A, B");
        assert_eq!(cluster.state(), ClusterState::Active);
    }

    #[test]
    fn test_cache_anchors() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Base", Vec3::ZERO, 10.0, Some(1));
        let med = world.spawn_block(grid, "MedicalRoom", "LargeMedicalRoom");
        let cryo = world.spawn_block(grid, "CryoChamber", "LargeCryo");
        world.spawn_block(grid, "Gyro", "Large");
        world.set_anchor(
            med,
            Some(AnchorInfo::MedicalRoom {
                access: smallvec![1],
                working: true,
            }),
        );
        world.set_anchor(cryo, Some(AnchorInfo::CryoChamber { occupant: None }));

        let mut cluster = cluster_for(&world, &[grid]);
        cluster.prepare_concealed(&world);
        assert_eq!(cluster.anchors().len(), 2);
        assert!(cluster.is_medical_room_available(&world, 1));
        assert!(!cluster.is_medical_room_available(&world, 2));
    }

    #[test]
    fn test_medical_room_must_be_working() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Base", Vec3::ZERO, 10.0, Some(1));
        let med = world.spawn_block(grid, "MedicalRoom", "LargeMedicalRoom");
        world.set_anchor(
            med,
            Some(AnchorInfo::MedicalRoom {
                access: smallvec![1],
                working: false,
            }),
        );
        let mut cluster = cluster_for(&world, &[grid]);
        cluster.cache_anchors(&world);
        assert!(!cluster.is_medical_room_available(&world, 1));
    }

    #[test]
    fn test_cryo_occupied() {
        let world = MemoryWorld::new();
        let player = Uuid::new_v4();
        let grid = world.spawn_structure("Base", Vec3::ZERO, 10.0, Some(1));
        let cryo = world.spawn_block(grid, "CryoChamber", "LargeCryo");
        world.set_anchor(cryo, Some(AnchorInfo::CryoChamber { occupant: Some(player) }));

        let mut cluster = cluster_for(&world, &[grid]);
        cluster.cache_anchors(&world);
        assert!(cluster.is_cryo_occupied(&world, player));
        assert!(!cluster.is_cryo_occupied(&world, Uuid::new_v4()));
    }

    #[test]
    fn test_mark_transitions() {
        let world = MemoryWorld::new();
        let grid = world.spawn_structure("Base", Vec3::ZERO, 10.0, None);
        let mut cluster = cluster_for(&world, &[grid]);

        let mut tree = crate::concealment::index::AabbTree::new(0.0);
        let proxy = tree.insert(cluster.bounds().unwrap(), cluster.id());
        cluster.mark_concealed(proxy);
        assert!(cluster.is_concealed());
        assert!(cluster.is_destroy_hooked());

        assert_eq!(cluster.mark_revealed(), Some(proxy));
        assert!(!cluster.is_concealed());
        assert_eq!(cluster.proxy(), None);
    }
}
