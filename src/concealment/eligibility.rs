//! Rules that keep a cluster simulated regardless of distance
//!
//! Evaluated on every scan and never cached: production state, keep-alive
//! timers and ownership all change between scans.

use rayon::prelude::*;

use crate::concealment::cluster::EntityCluster;
use crate::config::{ConcealmentSettings, ProductionPolicy};
use crate::host::{collect_hierarchy, EntityId, EntityInfo, HostServices, ProductionState};

/// Which rule kept a cluster simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    KeepAlive,
    NpcOwned,
    Producing,
    ExcludedSubtype,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExclusionReason::KeepAlive => "keep-alive timer pending",
            ExclusionReason::NpcOwned => "owned by an NPC identity",
            ExclusionReason::Producing => "production in progress",
            ExclusionReason::ExcludedSubtype => "contains an excluded subtype",
        };
        f.write_str(s)
    }
}

/// Whether any rule keeps `cluster` simulated
#[inline]
pub fn is_excluded(cluster: &EntityCluster, settings: &ConcealmentSettings, host: &HostServices) -> bool {
    exclusion_reason(cluster, settings, host).is_some()
}

/// A matching rule for `cluster`, checked member by member in parallel
pub fn exclusion_reason(
    cluster: &EntityCluster,
    settings: &ConcealmentSettings,
    host: &HostServices,
) -> Option<ExclusionReason> {
    cluster
        .members()
        .par_iter()
        .find_map_any(|member| member_exclusion(*member, settings, host))
}

fn member_exclusion(
    member: EntityId,
    settings: &ConcealmentSettings,
    host: &HostServices,
) -> Option<ExclusionReason> {
    let world = host.world.as_ref();
    let root = world.entity(member)?;

    if !settings.conceal_npc_owned && root.owners.iter().any(|o| host.factions.is_npc(*o)) {
        return Some(ExclusionReason::NpcOwned);
    }

    for id in collect_hierarchy(world, member) {
        let Some(info) = world.entity(id) else {
            continue;
        };
        if let Some(reason) = entity_exclusion(&info, settings) {
            return Some(reason);
        }
    }
    None
}

fn entity_exclusion(info: &EntityInfo, settings: &ConcealmentSettings) -> Option<ExclusionReason> {
    if settings.keep_alive_action && info.keep_alive {
        return Some(ExclusionReason::KeepAlive);
    }
    if settings.production_policy == ProductionPolicy::ExemptActive
        && info.production == ProductionState::Producing
    {
        return Some(ExclusionReason::Producing);
    }
    if !info.subtype_id.is_empty() && settings.is_subtype_excluded(&info.subtype_id) {
        return Some(ExclusionReason::ExcludedSubtype);
    }
    None
}
