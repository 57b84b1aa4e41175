//! Ownership relations between a governed entity and its neighbours

use crate::config::VisibilityCategory;
use crate::host::{EntityKind, FactionRelation, FactionResolver, IdentityId};

/// Relation of another owner to the governed entity's owner.
///
/// Variants are ordered by severity; `worst_relation` keeps the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Relation {
    NoOwnership,
    Owner,
    FactionShare,
    Neutral,
    Enemies,
}

/// Relation between two owners
pub fn classify_relation(
    factions: &dyn FactionResolver,
    a: Option<IdentityId>,
    b: Option<IdentityId>,
) -> Relation {
    if a == b {
        return Relation::Owner;
    }
    let (Some(a), Some(b)) = (a, b) else {
        return Relation::NoOwnership;
    };
    let (Some(fa), Some(fb)) = (factions.faction_of(a), factions.faction_of(b)) else {
        return Relation::Enemies;
    };
    if fa == fb {
        return Relation::FactionShare;
    }
    match factions.relation_between(fa, fb) {
        FactionRelation::Neutral => Relation::Neutral,
        FactionRelation::Enemies => Relation::Enemies,
    }
}

/// Worst relation between `subject` and any of `owners`.
///
/// No owners at all counts as `NoOwnership`.
pub fn worst_relation(
    factions: &dyn FactionResolver,
    subject: Option<IdentityId>,
    owners: &[IdentityId],
) -> Relation {
    owners
        .iter()
        .map(|o| classify_relation(factions, subject, Some(*o)))
        .max()
        .unwrap_or(Relation::NoOwnership)
}

/// Threshold category a neighbour falls into, `None` when it never reveals
pub fn category_for(kind: EntityKind, relation: Relation) -> Option<VisibilityCategory> {
    match kind {
        EntityKind::Character => Some(match relation {
            Relation::Owner | Relation::FactionShare => VisibilityCategory::FriendlyCharacters,
            Relation::Enemies => VisibilityCategory::HostileCharacters,
            Relation::Neutral | Relation::NoOwnership => VisibilityCategory::NeutralCharacters,
        }),
        EntityKind::Structure => match relation {
            Relation::Owner | Relation::FactionShare => None,
            Relation::Enemies => Some(VisibilityCategory::HostileGrids),
            Relation::Neutral | Relation::NoOwnership => Some(VisibilityCategory::NeutralGrids),
        },
        EntityKind::Block | EntityKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryWorld;

    fn world() -> MemoryWorld {
        let world = MemoryWorld::new();
        world.set_faction(1, 10);
        world.set_faction(2, 10);
        world.set_faction(3, 20);
        world.set_faction(4, 30);
        world.set_relation(10, 20, FactionRelation::Neutral);
        world.set_relation(10, 30, FactionRelation::Enemies);
        world
    }

    #[test]
    fn test_same_owner() {
        let w = world();
        assert_eq!(classify_relation(&w, Some(1), Some(1)), Relation::Owner);
        assert_eq!(classify_relation(&w, None, None), Relation::Owner);
    }

    #[test]
    fn test_unowned() {
        let w = world();
        assert_eq!(classify_relation(&w, Some(1), None), Relation::NoOwnership);
        assert_eq!(classify_relation(&w, None, Some(1)), Relation::NoOwnership);
    }

    #[test]
    fn test_shared_faction() {
        let w = world();
        assert_eq!(classify_relation(&w, Some(1), Some(2)), Relation::FactionShare);
    }

    #[test]
    fn test_declared_relations() {
        let w = world();
        assert_eq!(classify_relation(&w, Some(1), Some(3)), Relation::Neutral);
        assert_eq!(classify_relation(&w, Some(1), Some(4)), Relation::Enemies);
    }

    #[test]
    fn test_unresolvable_faction_is_enemy() {
        let w = world();
        assert_eq!(classify_relation(&w, Some(1), Some(77)), Relation::Enemies);
        assert_eq!(classify_relation(&w, Some(77), Some(78)), Relation::Enemies);
    }

    #[test]
    fn test_worst_relation_across_owners() {
        let w = world();
        assert_eq!(worst_relation(&w, Some(1), &[2, 3]), Relation::Neutral);
        assert_eq!(worst_relation(&w, Some(1), &[2, 4, 3]), Relation::Enemies);
        assert_eq!(worst_relation(&w, Some(1), &[]), Relation::NoOwnership);
    }

    #[test]
    fn test_category_mapping() {
        use VisibilityCategory::*;
        assert_eq!(category_for(EntityKind::Character, Relation::Owner), Some(FriendlyCharacters));
        assert_eq!(category_for(EntityKind::Character, Relation::Enemies), Some(HostileCharacters));
        assert_eq!(category_for(EntityKind::Character, Relation::NoOwnership), Some(NeutralCharacters));
        assert_eq!(category_for(EntityKind::Structure, Relation::FactionShare), None);
        assert_eq!(category_for(EntityKind::Structure, Relation::Enemies), Some(HostileGrids));
        assert_eq!(category_for(EntityKind::Structure, Relation::Neutral), Some(NeutralGrids));
        assert_eq!(category_for(EntityKind::Block, Relation::Enemies), None);
    }
}
