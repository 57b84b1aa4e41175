//! Resolved dynamic visibility thresholds
//!
//! Rules from the settings are merged into one config per entity type and one
//! per (type, subtype). Subtype configs inherit any category they do not set
//! from their type's config. The table is immutable; a settings change builds
//! a new one.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::{DynamicVisibilityRule, VisibilityCategory};

/// Order in which categories are tested; the first match decides visibility
pub const CATEGORY_ORDER: [VisibilityCategory; 5] = [
    VisibilityCategory::HostileCharacters,
    VisibilityCategory::NeutralCharacters,
    VisibilityCategory::FriendlyCharacters,
    VisibilityCategory::HostileGrids,
    VisibilityCategory::NeutralGrids,
];

/// Prefix some type ids carry in serialized definitions
const TYPE_PREFIX: &str = "MyObjectBuilder_";

#[inline]
pub(crate) fn slot(category: VisibilityCategory) -> usize {
    match category {
        VisibilityCategory::HostileCharacters => 0,
        VisibilityCategory::NeutralCharacters => 1,
        VisibilityCategory::FriendlyCharacters => 2,
        VisibilityCategory::HostileGrids => 3,
        VisibilityCategory::NeutralGrids => 4,
    }
}

/// Type id without the serialization prefix
pub fn normalize_type_id(type_id: &str) -> &str {
    let trimmed = type_id.trim();
    trimmed.strip_prefix(TYPE_PREFIX).unwrap_or(trimmed)
}

/// Thresholds for one entity type or subtype
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicVisibilityConfig {
    type_id: String,
    /// Squared distances, indexed by `slot`
    thresholds: [Option<f64>; 5],
    /// Largest configured distance, not squared
    max_distance: f64,
}

impl DynamicVisibilityConfig {
    pub fn new(type_id: &str) -> Self {
        Self {
            type_id: type_id.to_string(),
            thresholds: [None; 5],
            max_distance: 0.0,
        }
    }

    /// Type this config was registered under
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Squared distance threshold for a category
    #[inline]
    pub fn threshold_sq(&self, category: VisibilityCategory) -> Option<f64> {
        self.thresholds[slot(category)]
    }

    /// Radius of the nearby scan needed to evaluate every category
    #[inline]
    pub fn max_distance(&self) -> f64 {
        self.max_distance
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.iter().all(Option::is_none)
    }

    /// Add a distance for a category; a larger existing distance wins
    pub fn merge(&mut self, category: VisibilityCategory, distance: f64) {
        let d = distance * distance;
        let entry = &mut self.thresholds[slot(category)];
        if entry.map_or(true, |current| current < d) {
            *entry = Some(d);
        }
        self.max_distance = self.max_distance.max(distance);
    }

    /// Take every category this config does not set from `base`
    pub fn inherit(&mut self, base: &DynamicVisibilityConfig) {
        for (mine, theirs) in self.thresholds.iter_mut().zip(base.thresholds.iter()) {
            if mine.is_none() {
                if let Some(d) = theirs {
                    *mine = Some(*d);
                    self.max_distance = self.max_distance.max(d.sqrt());
                }
            }
        }
    }
}

/// Every resolved config, tagged with a version that moves only when the rules do
#[derive(Debug, Default)]
pub struct VisibilityTable {
    version: u64,
    /// Rules the table was built from
    rules: Vec<DynamicVisibilityRule>,
    generic: FxHashMap<String, Arc<DynamicVisibilityConfig>>,
    specific: FxHashMap<(String, String), Arc<DynamicVisibilityConfig>>,
}

fn rule_is_valid(rule: &DynamicVisibilityRule) -> bool {
    let type_id = normalize_type_id(&rule.type_id);
    if type_id.is_empty() || !(rule.distance > 0.0 && rule.distance.is_finite()) {
        warn!(
            "Ignoring dynamic visibility rule {}/{} {:?} {}",
            rule.type_id,
            rule.subtype_id.as_deref().unwrap_or(""),
            rule.category,
            rule.distance
        );
        return false;
    }
    true
}

fn subtype_of(rule: &DynamicVisibilityRule) -> Option<&str> {
    rule.subtype_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

impl VisibilityTable {
    /// Build the table from raw rules. Invalid rules are skipped with a warning.
    pub fn build(version: u64, rules: &[DynamicVisibilityRule]) -> Self {
        let valid: Vec<&DynamicVisibilityRule> = rules.iter().filter(|r| rule_is_valid(r)).collect();

        let mut generic: FxHashMap<String, DynamicVisibilityConfig> = FxHashMap::default();
        for rule in valid.iter().filter(|r| subtype_of(r).is_none()) {
            let type_id = normalize_type_id(&rule.type_id);
            generic
                .entry(type_id.to_string())
                .or_insert_with(|| DynamicVisibilityConfig::new(type_id))
                .merge(rule.category, rule.distance);
            debug!("Registered visibility rule {} {:?} {}", type_id, rule.category, rule.distance);
        }

        let mut specific: FxHashMap<(String, String), DynamicVisibilityConfig> = FxHashMap::default();
        for rule in &valid {
            let Some(subtype) = subtype_of(rule) else {
                continue;
            };
            let type_id = normalize_type_id(&rule.type_id);
            specific
                .entry((type_id.to_string(), subtype.to_string()))
                .or_insert_with(|| DynamicVisibilityConfig::new(type_id))
                .merge(rule.category, rule.distance);
            debug!(
                "Registered visibility rule {}/{} {:?} {}",
                type_id, subtype, rule.category, rule.distance
            );
        }

        for ((type_id, _), config) in specific.iter_mut() {
            if let Some(base) = generic.get(type_id) {
                config.inherit(base);
            }
        }

        Self {
            version,
            rules: rules.to_vec(),
            generic: generic.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            specific: specific.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.generic.is_empty() && self.specific.is_empty()
    }

    /// Whether the table was built from exactly these rules
    pub fn built_from(&self, rules: &[DynamicVisibilityRule]) -> bool {
        self.rules == rules
    }

    /// Config for an entity: exact subtype, then its type, then each base type in order
    pub fn resolve<S: AsRef<str>>(
        &self,
        type_id: &str,
        subtype_id: &str,
        base_types: &[S],
    ) -> Option<Arc<DynamicVisibilityConfig>> {
        let type_id = normalize_type_id(type_id);
        if !subtype_id.is_empty() {
            if let Some(config) = self.specific.get(&(type_id.to_string(), subtype_id.to_string())) {
                return Some(config.clone());
            }
        }
        std::iter::once(type_id)
            .chain(base_types.iter().map(|b| normalize_type_id(b.as_ref())))
            .find_map(|t| self.generic.get(t).cloned())
    }

    /// Every type that needs the update veto installed, sorted
    pub fn governed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .generic
            .keys()
            .cloned()
            .chain(self.specific.keys().map(|(t, _)| t.clone()))
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use VisibilityCategory::*;

    fn rule(t: &str, s: Option<&str>, c: VisibilityCategory, d: f64) -> DynamicVisibilityRule {
        DynamicVisibilityRule::new(t, s, c, d)
    }

    const NO_BASES: [&str; 0] = [];

    #[test]
    fn test_thresholds_are_squared() {
        let table = VisibilityTable::build(1, &[rule("Turret", None, HostileCharacters, 100.0)]);
        let config = table.resolve("Turret", "", &NO_BASES).unwrap();
        assert_eq!(config.threshold_sq(HostileCharacters), Some(10_000.0));
        assert_eq!(config.threshold_sq(NeutralGrids), None);
        assert_eq!(config.max_distance(), 100.0);
    }

    #[test]
    fn test_duplicate_rules_keep_larger_distance() {
        let table = VisibilityTable::build(
            1,
            &[
                rule("Turret", None, HostileGrids, 300.0),
                rule("Turret", None, HostileGrids, 500.0),
                rule("Turret", None, HostileGrids, 200.0),
            ],
        );
        let config = table.resolve("Turret", "", &NO_BASES).unwrap();
        assert_eq!(config.threshold_sq(HostileGrids), Some(250_000.0));
    }

    #[test]
    fn test_subtype_inherits_generic_categories() {
        let table = VisibilityTable::build(
            1,
            &[
                rule("Turret", None, HostileCharacters, 800.0),
                rule("Turret", None, HostileGrids, 1500.0),
                rule("Turret", Some("Gatling"), HostileCharacters, 400.0),
            ],
        );
        let gatling = table.resolve("Turret", "Gatling", &NO_BASES).unwrap();
        assert_eq!(gatling.threshold_sq(HostileCharacters), Some(160_000.0));
        assert_eq!(gatling.threshold_sq(HostileGrids), Some(1500.0 * 1500.0));
        assert_eq!(gatling.max_distance(), 1500.0);

        let other = table.resolve("Turret", "Missile", &NO_BASES).unwrap();
        assert_eq!(other.threshold_sq(HostileCharacters), Some(640_000.0));
    }

    #[test]
    fn test_built_from_compares_rules() {
        let rules = vec![rule("Turret", None, HostileCharacters, 100.0)];
        let table = VisibilityTable::build(1, &rules);
        assert!(table.built_from(&rules));
        assert!(!table.built_from(&[rule("Turret", None, HostileCharacters, 120.0)]));
        assert!(!table.built_from(&[]));
    }

    #[test]
    fn test_invalid_rules_skipped() {
        let table = VisibilityTable::build(
            1,
            &[
                rule("Turret", None, HostileCharacters, 0.0),
                rule("Beacon", None, HostileCharacters, f64::NAN),
                rule("", None, HostileCharacters, 50.0),
                rule("Antenna", None, NeutralGrids, 50.0),
            ],
        );
        assert!(table.resolve("Turret", "", &NO_BASES).is_none());
        assert!(table.resolve("Beacon", "", &NO_BASES).is_none());
        assert!(table.resolve("Antenna", "", &NO_BASES).is_some());
        assert_eq!(table.governed_types(), vec!["Antenna".to_string()]);
    }

    #[test]
    fn test_resolve_falls_back_to_base_types() {
        let table = VisibilityTable::build(1, &[rule("FunctionalBlock", None, NeutralGrids, 250.0)]);
        assert!(table.resolve("Refinery", "LargeRefinery", &NO_BASES).is_none());
        let config = table
            .resolve("Refinery", "LargeRefinery", &["ProductionBlock", "FunctionalBlock"])
            .unwrap();
        assert_eq!(config.type_id(), "FunctionalBlock");
    }

    #[test]
    fn test_type_prefix_normalized() {
        let table = VisibilityTable::build(1, &[rule("MyObjectBuilder_Drill", None, NeutralGrids, 50.0)]);
        assert!(table.resolve("Drill", "", &NO_BASES).is_some());
        assert!(table.resolve("MyObjectBuilder_Drill", "", &NO_BASES).is_some());
    }

    #[test]
    fn test_category_order() {
        assert_eq!(CATEGORY_ORDER[0], HostileCharacters);
        assert_eq!(CATEGORY_ORDER[4], NeutralGrids);
        for (i, c) in CATEGORY_ORDER.iter().enumerate() {
            assert_eq!(slot(*c), i);
        }
    }
}
