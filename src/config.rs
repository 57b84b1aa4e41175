//! Concealment settings and the versioned store they are published through
//!
//! Settings are immutable once published. Every `ConfigStore::update` swaps in
//! a new `Arc` snapshot and bumps a monotonic version; consumers compare their
//! cached version and recompute lazily.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Relation category a dynamic visibility threshold applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityCategory {
    HostileCharacters,
    NeutralCharacters,
    FriendlyCharacters,
    HostileGrids,
    NeutralGrids,
}

/// How active production affects concealment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionPolicy {
    /// Clusters with a member actively producing stay simulated
    ExemptActive,
    /// Production state is ignored
    ConcealAll,
}

/// One dynamic visibility threshold entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicVisibilityRule {
    /// Entity type id, with or without the `MyObjectBuilder_` prefix
    pub type_id: String,
    /// Subtype to target, `None` targets every subtype of the type
    #[serde(default)]
    pub subtype_id: Option<String>,
    pub category: VisibilityCategory,
    /// Distance (not squared) inside which the category keeps the entity visible
    pub distance: f64,
}

impl DynamicVisibilityRule {
    pub fn new(type_id: &str, subtype_id: Option<&str>, category: VisibilityCategory, distance: f64) -> Self {
        Self {
            type_id: type_id.to_string(),
            subtype_id: subtype_id.map(str::to_string),
            category,
            distance,
        }
    }
}

/// Concealment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcealmentSettings {
    /// Master switch. Disabling reveals everything on the next tick.
    pub enabled: bool,
    /// Clusters farther than this from every observer are concealed
    pub conceal_distance: f64,
    /// Ticks between conceal passes
    pub conceal_interval: u64,
    /// Concealed clusters within this distance of an observer are revealed
    pub reveal_distance: f64,
    /// Ticks between reveal passes
    pub reveal_interval: u64,
    pub production_policy: ProductionPolicy,
    /// Allow concealing clusters owned by NPC identities
    pub conceal_npc_owned: bool,
    /// Honour keep-alive timers requested by scripted actions
    pub keep_alive_action: bool,
    /// Clusters containing any of these subtypes are never concealed
    pub excluded_subtypes: Vec<String>,
    pub dynamic_rules: Vec<DynamicVisibilityRule>,
    /// Seconds before a cluster's nearby-entity list is rebuilt
    pub rebuild_nearby_secs: f64,
    /// Seconds before an entity's visibility decision is recomputed
    pub rebuild_decision_secs: f64,
    /// Seconds between refresh staggering passes
    pub rebalance_secs: f64,
    /// Background refresh worker threads
    pub worker_threads: usize,
}

impl Default for ConcealmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            conceal_distance: 75_000.0,
            conceal_interval: 3600,
            reveal_distance: 50_000.0,
            reveal_interval: 60,
            production_policy: ProductionPolicy::ExemptActive,
            conceal_npc_owned: false,
            keep_alive_action: false,
            excluded_subtypes: Vec::new(),
            dynamic_rules: Vec::new(),
            rebuild_nearby_secs: 15.0,
            rebuild_decision_secs: 10.0,
            rebalance_secs: 60.0,
            worker_threads: 2,
        }
    }
}

impl ConcealmentSettings {
    /// Load settings from the process environment or use defaults
    pub fn load_or_default() -> Self {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup. Bad values keep the default.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("CONCEAL_ENABLED") {
            match v.parse::<bool>() {
                Ok(parsed) => config.enabled = parsed,
                Err(_) => tracing::warn!("Invalid CONCEAL_ENABLED '{}', using default", v),
            }
        }

        if let Some(v) = lookup("CONCEAL_DISTANCE") {
            match v.parse::<f64>() {
                Ok(parsed) if parsed > 0.0 && parsed.is_finite() => config.conceal_distance = parsed,
                _ => tracing::warn!("Invalid CONCEAL_DISTANCE '{}', using default", v),
            }
        }

        if let Some(v) = lookup("CONCEAL_INTERVAL") {
            match v.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.conceal_interval = parsed,
                _ => tracing::warn!("CONCEAL_INTERVAL must be > 0, got '{}', using default", v),
            }
        }

        if let Some(v) = lookup("REVEAL_DISTANCE") {
            match v.parse::<f64>() {
                Ok(parsed) if parsed > 0.0 && parsed.is_finite() => config.reveal_distance = parsed,
                _ => tracing::warn!("Invalid REVEAL_DISTANCE '{}', using default", v),
            }
        }

        if let Some(v) = lookup("REVEAL_INTERVAL") {
            match v.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.reveal_interval = parsed,
                _ => tracing::warn!("REVEAL_INTERVAL must be > 0, got '{}', using default", v),
            }
        }

        if let Some(v) = lookup("CONCEAL_PRODUCTION_POLICY") {
            match v.trim() {
                "exempt_active" => config.production_policy = ProductionPolicy::ExemptActive,
                "conceal_all" => config.production_policy = ProductionPolicy::ConcealAll,
                _ => tracing::warn!("Invalid CONCEAL_PRODUCTION_POLICY '{}', using default", v),
            }
        }

        if let Some(v) = lookup("CONCEAL_NPC_OWNED") {
            match v.parse::<bool>() {
                Ok(parsed) => config.conceal_npc_owned = parsed,
                Err(_) => tracing::warn!("Invalid CONCEAL_NPC_OWNED '{}', using default", v),
            }
        }

        if let Some(v) = lookup("KEEP_ALIVE_ACTION") {
            match v.parse::<bool>() {
                Ok(parsed) => config.keep_alive_action = parsed,
                Err(_) => tracing::warn!("Invalid KEEP_ALIVE_ACTION '{}', using default", v),
            }
        }

        if let Some(v) = lookup("EXCLUDED_SUBTYPES") {
            config.excluded_subtypes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(v) = lookup("DYNAMIC_VISIBILITY_RULES") {
            match serde_json::from_str::<Vec<DynamicVisibilityRule>>(&v) {
                Ok(rules) => config.dynamic_rules = rules,
                Err(e) => tracing::warn!("Invalid DYNAMIC_VISIBILITY_RULES: {}, using default", e),
            }
        }

        if let Some(v) = lookup("VISIBILITY_WORKERS") {
            match v.parse::<usize>() {
                Ok(parsed) if (1..=16).contains(&parsed) => config.worker_threads = parsed,
                _ => tracing::warn!("VISIBILITY_WORKERS must be 1-16, got '{}', using default", v),
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.conceal_distance > 0.0 && self.conceal_distance.is_finite()) {
            return Err(ConfigError::InvalidDistance("conceal_distance", self.conceal_distance));
        }
        if !(self.reveal_distance > 0.0 && self.reveal_distance.is_finite()) {
            return Err(ConfigError::InvalidDistance("reveal_distance", self.reveal_distance));
        }
        if self.reveal_distance > self.conceal_distance {
            return Err(ConfigError::RevealBeyondConceal {
                reveal: self.reveal_distance,
                conceal: self.conceal_distance,
            });
        }
        if self.conceal_interval == 0 {
            return Err(ConfigError::ZeroInterval("conceal_interval"));
        }
        if self.reveal_interval == 0 {
            return Err(ConfigError::ZeroInterval("reveal_interval"));
        }
        for (name, secs) in [
            ("rebuild_nearby_secs", self.rebuild_nearby_secs),
            ("rebuild_decision_secs", self.rebuild_decision_secs),
            ("rebalance_secs", self.rebalance_secs),
        ] {
            if !(secs > 0.0 && secs.is_finite()) {
                return Err(ConfigError::InvalidWindow(name, secs));
            }
        }
        if self.worker_threads == 0 || self.worker_threads > 16 {
            return Err(ConfigError::WorkerThreads(self.worker_threads));
        }
        Ok(())
    }

    pub fn rebuild_nearby(&self) -> Duration {
        Duration::from_secs_f64(self.rebuild_nearby_secs)
    }

    pub fn rebuild_decision(&self) -> Duration {
        Duration::from_secs_f64(self.rebuild_decision_secs)
    }

    pub fn rebalance(&self) -> Duration {
        Duration::from_secs_f64(self.rebalance_secs)
    }

    /// Whether a change from `self` to `other` can alter `is_excluded` results
    pub fn exclusion_changed(&self, other: &ConcealmentSettings) -> bool {
        self.production_policy != other.production_policy
            || self.conceal_npc_owned != other.conceal_npc_owned
            || self.keep_alive_action != other.keep_alive_action
            || self.excluded_subtypes != other.excluded_subtypes
    }

    pub fn is_subtype_excluded(&self, subtype: &str) -> bool {
        self.excluded_subtypes.iter().any(|s| s == subtype)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be a positive finite distance, got {1}")]
    InvalidDistance(&'static str, f64),
    #[error("reveal_distance {reveal} exceeds conceal_distance {conceal}")]
    RevealBeyondConceal { reveal: f64, conceal: f64 },
    #[error("{0} must be at least 1 tick")]
    ZeroInterval(&'static str),
    #[error("{0} must be a positive number of seconds, got {1}")]
    InvalidWindow(&'static str, f64),
    #[error("worker_threads must be 1-16, got {0}")]
    WorkerThreads(usize),
}

/// Immutable published settings with the version they were published under
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub settings: ConcealmentSettings,
}

/// Versioned holder of the current settings snapshot
///
/// Readers take a cheap `Arc` clone; writers replace the snapshot wholesale.
/// Subscribers receive the new version number on every successful update.
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
    version: AtomicU64,
    subscribers: Mutex<Vec<Sender<u64>>>,
}

impl ConfigStore {
    pub fn new(settings: ConcealmentSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, settings })),
            version: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Current snapshot
    #[inline]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Current version, for cheap staleness checks
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish new settings. Invalid settings are rejected and nothing changes.
    pub fn update(&self, settings: ConcealmentSettings) -> Result<u64, ConfigError> {
        settings.validate()?;

        let version = {
            let mut current = self.current.write();
            let version = current.version + 1;
            *current = Arc::new(ConfigSnapshot { version, settings });
            self.version.store(version, Ordering::Release);
            version
        };

        tracing::debug!("Published concealment settings v{}", version);

        // Drop subscribers whose receiver is gone
        self.subscribers
            .lock()
            .retain(|tx| tx.send(version).is_ok());

        Ok(version)
    }

    /// Edit a copy of the current settings and publish it
    pub fn modify(&self, edit: impl FnOnce(&mut ConcealmentSettings)) -> Result<u64, ConfigError> {
        let mut settings = self.snapshot().settings.clone();
        edit(&mut settings);
        self.update(settings)
    }

    /// Change notification channel; receives each newly published version
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ConcealmentSettings::default();
        assert!(config.enabled);
        assert_eq!(config.conceal_distance, 75_000.0);
        assert_eq!(config.reveal_distance, 50_000.0);
        assert_eq!(config.conceal_interval, 3600);
        assert_eq!(config.reveal_interval, 60);
        assert_eq!(config.production_policy, ProductionPolicy::ExemptActive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_overrides() {
        let config = ConcealmentSettings::load_from(lookup(&[
            ("CONCEAL_DISTANCE", "2000"),
            ("REVEAL_DISTANCE", "500"),
            ("CONCEAL_INTERVAL", "10"),
            ("EXCLUDED_SUBTYPES", "LargeBeacon, SmallBeacon,,"),
            ("CONCEAL_PRODUCTION_POLICY", "conceal_all"),
        ]));
        assert_eq!(config.conceal_distance, 2000.0);
        assert_eq!(config.reveal_distance, 500.0);
        assert_eq!(config.conceal_interval, 10);
        assert_eq!(config.excluded_subtypes, vec!["LargeBeacon", "SmallBeacon"]);
        assert_eq!(config.production_policy, ProductionPolicy::ConcealAll);
    }

    #[test]
    fn test_load_from_keeps_defaults_on_bad_values() {
        let config = ConcealmentSettings::load_from(lookup(&[
            ("CONCEAL_DISTANCE", "-5"),
            ("REVEAL_INTERVAL", "0"),
            ("CONCEAL_ENABLED", "maybe"),
            ("VISIBILITY_WORKERS", "64"),
        ]));
        let defaults = ConcealmentSettings::default();
        assert_eq!(config.conceal_distance, defaults.conceal_distance);
        assert_eq!(config.reveal_interval, defaults.reveal_interval);
        assert_eq!(config.enabled, defaults.enabled);
        assert_eq!(config.worker_threads, defaults.worker_threads);
    }

    #[test]
    fn test_load_dynamic_rules_json() {
        let json = r#"[
            {"type_id": "LargeGatlingTurret", "category": "hostile_characters", "distance": 800},
            {"type_id": "Refinery", "subtype_id": "Blast Furnace", "category": "neutral_grids", "distance": 100}
        ]"#;
        let config = ConcealmentSettings::load_from(lookup(&[("DYNAMIC_VISIBILITY_RULES", json)]));
        assert_eq!(config.dynamic_rules.len(), 2);
        assert_eq!(config.dynamic_rules[0].subtype_id, None);
        assert_eq!(config.dynamic_rules[1].subtype_id.as_deref(), Some("Blast Furnace"));
        assert_eq!(config.dynamic_rules[1].category, VisibilityCategory::NeutralGrids);
    }

    #[test]
    fn test_validate_rejects_reveal_beyond_conceal() {
        let config = ConcealmentSettings {
            conceal_distance: 100.0,
            reveal_distance: 200.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RevealBeyondConceal { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = ConcealmentSettings {
            reveal_interval: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroInterval("reveal_interval")));
    }

    #[test]
    fn test_exclusion_changed() {
        let a = ConcealmentSettings::default();
        let mut b = a.clone();
        b.conceal_interval = 5;
        assert!(!a.exclusion_changed(&b));
        b.excluded_subtypes.push("LargeBeacon".into());
        assert!(a.exclusion_changed(&b));
    }

    #[test]
    fn test_store_versions_and_notifies() {
        let store = ConfigStore::new(ConcealmentSettings::default()).unwrap();
        let rx = store.subscribe();
        assert_eq!(store.version(), 1);

        let v = store.modify(|s| s.conceal_npc_owned = true).unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.version(), 2);
        assert_eq!(rx.try_recv(), Ok(2));
        assert!(store.snapshot().settings.conceal_npc_owned);
    }

    #[test]
    fn test_store_rejects_invalid_update() {
        let store = ConfigStore::new(ConcealmentSettings::default()).unwrap();
        let rx = store.subscribe();
        let result = store.modify(|s| s.worker_threads = 0);
        assert!(result.is_err());
        assert_eq!(store.version(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_store_drops_closed_subscribers() {
        let store = ConfigStore::new(ConcealmentSettings::default()).unwrap();
        let rx = store.subscribe();
        drop(rx);
        store.modify(|s| s.enabled = false).unwrap();
        assert!(store.subscribers.lock().is_empty());
    }
}
