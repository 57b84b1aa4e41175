//! Fine-grained dynamic visibility
//!
//! Independent of cluster concealment: an active entity whose type has
//! distance thresholds configured only runs its updates while a relevant
//! neighbour is close enough.
//!
//! - `rules` - threshold table built from the settings
//! - `relation` - ownership relation classification
//! - `scheduler` - staggered background refreshes
//! - `manager` - runtime records and the update veto

pub mod manager;
pub mod relation;
pub mod rules;
pub mod scheduler;

pub use manager::{DynamicVisibilityManager, VisibilityDecision};
pub use relation::{category_for, classify_relation, Relation};
pub use rules::{DynamicVisibilityConfig, VisibilityTable, CATEGORY_ORDER};
