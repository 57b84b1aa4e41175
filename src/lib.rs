//! Concealment Server Library
//!
//! Keeps a large persistent world cheap to simulate: clusters far from every
//! observer are detached from simulation until someone comes near, and
//! selected entity types only update while a relevant neighbour is close.
//!
//! # Features
//!
//! - `dynamic_visibility` - Per-entity update suppression by distance and relation (enabled by default)
//! - `metrics_extended` - Per-update suppression counters (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod config;
pub mod util;
pub mod host;
pub mod concealment;
pub mod metrics;

// Feature-gated modules (enabled by default)
#[cfg(feature = "dynamic_visibility")]
pub mod visibility;
