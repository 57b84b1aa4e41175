//! Cluster concealment
//!
//! - `cluster` - a physical cluster and its cached respawn anchors
//! - `index` - dynamic AABB tree over concealed clusters
//! - `eligibility` - exclusion rules that keep a cluster simulated
//! - `controller` - conceal/reveal lifecycle driven from the simulation tick

pub mod cluster;
pub mod controller;
pub mod eligibility;
pub mod index;

pub use cluster::{ClusterState, EntityCluster};
pub use controller::ConcealmentController;
pub use eligibility::ExclusionReason;
pub use index::{ConcealmentIndex, IndexError, ProxyId};
