//! Cluster Module
//!
//! Abstractions over the clustering provider: node identity, replicated
//! key/value maps with change notification, and the membership view.
//! An in-process implementation backs single-process deployments and tests.

mod node;
mod store;
mod view;
mod memory;

pub use node::Node;
pub use store::{EntryEvent, EntryEventKind, ReplicatedStore};
pub use view::{ClusterLockGuard, ClusterView};
pub use memory::{MemoryCluster, MemoryNodeView, MemoryStore};

use std::collections::BTreeSet;

/// Replicated map of group name to group properties
pub type GroupConfigStore = dyn ReplicatedStore<String, serde_json::Value>;

/// Replicated map of node to the names of the groups it belongs to
pub type NodeGroupsStore = dyn ReplicatedStore<Node, BTreeSet<String>>;

/// Name of the replicated node-to-groups map
pub const GROUPS_MAP: &str = "wolfgroup.groups";

/// Name of the replicated group configuration map
pub const GROUPS_CONFIG_MAP: &str = "wolfgroup.groups.config";

/// Cluster lock serializing merges into the group configuration map
pub const GROUPS_CONFIG_LOCK: &str = "wolfgroup.groups.config.lock";
