//! WolfGroup - Cluster Group Membership
//!
//! Lets the nodes of a cluster organize themselves into named groups, each
//! with its own configuration and messaging channel.
//!
//! # Architecture
//!
//! Every node keeps its group configuration in a local configuration store.
//! A replicated group configuration map carries the same information across
//! the cluster, and a replicated node-to-groups map records who joined what.
//! The group manager reconciles the local and replicated copies in both
//! directions, exchanging only the keys that changed.
//!
//! # Features
//!
//! - Join and leave groups with idempotent, retryable steps
//! - Bidirectional configuration reconciliation with change markers
//! - Local-only properties that never leave the node
//! - Per-group messaging channels
//! - Pluggable synchronizers run on every join
//! - SQLite-backed local configuration

pub mod config;
pub mod error;
pub mod cluster;
pub mod local;
pub mod transport;
pub mod group;

pub use config::WolfGroupConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfGroupConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterView, MemoryCluster, Node, ReplicatedStore};
    pub use crate::local::{LocalConfigStore, MemoryConfigStore, Properties, SqliteConfigStore};
    pub use crate::transport::{Event, EventTransportFactory, LocalTransportFactory};
    pub use crate::group::{Collaborators, Group, GroupManager, GroupSettings, GroupState, Synchronizer};
}
