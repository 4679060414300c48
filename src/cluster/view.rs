//! Cluster membership view

use async_trait::async_trait;

use super::Node;
use crate::error::Result;

/// Guard for a named cluster-wide lock; the lock is released on drop.
pub struct ClusterLockGuard {
    name: String,
    _inner: Box<dyn std::any::Any + Send + Sync>,
}

impl ClusterLockGuard {
    /// Wrap a provider-specific guard
    pub fn new<G: Send + Sync + 'static>(name: impl Into<String>, inner: G) -> Self {
        Self {
            name: name.into(),
            _inner: Box::new(inner),
        }
    }

    /// Name of the held lock
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ClusterLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLockGuard").field("name", &self.name).finish()
    }
}

/// The clustering provider's view of connected nodes
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// This node
    fn local_node(&self) -> Node;

    /// Every currently connected node, including this one
    async fn all_nodes(&self) -> Result<Vec<Node>>;

    /// Acquire the named cluster-wide lock
    async fn lock(&self, name: &str) -> Result<ClusterLockGuard>;
}
