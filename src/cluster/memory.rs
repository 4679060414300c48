//! In-process cluster provider
//!
//! Every `MemoryNodeView` obtained from the same `MemoryCluster` shares the
//! same replicated maps and lock table, which makes a set of nodes inside
//! one process behave like a cluster with instantaneous replication.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::store::{EntryEvent, EntryEventKind, ReplicatedStore};
use super::view::{ClusterLockGuard, ClusterView};
use super::{GroupConfigStore, Node, NodeGroupsStore, GROUPS_CONFIG_MAP, GROUPS_MAP};
use crate::error::{Error, Result};

/// Default number of buffered change notifications per map
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Replicated map shared by reference between in-process nodes
pub struct MemoryStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

struct StoreInner<K, V> {
    name: String,
    entries: RwLock<HashMap<K, V>>,
    events: broadcast::Sender<EntryEvent<K, V>>,
}

impl<K, V> Clone for MemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> MemoryStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty map
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                entries: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Map name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of entries
    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    /// Evict an entry, notifying subscribers with an `Evicted` event
    pub async fn evict(&self, key: &K) -> Option<V> {
        let mut entries = self.inner.entries.write().await;
        let old = entries.remove(key);
        if old.is_some() {
            self.notify(EntryEventKind::Evicted, key.clone(), None, old.clone());
        }
        old
    }

    fn notify(&self, kind: EntryEventKind, key: K, value: Option<V>, old_value: Option<V>) {
        // No subscribers is not an error
        let _ = self.inner.events.send(EntryEvent {
            kind,
            key,
            value,
            old_value,
        });
    }
}

#[async_trait]
impl<K, V> ReplicatedStore<K, V> for MemoryStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.inner.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        // Notify while holding the write lock so events follow write order
        let mut entries = self.inner.entries.write().await;
        let old = entries.insert(key.clone(), value.clone());
        let kind = if old.is_some() {
            EntryEventKind::Updated
        } else {
            EntryEventKind::Added
        };
        self.notify(kind, key, Some(value), old.clone());
        Ok(old)
    }

    async fn put_all(&self, entries: HashMap<K, V>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<Option<V>> {
        let mut entries = self.inner.entries.write().await;
        let old = entries.remove(key);
        if old.is_some() {
            self.notify(EntryEventKind::Removed, key.clone(), None, old.clone());
        }
        Ok(old)
    }

    async fn keys(&self) -> Result<Vec<K>> {
        Ok(self.inner.entries.read().await.keys().cloned().collect())
    }

    async fn entries(&self) -> Result<Vec<(K, V)>> {
        Ok(self
            .inner
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<EntryEvent<K, V>> {
        self.inner.events.subscribe()
    }
}

/// In-process cluster: connected nodes, named locks and the group maps
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    nodes: RwLock<Vec<Node>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    group_config: MemoryStore<String, serde_json::Value>,
    node_groups: MemoryStore<Node, BTreeSet<String>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty cluster buffering `capacity` notifications per map
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                nodes: RwLock::new(Vec::new()),
                locks: Mutex::new(HashMap::new()),
                group_config: MemoryStore::new(GROUPS_CONFIG_MAP, capacity),
                node_groups: MemoryStore::new(GROUPS_MAP, capacity),
            }),
        }
    }

    /// Connect a node and return its view of the cluster
    pub async fn join(&self, node: Node) -> MemoryNodeView {
        let mut nodes = self.inner.nodes.write().await;
        if !nodes.contains(&node) {
            tracing::debug!("Node {} joined the in-process cluster", node);
            nodes.push(node.clone());
        }
        MemoryNodeView {
            node,
            cluster: self.clone(),
        }
    }

    /// Disconnect a node
    pub async fn leave(&self, node_id: &str) -> Option<Node> {
        let mut nodes = self.inner.nodes.write().await;
        let position = nodes.iter().position(|n| n.id == node_id)?;
        let node = nodes.remove(position);
        tracing::debug!("Node {} left the in-process cluster", node);
        Some(node)
    }

    /// The shared group configuration map
    pub fn group_config(&self) -> MemoryStore<String, serde_json::Value> {
        self.inner.group_config.clone()
    }

    /// The shared node-to-groups map
    pub fn node_groups(&self) -> MemoryStore<Node, BTreeSet<String>> {
        self.inner.node_groups.clone()
    }
}

/// One node's handle on a `MemoryCluster`
#[derive(Clone)]
pub struct MemoryNodeView {
    node: Node,
    cluster: MemoryCluster,
}

impl MemoryNodeView {
    /// The cluster this view belongs to
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    /// The group configuration map as a trait object
    pub fn group_config_store(&self) -> Arc<GroupConfigStore> {
        Arc::new(self.cluster.group_config())
    }

    /// The node-to-groups map as a trait object
    pub fn node_groups_store(&self) -> Arc<NodeGroupsStore> {
        Arc::new(self.cluster.node_groups())
    }
}

#[async_trait]
impl ClusterView for MemoryNodeView {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    async fn all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.cluster.inner.nodes.read().await.clone())
    }

    async fn lock(&self, name: &str) -> Result<ClusterLockGuard> {
        if name.is_empty() {
            return Err(Error::Store("lock name cannot be empty".into()));
        }
        let lock = {
            let mut locks = self.cluster.inner.locks.lock().await;
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        tracing::trace!("Node {} acquired cluster lock {}", self.node.id, name);
        Ok(ClusterLockGuard::new(name, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_notifies_added_then_updated() {
        let store: MemoryStore<String, String> = MemoryStore::new("test", 16);
        let mut events = store.subscribe();

        store.put("a".to_string(), "1".to_string()).await.unwrap();
        let old = store.put("a".to_string(), "2".to_string()).await.unwrap();
        assert_eq!(old, Some("1".to_string()));

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EntryEventKind::Added);
        assert_eq!(first.value, Some("1".to_string()));

        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, EntryEventKind::Updated);
        assert_eq!(second.value, Some("2".to_string()));
        assert_eq!(second.old_value, Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_remove_and_evict() {
        let store: MemoryStore<String, String> = MemoryStore::new("test", 16);
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), "1".to_string());
        entries.insert("b".to_string(), "2".to_string());
        store.put_all(entries).await.unwrap();
        assert_eq!(store.len().await, 2);

        let mut events = store.subscribe();
        assert_eq!(store.remove(&"a".to_string()).await.unwrap(), Some("1".to_string()));
        assert_eq!(store.remove(&"a".to_string()).await.unwrap(), None);
        assert_eq!(store.evict(&"b".to_string()).await, Some("2".to_string()));
        assert!(store.is_empty().await.unwrap());

        let removed = events.recv().await.unwrap();
        assert_eq!(removed.kind, EntryEventKind::Removed);
        assert!(removed.value.is_none());
        let evicted = events.recv().await.unwrap();
        assert_eq!(evicted.kind, EntryEventKind::Evicted);
        assert_eq!(evicted.key, "b");
    }

    #[tokio::test]
    async fn test_views_share_maps() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(Node::new("a", "127.0.0.1:1")).await;
        let b = cluster.join(Node::new("b", "127.0.0.1:2")).await;

        a.group_config_store()
            .put("ops".to_string(), serde_json::json!({"ops.timeout": "5"}))
            .await
            .unwrap();
        let seen = b.group_config_store().get(&"ops".to_string()).await.unwrap();
        assert_eq!(seen, Some(serde_json::json!({"ops.timeout": "5"})));

        assert_eq!(a.all_nodes().await.unwrap().len(), 2);
        cluster.leave("b").await.unwrap();
        assert_eq!(a.all_nodes().await.unwrap(), vec![Node::new("a", "")]);
    }

    #[tokio::test]
    async fn test_cluster_lock_is_exclusive() {
        let cluster = MemoryCluster::new();
        let a = cluster.join(Node::new("a", "127.0.0.1:1")).await;
        let b = cluster.join(Node::new("b", "127.0.0.1:2")).await;

        let guard = a.lock("groups").await.unwrap();
        assert_eq!(guard.name(), "groups");

        let blocked = tokio::time::timeout(Duration::from_millis(50), b.lock("groups")).await;
        assert!(blocked.is_err());

        // Other names are independent
        b.lock("other").await.unwrap();

        drop(guard);
        tokio::time::timeout(Duration::from_millis(500), b.lock("groups"))
            .await
            .unwrap()
            .unwrap();
    }
}
