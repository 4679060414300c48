//! Replicated key/value store contract

use std::collections::HashMap;
use std::hash::Hash;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Kind of change observed on a replicated entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
    Evicted,
}

impl std::fmt::Display for EntryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryEventKind::Added => write!(f, "ADDED"),
            EntryEventKind::Updated => write!(f, "UPDATED"),
            EntryEventKind::Removed => write!(f, "REMOVED"),
            EntryEventKind::Evicted => write!(f, "EVICTED"),
        }
    }
}

/// Change notification for a single replicated entry
#[derive(Debug, Clone)]
pub struct EntryEvent<K, V> {
    pub kind: EntryEventKind,
    pub key: K,
    /// Value after the change (`None` for removals and evictions)
    pub value: Option<V>,
    /// Value before the change, if any
    pub old_value: Option<V>,
}

/// A key/value structure shared by every node of the cluster.
///
/// Notifications are at-least-once; subscribers must tolerate duplicates.
#[async_trait]
pub trait ReplicatedStore<K, V>: Send + Sync
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Get the value stored under `key`
    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// Store `value` under `key`, returning the previous value
    async fn put(&self, key: K, value: V) -> Result<Option<V>>;

    /// Store every entry of `entries`
    async fn put_all(&self, entries: HashMap<K, V>) -> Result<()>;

    /// Remove `key`, returning the previous value
    async fn remove(&self, key: &K) -> Result<Option<V>>;

    /// All keys currently stored
    async fn keys(&self) -> Result<Vec<K>>;

    /// All entries currently stored
    async fn entries(&self) -> Result<Vec<(K, V)>>;

    /// Whether the store holds no entries
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.keys().await?.is_empty())
    }

    /// Subscribe to entry change notifications
    fn subscribe(&self) -> broadcast::Receiver<EntryEvent<K, V>>;
}
