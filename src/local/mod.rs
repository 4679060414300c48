//! Local Configuration Module
//!
//! Per-node configuration dictionaries stored under a PID, with change
//! notification so the group manager can react to local edits.

mod memory;
mod sqlite;

pub use memory::MemoryConfigStore;
pub use sqlite::SqliteConfigStore;

use std::collections::BTreeMap;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// Ordered key/value configuration dictionary
pub type Properties = BTreeMap<String, String>;

/// Kind of local configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEventKind {
    Updated,
    Deleted,
}

/// Notification that the configuration stored under `pid` changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEvent {
    pub pid: String,
    pub kind: ConfigEventKind,
}

/// Persistent store of local configuration dictionaries
#[async_trait]
pub trait LocalConfigStore: Send + Sync {
    /// Read the dictionary stored under `pid` (`None` if never written)
    async fn read(&self, pid: &str) -> Result<Option<Properties>>;

    /// Replace the dictionary stored under `pid`
    async fn write(&self, pid: &str, properties: &Properties) -> Result<()>;

    /// Delete the dictionary stored under `pid`
    async fn delete(&self, pid: &str) -> Result<()>;

    /// Subscribe to change notifications for every PID
    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent>;
}
