//! In-memory local configuration store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::{ConfigEvent, ConfigEventKind, LocalConfigStore, Properties};
use crate::error::{Error, Result};

/// Configuration store kept in memory; useful for tests and ephemeral nodes
pub struct MemoryConfigStore {
    configs: RwLock<HashMap<String, Properties>>,
    events: broadcast::Sender<ConfigEvent>,
    read_only: AtomicBool,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            configs: RwLock::new(HashMap::new()),
            events,
            read_only: AtomicBool::new(false),
        }
    }

    /// Create a store pre-populated with `properties` under `pid`, without notifying
    pub fn with_properties(pid: &str, properties: Properties) -> Self {
        let mut configs = HashMap::new();
        configs.insert(pid.to_string(), properties);
        Self {
            configs: RwLock::new(configs),
            ..Self::new()
        }
    }

    /// Reject every subsequent write (simulates a failing backing store)
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_writable(&self, pid: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Error::ConfigAccess(format!("configuration {} is read-only", pid)));
        }
        Ok(())
    }

    fn notify(&self, pid: &str, kind: ConfigEventKind) {
        let _ = self.events.send(ConfigEvent {
            pid: pid.to_string(),
            kind,
        });
    }
}

#[async_trait]
impl LocalConfigStore for MemoryConfigStore {
    async fn read(&self, pid: &str) -> Result<Option<Properties>> {
        Ok(self.configs.read().await.get(pid).cloned())
    }

    async fn write(&self, pid: &str, properties: &Properties) -> Result<()> {
        self.check_writable(pid)?;
        self.configs
            .write()
            .await
            .insert(pid.to_string(), properties.clone());
        self.notify(pid, ConfigEventKind::Updated);
        Ok(())
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        self.check_writable(pid)?;
        if self.configs.write().await.remove(pid).is_some() {
            self.notify(pid, ConfigEventKind::Deleted);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_notify() {
        let store = MemoryConfigStore::new();
        let mut events = store.subscribe();
        assert!(store.read("pid").await.unwrap().is_none());

        let mut props = Properties::new();
        props.insert("groups".to_string(), "default".to_string());
        store.write("pid", &props).await.unwrap();

        assert_eq!(store.read("pid").await.unwrap(), Some(props));
        let event = events.recv().await.unwrap();
        assert_eq!(event.pid, "pid");
        assert_eq!(event.kind, ConfigEventKind::Updated);

        store.delete("pid").await.unwrap();
        assert_eq!(events.recv().await.unwrap().kind, ConfigEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let mut props = Properties::new();
        props.insert("groups".to_string(), "default".to_string());
        let store = MemoryConfigStore::with_properties("pid", props.clone());
        store.set_read_only(true);

        let err = store.write("pid", &Properties::new()).await.unwrap_err();
        assert!(matches!(err, Error::ConfigAccess(_)));
        assert_eq!(store.read("pid").await.unwrap(), Some(props));
    }
}
