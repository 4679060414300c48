//! SQLite-backed local configuration store
//!
//! Each PID is a set of `(key, value)` rows; a PID row records that the
//! configuration exists even when it holds no properties.

use std::path::Path;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex};

use super::{ConfigEvent, ConfigEventKind, LocalConfigStore, Properties};
use crate::error::{Error, Result};

/// Persistent configuration store backed by SQLite
pub struct SqliteConfigStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Change notifications
    events: broadcast::Sender<ConfigEvent>,
}

impl SqliteConfigStore {
    /// Create or open the configuration database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS config_pids (
                pid TEXT PRIMARY KEY,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS config_properties (
                pid TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (pid, key)
            );
            "#,
        )?;

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    fn notify(&self, pid: &str, kind: ConfigEventKind) {
        let _ = self.events.send(ConfigEvent {
            pid: pid.to_string(),
            kind,
        });
    }
}

#[async_trait]
impl LocalConfigStore for SqliteConfigStore {
    async fn read(&self, pid: &str) -> Result<Option<Properties>> {
        let conn = self.conn.lock().await;
        let exists: Option<String> = conn
            .query_row(
                "SELECT pid FROM config_pids WHERE pid = ?1",
                params![pid],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let mut stmt = conn.prepare("SELECT key, value FROM config_properties WHERE pid = ?1")?;
        let rows = stmt.query_map(params![pid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut properties = Properties::new();
        for result in rows {
            let (key, value) = result?;
            properties.insert(key, value);
        }

        Ok(Some(properties))
    }

    async fn write(&self, pid: &str, properties: &Properties) -> Result<()> {
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO config_pids (pid) VALUES (?1)
                ON CONFLICT(pid) DO UPDATE SET updated_at = CURRENT_TIMESTAMP
                "#,
                params![pid],
            )?;
            tx.execute("DELETE FROM config_properties WHERE pid = ?1", params![pid])?;
            for (key, value) in properties {
                tx.execute(
                    "INSERT INTO config_properties (pid, key, value) VALUES (?1, ?2, ?3)",
                    params![pid, key, value],
                )?;
            }
            tx.commit()?;
        }

        self.notify(pid, ConfigEventKind::Updated);
        Ok(())
    }

    async fn delete(&self, pid: &str) -> Result<()> {
        let deleted = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM config_properties WHERE pid = ?1", params![pid])?;
            let deleted = tx.execute("DELETE FROM config_pids WHERE pid = ?1", params![pid])?;
            tx.commit()?;
            deleted
        };

        if deleted > 0 {
            self.notify(pid, ConfigEventKind::Deleted);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::ConfigAccess(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.db");

        let mut props = Properties::new();
        props.insert("groups".to_string(), "default,ops".to_string());
        props.insert("ops.timeout".to_string(), "30".to_string());

        {
            let store = SqliteConfigStore::open(&path).unwrap();
            assert!(store.read("wolfgroup.groups").await.unwrap().is_none());
            store.write("wolfgroup.groups", &props).await.unwrap();
        }

        let store = SqliteConfigStore::open(&path).unwrap();
        assert_eq!(store.read("wolfgroup.groups").await.unwrap(), Some(props));
    }

    #[tokio::test]
    async fn test_write_replaces_and_empty_exists() {
        let store = SqliteConfigStore::in_memory().unwrap();
        let mut events = store.subscribe();

        let mut props = Properties::new();
        props.insert("a".to_string(), "1".to_string());
        store.write("pid", &props).await.unwrap();
        store.write("pid", &Properties::new()).await.unwrap();

        assert_eq!(store.read("pid").await.unwrap(), Some(Properties::new()));
        assert_eq!(events.recv().await.unwrap().kind, ConfigEventKind::Updated);
        assert_eq!(events.recv().await.unwrap().kind, ConfigEventKind::Updated);

        store.delete("pid").await.unwrap();
        assert!(store.read("pid").await.unwrap().is_none());
        assert_eq!(events.recv().await.unwrap().kind, ConfigEventKind::Deleted);
    }
}
