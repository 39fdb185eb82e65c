// ABOUTME: Key-value option storage backing roles, tokens, connection and status records
// ABOUTME: SQLite-backed store for hosts plus an in-memory store for tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BridgeError, Result};

/// String-valued option storage. No atomicity is assumed across keys.
pub trait OptionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Structured values are stored as JSON text.
pub fn get_json<T: DeserializeOwned>(store: &dyn OptionStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(store: &dyn OptionStore, key: &str, value: &T) -> Result<()> {
    store.set(key, &serde_json::to_string(value)?)
}

pub struct SqliteOptionStore {
    conn: Mutex<Connection>,
}

impl SqliteOptionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS bridge_options (
                 name TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BridgeError::Store(format!("option store lock poisoned: {e}")))
    }
}

impl OptionStore for SqliteOptionStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM bridge_options WHERE name = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bridge_options (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM bridge_options WHERE name = ?1",
            rusqlite::params![key],
        )?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOptionStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|e| BridgeError::Store(format!("option store lock poisoned: {e}")))
    }
}

impl OptionStore for MemoryOptionStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    fn exercise(store: &dyn OptionStore) {
        assert_eq!(store.get("missing").unwrap(), None);
        store.set("role", "source").unwrap();
        assert_eq!(store.get("role").unwrap().as_deref(), Some("source"));
        store.set("role", "destination").unwrap();
        assert_eq!(store.get("role").unwrap().as_deref(), Some("destination"));
        store.delete("role").unwrap();
        store.delete("role").unwrap();
        assert_eq!(store.get("role").unwrap(), None);

        let record = Record {
            name: "x".into(),
            count: 3,
        };
        set_json(store, "record", &record).unwrap();
        let loaded: Option<Record> = get_json(store, "record").unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteOptionStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryOptionStore::new());
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/bridge.db");
        SqliteOptionStore::open(&path)
            .unwrap()
            .set("token", "abc")
            .unwrap();
        let reopened = SqliteOptionStore::open(&path).unwrap();
        assert_eq!(reopened.get("token").unwrap().as_deref(), Some("abc"));
    }
}
