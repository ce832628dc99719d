//! SQLite-backed store
//!
//! A single `kv` table, migrated via `PRAGMA user_version`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{check_quota, KeyValueStore, StoreError};
use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: key-value table
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  DATETIME NOT NULL
    );
    "#,
];

pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota: Option<usize>,
}

impl SqliteStore {
    /// Open or create a store at the given path and migrate it
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            quota: None,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            quota: None,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Reject any single value larger than `bytes`.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        let current_version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap_or(0);

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                tracing::info!(version, "Running store migration");
                conn.execute_batch(migration)?;
                conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
            }
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?)
    }

    fn conn(&self) -> std::result::Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Access("store connection lock poisoned".to_string()))
    }
}

impl KeyValueStore for SqliteStore {
    fn get_raw(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_raw(&self, key: &str, value: String) -> std::result::Result<(), StoreError> {
        check_quota(key, &value, self.quota)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{keys, load_profile, save_profile, KeyValueStoreExt};
    use crate::types::Profile;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_are_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let profile = Profile {
                summary: "Plans a trip to Lisbon".to_string(),
                ..Default::default()
            };
            save_profile(&store, &profile).unwrap();
            store.set(keys::SCHEDULE_ENABLED, &true).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let profile = load_profile(&store).unwrap().unwrap();
        assert_eq!(profile.summary, "Plans a trip to Lisbon");
        assert_eq!(store.get::<bool>(keys::SCHEDULE_ENABLED).unwrap(), Some(true));
    }

    #[test]
    fn test_upsert_and_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_raw("k", "1".to_string()).unwrap();
        store.set_raw("k", "2".to_string()).unwrap();
        assert_eq!(store.get_raw("k").unwrap().as_deref(), Some("2"));
        assert!(store.remove("k").unwrap());
        assert!(store.get_raw("k").unwrap().is_none());
    }

    #[test]
    fn test_quota() {
        let store = SqliteStore::open_in_memory().unwrap().with_quota(8);
        assert!(matches!(
            store.set_raw("k", "0123456789".to_string()),
            Err(StoreError::QuotaExceeded { .. })
        ));
        assert!(store.get_raw("k").unwrap().is_none());
    }
}
