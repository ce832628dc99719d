//! Durable key-value storage
//!
//! Everything hindsight persists goes through a [`KeyValueStore`]: the
//! profile, the schedule toggle and the last run record. Values are JSON
//! documents; each `set` replaces one key atomically, so a profile is either
//! the old one or the new one, never a mix.
//!
//! - [`SqliteStore`] backs the daemon and CLI
//! - [`MemoryStore`] backs tests and `--dry-run`

pub mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::types::{Profile, RunRecord};

pub use sqlite::SqliteStore;

/// Well-known store keys.
pub mod keys {
    pub const PROFILE: &str = "memory.profile";
    pub const SCHEDULE_ENABLED: &str = "schedule.enabled";
    pub const LAST_RUN: &str = "analysis.last_run";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("value for '{key}' is {size} bytes, store limit is {limit}")]
    QuotaExceeded { key: String, size: usize, limit: usize },

    #[error("cannot encode or decode '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store access failed: {0}")]
    Access(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Access(e.to_string())
    }
}

/// Raw string storage keyed by name.
pub trait KeyValueStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_raw(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Returns whether the key existed
    fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

/// Typed JSON access on top of any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.set_raw(key, raw)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

pub fn load_profile(store: &dyn KeyValueStore) -> Result<Option<Profile>, StoreError> {
    store.get(keys::PROFILE)
}

pub fn save_profile(store: &dyn KeyValueStore, profile: &Profile) -> Result<(), StoreError> {
    store.set(keys::PROFILE, profile)
}

/// Stored schedule toggle; `None` until the user sets one, so the
/// configured default still applies.
pub fn stored_schedule_enabled(store: &dyn KeyValueStore) -> Result<Option<bool>, StoreError> {
    store.get(keys::SCHEDULE_ENABLED)
}

pub fn set_schedule_enabled(store: &dyn KeyValueStore, enabled: bool) -> Result<(), StoreError> {
    store.set(keys::SCHEDULE_ENABLED, &enabled)
}

pub fn load_last_run(store: &dyn KeyValueStore) -> Result<Option<RunRecord>, StoreError> {
    store.get(keys::LAST_RUN)
}

pub fn save_last_run(store: &dyn KeyValueStore, record: &RunRecord) -> Result<(), StoreError> {
    store.set(keys::LAST_RUN, record)
}

fn check_quota(key: &str, value: &str, quota: Option<usize>) -> Result<(), StoreError> {
    match quota {
        Some(limit) if value.len() > limit => Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            size: value.len(),
            limit,
        }),
        _ => Ok(()),
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any single value larger than `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            values: Mutex::default(),
            quota: Some(bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.values
            .lock()
            .map_err(|_| StoreError::Access("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: String) -> Result<(), StoreError> {
        check_quota(key, &value, self.quota)?;
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_roundtrip_through_helpers() {
        let store = MemoryStore::new();
        assert!(load_profile(&store).unwrap().is_none());

        let profile = Profile {
            summary: "Reads about compilers".to_string(),
            sessions_analyzed: 3,
            ..Default::default()
        };
        save_profile(&store, &profile).unwrap();
        assert_eq!(load_profile(&store).unwrap(), Some(profile));
    }

    #[test]
    fn test_schedule_flag_absent_until_set() {
        let store = MemoryStore::new();
        assert_eq!(stored_schedule_enabled(&store).unwrap(), None);
        set_schedule_enabled(&store, false).unwrap();
        assert_eq!(stored_schedule_enabled(&store).unwrap(), Some(false));
        set_schedule_enabled(&store, true).unwrap();
        assert_eq!(stored_schedule_enabled(&store).unwrap(), Some(true));
    }

    #[test]
    fn test_quota_rejects_and_keeps_previous_value() {
        let store = MemoryStore::with_quota(64);
        store.set_raw("k", "\"small\"".to_string()).unwrap();

        let err = store.set_raw("k", "x".repeat(100)).unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { size: 100, limit: 64, .. }));
        assert_eq!(store.get_raw("k").unwrap().as_deref(), Some("\"small\""));
    }

    #[test]
    fn test_corrupt_value_reports_key() {
        let store = MemoryStore::new();
        store.set_raw(keys::PROFILE, "{not json".to_string()).unwrap();
        match load_profile(&store) {
            Err(StoreError::Serialization { key, .. }) => assert_eq!(key, keys::PROFILE),
            other => panic!("expected serialization error, got {other:?}"),
        }
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        store.set("a", &1u32).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
    }
}
