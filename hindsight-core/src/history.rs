//! Browser history sources
//!
//! The scheduled path asks a [`HistorySource`] for everything visited in a
//! time window. Three sources exist:
//!
//! - [`ChromiumHistory`] reads a Chromium-family `History` database in place
//! - [`load_json_export`] reads a JSON array exported from the browser
//! - [`StaticHistory`] serves a fixed list (tests, `--history FILE`)

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{HistoryEntry, TimeRange};

/// Microseconds between 1601-01-01 (WebKit epoch) and 1970-01-01
const WEBKIT_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

/// Chromium-family profile roots, relative to the platform config dir
const CHROMIUM_ROOTS: &[&str] = &[
    "google-chrome",
    "chromium",
    "BraveSoftware/Brave-Browser",
    "microsoft-edge",
    "Google/Chrome",
];

/// Read-only view of a browser's visit history.
pub trait HistorySource: Send + Sync {
    /// Entries whose last visit falls inside `range`, oldest first.
    fn search(&self, range: &TimeRange) -> Result<Vec<HistoryEntry>>;
}

// ============================================
// In-memory
// ============================================

#[derive(Debug, Clone, Default)]
pub struct StaticHistory {
    entries: Vec<HistoryEntry>,
}

impl StaticHistory {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        Self { entries }
    }
}

impl HistorySource for StaticHistory {
    fn search(&self, range: &TimeRange) -> Result<Vec<HistoryEntry>> {
        let mut hits: Vec<HistoryEntry> = self
            .entries
            .iter()
            .filter(|e| e.visited_at.is_some_and(|ts| range.contains(ts)))
            .cloned()
            .collect();
        hits.sort_by_key(|e| e.visited_at);
        Ok(hits)
    }
}

// ============================================
// Chromium History database
// ============================================

/// Reader for a Chromium `History` SQLite file.
///
/// The browser holds a lock on the file while running, so it is opened with
/// `immutable=1` and never written.
#[derive(Debug, Clone)]
pub struct ChromiumHistory {
    path: PathBuf,
}

impl ChromiumHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(Error::History(format!(
                "history database not found: {}",
                self.path.display()
            )));
        }
        let uri = format!("file:{}?immutable=1", self.path.display());
        let conn = Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }
}

impl HistorySource for ChromiumHistory {
    fn search(&self, range: &TimeRange) -> Result<Vec<HistoryEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT url, title, visit_count, last_visit_time
            FROM urls
            WHERE last_visit_time >= ?1 AND last_visit_time < ?2 AND hidden = 0
            ORDER BY last_visit_time ASC
            "#,
        )?;

        let rows = stmt.query_map(
            params![to_webkit_micros(range.start), to_webkit_micros(range.end)],
            |row| {
                Ok(HistoryEntry {
                    url: row.get(0)?,
                    title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    visit_count: row.get::<_, i64>(2)?.max(0) as u32,
                    visited_at: from_webkit_micros(row.get(3)?),
                })
            },
        )?;

        let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        tracing::debug!(
            path = %self.path.display(),
            count = entries.len(),
            "Read Chromium history"
        );
        Ok(entries)
    }
}

/// WebKit timestamp (µs since 1601) to UTC; zero means "never".
pub fn from_webkit_micros(webkit: i64) -> Option<DateTime<Utc>> {
    if webkit <= 0 {
        return None;
    }
    DateTime::from_timestamp_micros(webkit - WEBKIT_EPOCH_OFFSET_MICROS)
}

pub fn to_webkit_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() + WEBKIT_EPOCH_OFFSET_MICROS
}

/// Find `History` files under the known Chromium-family profile roots.
pub fn discover_chromium_profiles() -> Result<Vec<PathBuf>> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(vec![]);
    };
    discover_chromium_profiles_in(&config_dir)
}

pub fn discover_chromium_profiles_in(config_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for root in CHROMIUM_ROOTS {
        let pattern = config_dir.join(root).join("*").join("History");
        let pattern_str = pattern.to_string_lossy();
        let entries = glob::glob(&pattern_str)
            .map_err(|e| Error::History(format!("invalid glob pattern: {e}")))?;
        found.extend(entries.flatten().filter(|p| p.is_file()));
    }
    found.sort();
    Ok(found)
}

// ============================================
// JSON export
// ============================================

/// Accepts both our own serialization and the browser extension API shape
/// (`lastVisitTime` in epoch milliseconds, `visitCount`).
#[derive(Deserialize)]
struct ExportedEntry {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    visited_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "lastVisitTime")]
    last_visit_time: Option<f64>,
    #[serde(default, alias = "visitCount")]
    visit_count: Option<u32>,
}

impl From<ExportedEntry> for HistoryEntry {
    fn from(raw: ExportedEntry) -> Self {
        let visited_at = raw.visited_at.or_else(|| {
            raw.last_visit_time
                .filter(|ms| ms.is_finite() && *ms > 0.0)
                .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
        });
        HistoryEntry {
            url: raw.url,
            title: raw.title.unwrap_or_default(),
            visited_at,
            visit_count: raw.visit_count.unwrap_or(1),
        }
    }
}

/// Load a JSON array of history entries.
pub fn load_json_export(path: &Path) -> Result<Vec<HistoryEntry>> {
    let content = std::fs::read_to_string(path)?;
    let raw: Vec<ExportedEntry> = serde_json::from_str(&content)?;
    Ok(raw.into_iter().map(HistoryEntry::from).collect())
}
