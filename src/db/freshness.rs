//! Per-dataset last-refresh tracking, surfaced on every query response.
//!
//! The loader stamps a `dataset_freshness` table when it refreshes a dataset.
//! If that table is absent (fresh installs, fixtures), the database file's
//! mtime stands in for every catalog table.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::catalog::SchemaCatalog;
use crate::db::pool::ConnectionPool;

#[derive(Debug, Default)]
pub struct FreshnessTracker {
    stamps: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load stamps from the `dataset_freshness` table, falling back to the
    /// database file's mtime for every catalog table.
    pub async fn load(
        pool: &ConnectionPool,
        db_path: &Path,
        catalog: &SchemaCatalog,
    ) -> Self {
        let tracker = Self::new();

        let loaded = Self::read_freshness_table(pool).await;
        match loaded {
            Some(stamps) if !stamps.is_empty() => {
                let mut guard = tracker.stamps.write().expect("freshness lock poisoned");
                *guard = stamps;
            }
            _ => {
                let fallback = file_mtime(db_path).unwrap_or_else(Utc::now);
                let mut guard = tracker.stamps.write().expect("freshness lock poisoned");
                for table in catalog.tables() {
                    guard.insert(table.name.to_string(), fallback);
                }
                tracing::debug!(
                    "dataset_freshness table not found; stamping catalog tables from file mtime"
                );
            }
        }
        tracker
    }

    async fn read_freshness_table(pool: &ConnectionPool) -> Option<HashMap<String, DateTime<Utc>>> {
        let mut pooled = pool.acquire().await.ok()?;
        let handle = pooled.take()?;

        let result = tokio::task::spawn_blocking(move || {
            let rows = read_stamps(&handle.conn);
            (handle, rows)
        })
        .await;

        match result {
            Ok((handle, rows)) => {
                pooled.give_back(handle);
                rows
            }
            Err(e) => {
                tracing::error!("freshness load task failed: {e}");
                pooled.mark_broken();
                None
            }
        }
    }

    /// Record a refresh, e.g. after the loader signals completion.
    pub fn set(&self, table: &str, refreshed_at: DateTime<Utc>) {
        let mut stamps = self.stamps.write().expect("freshness lock poisoned");
        stamps.insert(table.to_string(), refreshed_at);
    }

    /// Stamps for the given tables, omitting unknown ones.
    pub fn stamp_for(&self, tables: &[String]) -> BTreeMap<String, DateTime<Utc>> {
        let stamps = self.stamps.read().expect("freshness lock poisoned");
        tables
            .iter()
            .filter_map(|t| stamps.get(t).map(|at| (t.clone(), *at)))
            .collect()
    }

    pub fn all(&self) -> BTreeMap<String, DateTime<Utc>> {
        let stamps = self.stamps.read().expect("freshness lock poisoned");
        stamps.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

fn read_stamps(conn: &duckdb::Connection) -> Option<HashMap<String, DateTime<Utc>>> {
    let mut stmt = conn
        .prepare("SELECT table_name, CAST(last_refreshed AS VARCHAR) FROM dataset_freshness")
        .ok()?;
    let mut rows = stmt.query([]).ok()?;

    let mut stamps = HashMap::new();
    while let Ok(Some(row)) = rows.next() {
        let table: String = row.get(0).ok()?;
        let raw: String = row.get(1).ok()?;
        if let Some(at) = parse_timestamp(&raw) {
            stamps.insert(table, at);
        }
    }
    Some(stamps)
}

/// Accept RFC 3339 and the engine's default `YYYY-MM-DD HH:MM:SS[.ffffff]`.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
