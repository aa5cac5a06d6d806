//! SQLite storage layer -- schema, store trait, queries.

pub mod schema;
pub mod sqlite;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Report, SocialSignal};
use crate::registry::{Hotspot, HotspotEvent};
use crate::scheduler::history::RunRecord;

pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable backing for hotspots, reports, signals and run history.
///
/// `commit` must be all-or-nothing: either every transition in the batch is
/// persisted or none is.
pub trait HotspotStore: Send + Sync {
    /// Persist the hotspot state carried by each event in one transaction.
    fn commit(&self, events: &[HotspotEvent]) -> Result<(), StoreError>;

    /// Hotspots with `is_active = true`, members included.
    fn load_active(&self) -> Result<Vec<Hotspot>, StoreError>;

    /// Insert or update a report by id.
    fn save_report(&self, report: &Report) -> Result<(), StoreError>;

    /// Reports that occurred at or after `since`.
    fn load_reports_since(&self, since: DateTime<Utc>) -> Result<Vec<Report>, StoreError>;

    /// Insert a signal; duplicates by id are ignored.
    fn save_signal(&self, signal: &SocialSignal) -> Result<(), StoreError>;

    fn load_signals_since(&self, since: DateTime<Utc>) -> Result<Vec<SocialSignal>, StoreError>;

    fn record_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Most recent runs first.
    fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    /// Take the database-wide run lease for `holder` for `ttl`. Returns
    /// `false` while a different holder's lease is unexpired; an expired
    /// lease is taken over, and the current holder may renew.
    fn acquire_run_lease(&self, holder: Uuid, ttl: Duration) -> Result<bool, StoreError>;

    /// Give up the lease if `holder` still owns it.
    fn release_run_lease(&self, holder: Uuid) -> Result<(), StoreError>;
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
