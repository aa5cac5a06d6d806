//! `HotspotStore` backed by the pooled SQLite database.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{format_ts, open_pool, HotspotStore, Pool, StoreError};
use crate::detect::AlertLevel;
use crate::model::{HazardType, Report, ReportStatus, Severity, SocialSignal};
use crate::registry::{Hotspot, HotspotEvent};
use crate::scheduler::history::{RunRecord, RunStatus};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    /// Every stored report, newest first. Used for dashboard statistics.
    pub fn load_all_reports(&self) -> Result<Vec<Report>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, latitude, longitude, hazard_type, severity, confidence_score, occurred_at, status
             FROM reports ORDER BY occurred_at DESC",
        )?;
        let rows = stmt.query_map([], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Hotspots retired at or after `since`, most recent first.
    pub fn load_retired_since(&self, since: DateTime<Utc>) -> Result<Vec<Hotspot>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hotspots WHERE is_active = 0 AND resolved_at >= ?1 ORDER BY resolved_at DESC",
            HOTSPOT_COLUMNS
        ))?;
        let rows = stmt.query_map([format_ts(&since)], hotspot_from_row)?;
        let mut hotspots = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        attach_members(&conn, &mut hotspots)?;
        Ok(hotspots)
    }

    pub fn get_report(&self, id: &Uuid) -> Result<Option<Report>, StoreError> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                "SELECT id, latitude, longitude, hazard_type, severity, confidence_score, occurred_at, status
                 FROM reports WHERE id = ?1",
                [id.to_string()],
                report_from_row,
            )
            .optional()?;
        Ok(report)
    }
}

const HOTSPOT_COLUMNS: &str = "id, name, description, center_latitude, center_longitude, radius_km, \
     alert_level, confidence_score, report_count, dominant_hazard_type, max_severity, \
     latest_report_at, is_active, detected_at, last_updated, resolved_at";

impl HotspotStore for SqliteStore {
    fn commit(&self, events: &[HotspotEvent]) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for event in events {
            let h = event.hotspot();
            tx.execute(
                "INSERT INTO hotspots (id, name, description, center_latitude, center_longitude, radius_km,
                     alert_level, confidence_score, report_count, dominant_hazard_type, max_severity,
                     latest_report_at, is_active, detected_at, last_updated, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     description = excluded.description,
                     center_latitude = excluded.center_latitude,
                     center_longitude = excluded.center_longitude,
                     radius_km = excluded.radius_km,
                     alert_level = excluded.alert_level,
                     confidence_score = excluded.confidence_score,
                     report_count = excluded.report_count,
                     dominant_hazard_type = excluded.dominant_hazard_type,
                     max_severity = excluded.max_severity,
                     latest_report_at = excluded.latest_report_at,
                     is_active = excluded.is_active,
                     last_updated = excluded.last_updated,
                     resolved_at = excluded.resolved_at",
                params![
                    h.id.to_string(),
                    h.name,
                    h.description,
                    h.center_latitude,
                    h.center_longitude,
                    h.radius_km,
                    h.alert_level.as_str(),
                    h.confidence_score,
                    h.report_count as i64,
                    h.dominant_hazard_type.as_str(),
                    h.max_severity.as_str(),
                    format_ts(&h.latest_report_at),
                    h.is_active,
                    format_ts(&h.detected_at),
                    format_ts(&h.last_updated),
                    h.resolved_at.as_ref().map(format_ts),
                ],
            )?;

            tx.execute(
                "DELETE FROM hotspot_reports WHERE hotspot_id = ?1",
                [h.id.to_string()],
            )?;
            let mut link = tx.prepare_cached(
                "INSERT INTO hotspot_reports (hotspot_id, report_id) VALUES (?1, ?2)",
            )?;
            for report_id in &h.member_report_ids {
                link.execute(params![h.id.to_string(), report_id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_active(&self) -> Result<Vec<Hotspot>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hotspots WHERE is_active = 1 ORDER BY id",
            HOTSPOT_COLUMNS
        ))?;
        let rows = stmt.query_map([], hotspot_from_row)?;
        let mut hotspots = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        attach_members(&conn, &mut hotspots)?;
        Ok(hotspots)
    }

    fn save_report(&self, report: &Report) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO reports (id, latitude, longitude, hazard_type, severity, confidence_score, occurred_at, status, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 latitude = excluded.latitude,
                 longitude = excluded.longitude,
                 hazard_type = excluded.hazard_type,
                 severity = excluded.severity,
                 confidence_score = excluded.confidence_score,
                 occurred_at = excluded.occurred_at,
                 status = excluded.status",
            params![
                report.id.to_string(),
                report.latitude,
                report.longitude,
                report.hazard_type.as_str(),
                report.severity.as_str(),
                report.confidence_score,
                format_ts(&report.occurred_at),
                report.status.as_str(),
                format_ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn load_reports_since(&self, since: DateTime<Utc>) -> Result<Vec<Report>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, latitude, longitude, hazard_type, severity, confidence_score, occurred_at, status
             FROM reports WHERE occurred_at >= ?1 ORDER BY occurred_at",
        )?;
        let rows = stmt.query_map([format_ts(&since)], report_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn save_signal(&self, signal: &SocialSignal) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO social_signals (id, latitude, longitude, hazard_type, confidence_score, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                signal.id.to_string(),
                signal.latitude,
                signal.longitude,
                signal.hazard_type.map(|h| h.as_str()),
                signal.confidence_score,
                format_ts(&signal.observed_at),
            ],
        )?;
        Ok(())
    }

    fn load_signals_since(&self, since: DateTime<Utc>) -> Result<Vec<SocialSignal>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, latitude, longitude, hazard_type, confidence_score, observed_at
             FROM social_signals WHERE observed_at >= ?1 ORDER BY observed_at",
        )?;
        let rows = stmt.query_map([format_ts(&since)], |row| {
            let hazard: Option<String> = row.get(3)?;
            let hazard_type = match hazard {
                Some(raw) => Some(HazardType::parse(&raw).ok_or_else(|| unknown_value(3, &raw))?),
                None => None,
            };
            Ok(SocialSignal {
                id: uuid_col(row, 0)?,
                latitude: row.get(1)?,
                longitude: row.get(2)?,
                hazard_type,
                confidence_score: row.get(4)?,
                observed_at: ts_col(row, 5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_history (id, status, reports_considered, clusters_found, noise, created, updated,
                 retired, write_attempts, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.run_id.to_string(),
                record.status.as_str(),
                record.reports_considered as i64,
                record.clusters_found as i64,
                record.noise as i64,
                record.created as i64,
                record.updated as i64,
                record.retired as i64,
                record.write_attempts,
                record.error,
                format_ts(&record.started_at),
                format_ts(&record.finished_at),
            ],
        )?;
        Ok(())
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, status, reports_considered, clusters_found, noise, created, updated, retired,
                 write_attempts, error, started_at, finished_at
             FROM run_history ORDER BY started_at DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let status: String = row.get(1)?;
            Ok(RunRecord {
                run_id: uuid_col(row, 0)?,
                status: RunStatus::parse(&status).ok_or_else(|| unknown_value(1, &status))?,
                reports_considered: count_col(row, 2)?,
                clusters_found: count_col(row, 3)?,
                noise: count_col(row, 4)?,
                created: count_col(row, 5)?,
                updated: count_col(row, 6)?,
                retired: count_col(row, 7)?,
                write_attempts: row.get(8)?,
                error: row.get(9)?,
                started_at: ts_col(row, 10)?,
                finished_at: ts_col(row, 11)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn acquire_run_lease(&self, holder: Uuid, ttl: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| StoreError::Unavailable(format!("run lease of {:?} is out of range", ttl)))?;

        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock up front so two processes cannot
        // both read the lease as free.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, expires_at FROM run_lease WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((other, until)) = current {
            if other != holder.to_string() && until > format_ts(&now) {
                debug!(holder = %other, until = %until, "run lease held elsewhere");
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO run_lease (id, holder, acquired_at, expires_at) VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 holder = excluded.holder,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at",
            params![holder.to_string(), format_ts(&now), format_ts(&expires_at)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_run_lease(&self, holder: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM run_lease WHERE id = 1 AND holder = ?1",
            [holder.to_string()],
        )?;
        Ok(())
    }
}

fn attach_members(conn: &rusqlite::Connection, hotspots: &mut [Hotspot]) -> Result<(), StoreError> {
    if hotspots.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare_cached(
        "SELECT report_id FROM hotspot_reports WHERE hotspot_id = ?1 ORDER BY report_id",
    )?;
    let mut by_id: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
    for h in hotspots.iter() {
        let rows = stmt.query_map([h.id.to_string()], |row| uuid_col(row, 0))?;
        by_id.insert(h.id, rows.collect::<rusqlite::Result<BTreeSet<_>>>()?);
    }
    for h in hotspots.iter_mut() {
        h.member_report_ids = by_id.remove(&h.id).unwrap_or_default();
    }
    Ok(())
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    Ok(Report {
        id: uuid_col(row, 0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        hazard_type: enum_col(row, 3, HazardType::parse)?,
        severity: enum_col(row, 4, Severity::parse)?,
        confidence_score: row.get(5)?,
        occurred_at: ts_col(row, 6)?,
        status: enum_col(row, 7, ReportStatus::parse)?,
    })
}

/// Members are filled in separately by `attach_members`.
fn hotspot_from_row(row: &Row<'_>) -> rusqlite::Result<Hotspot> {
    let resolved: Option<String> = row.get(15)?;
    let resolved_at = match resolved {
        Some(raw) => Some(parse_ts(15, &raw)?),
        None => None,
    };
    Ok(Hotspot {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        center_latitude: row.get(3)?,
        center_longitude: row.get(4)?,
        radius_km: row.get(5)?,
        alert_level: enum_col(row, 6, AlertLevel::parse)?,
        confidence_score: row.get(7)?,
        report_count: count_col(row, 8)?,
        dominant_hazard_type: enum_col(row, 9, HazardType::parse)?,
        max_severity: enum_col(row, 10, Severity::parse)?,
        member_report_ids: BTreeSet::new(),
        latest_report_at: ts_col(row, 11)?,
        is_active: row.get(12)?,
        detected_at: ts_col(row, 13)?,
        last_updated: ts_col(row, 14)?,
        resolved_at,
    })
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn unknown_value(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown value '{}'", raw).into(),
    )
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| unknown_value(idx, &raw))
}

fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{report, t0};
    use crate::registry::fixtures::hotspot;
    use crate::registry::RetireReason;
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("hazardwatch.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_commit_and_load_active() {
        let (_dir, store) = store();
        let mut h = hotspot(10.0, 80.0, AlertLevel::Alert);
        h.member_report_ids = (0..3).map(|_| Uuid::new_v4()).collect();
        h.report_count = 3;

        store
            .commit(&[HotspotEvent::Created { hotspot: h.clone() }])
            .unwrap();
        assert_eq!(store.load_active().unwrap(), vec![h]);
    }

    #[test]
    fn test_retired_hotspot_leaves_active_set() {
        let (_dir, store) = store();
        let h = hotspot(10.0, 80.0, AlertLevel::Warning);
        store
            .commit(&[HotspotEvent::Created { hotspot: h.clone() }])
            .unwrap();

        let mut retired = h.clone();
        retired.is_active = false;
        retired.resolved_at = Some(t0() + Duration::hours(1));
        store
            .commit(&[HotspotEvent::Retired {
                hotspot: retired.clone(),
                reason: RetireReason::Expired,
            }])
            .unwrap();

        assert!(store.load_active().unwrap().is_empty());
        assert_eq!(store.load_retired_since(t0()).unwrap(), vec![retired]);
    }

    #[test]
    fn test_report_upsert_tracks_status() {
        let (_dir, store) = store();
        let mut r = report(10.0, 80.0, Severity::High, 0.8);
        store.save_report(&r).unwrap();
        r.status = ReportStatus::Rejected;
        store.save_report(&r).unwrap();

        let loaded = store.load_reports_since(t0() - Duration::hours(1)).unwrap();
        assert_eq!(loaded, vec![r.clone()]);
        assert_eq!(store.get_report(&r.id).unwrap(), Some(r));
        assert!(store.load_reports_since(t0() + Duration::hours(1)).unwrap().is_empty());
    }

    #[test]
    fn test_signals_roundtrip_with_missing_location() {
        let (_dir, store) = store();
        let signal = SocialSignal {
            id: Uuid::new_v4(),
            latitude: None,
            longitude: None,
            hazard_type: Some(HazardType::Cyclone),
            confidence_score: 0.6,
            observed_at: t0(),
        };
        store.save_signal(&signal).unwrap();
        store.save_signal(&signal).unwrap();
        assert_eq!(store.load_signals_since(t0()).unwrap(), vec![signal]);
    }

    #[test]
    fn test_run_lease_excludes_other_holders() {
        let (_dir, store) = store();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let ttl = StdDuration::from_secs(60);

        assert!(store.acquire_run_lease(a, ttl).unwrap());
        assert!(!store.acquire_run_lease(b, ttl).unwrap());
        assert!(store.acquire_run_lease(a, ttl).unwrap());

        // Releasing someone else's lease is a no-op.
        store.release_run_lease(b).unwrap();
        assert!(!store.acquire_run_lease(b, ttl).unwrap());

        store.release_run_lease(a).unwrap();
        assert!(store.acquire_run_lease(b, ttl).unwrap());
    }

    #[test]
    fn test_run_lease_is_shared_across_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hazardwatch.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();
        let ttl = StdDuration::from_secs(60);

        assert!(first.acquire_run_lease(Uuid::new_v4(), ttl).unwrap());
        assert!(!second.acquire_run_lease(Uuid::new_v4(), ttl).unwrap());
    }

    #[test]
    fn test_expired_run_lease_is_taken_over() {
        let (_dir, store) = store();
        assert!(store
            .acquire_run_lease(Uuid::new_v4(), StdDuration::from_millis(1))
            .unwrap());
        std::thread::sleep(StdDuration::from_millis(20));
        assert!(store
            .acquire_run_lease(Uuid::new_v4(), StdDuration::from_secs(60))
            .unwrap());
    }

    #[test]
    fn test_run_history_newest_first() {
        let (_dir, store) = store();
        let first = RunRecord::started(t0());
        let mut second = RunRecord::started(t0() + Duration::minutes(5));
        second.status = RunStatus::Failed;
        second.error = Some("disk full".to_string());
        store.record_run(&first).unwrap();
        store.record_run(&second).unwrap();

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs, vec![second, first]);
        assert_eq!(store.list_runs(1).unwrap().len(), 1);
    }
}
