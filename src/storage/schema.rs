//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            hazard_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            occurred_at TEXT NOT NULL,
            status TEXT NOT NULL,
            received_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS social_signals (
            id TEXT PRIMARY KEY,
            latitude REAL,
            longitude REAL,
            hazard_type TEXT,
            confidence_score REAL NOT NULL,
            observed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hotspots (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            center_latitude REAL NOT NULL,
            center_longitude REAL NOT NULL,
            radius_km REAL NOT NULL,
            alert_level TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            report_count INTEGER NOT NULL,
            dominant_hazard_type TEXT NOT NULL,
            max_severity TEXT NOT NULL,
            latest_report_at TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            detected_at TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS hotspot_reports (
            hotspot_id TEXT NOT NULL,
            report_id TEXT NOT NULL,
            PRIMARY KEY (hotspot_id, report_id),
            FOREIGN KEY (hotspot_id) REFERENCES hotspots(id)
        );

        CREATE TABLE IF NOT EXISTS run_history (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            reports_considered INTEGER NOT NULL DEFAULT 0,
            clusters_found INTEGER NOT NULL DEFAULT 0,
            noise INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            retired INTEGER NOT NULL DEFAULT 0,
            write_attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS run_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reports_occurred ON reports(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_signals_observed ON social_signals(observed_at);
        CREATE INDEX IF NOT EXISTS idx_hotspots_active ON hotspots(is_active);
        CREATE INDEX IF NOT EXISTS idx_hotspot_reports_report ON hotspot_reports(report_id);
        CREATE INDEX IF NOT EXISTS idx_run_history_started ON run_history(started_at);",
    )?;

    // Migration: record the schema version once
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (1)",
        [],
    )?;

    Ok(())
}
