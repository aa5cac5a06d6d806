//! End-to-end hotspot lifecycle through the public service API.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use hazardwatch::config::HazardwatchConfig;
use hazardwatch::detect::AlertLevel;
use hazardwatch::model::{HazardType, Report, ReportStatus, Severity};
use hazardwatch::registry::{Hotspot, HotspotEvent, HotspotFilter, RetireReason};
use hazardwatch::service::HotspotService;
use hazardwatch::storage::{HotspotStore, SqliteStore};

const KM_PER_DEGREE: f64 = 111.195;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn report_at(km_north: f64, severity: Severity) -> Report {
    Report {
        id: Uuid::new_v4(),
        latitude: 13.0 + km_north / KM_PER_DEGREE,
        longitude: 80.3,
        hazard_type: HazardType::StormSurge,
        severity,
        confidence_score: 0.8,
        occurred_at: t0(),
        status: ReportStatus::Verified,
    }
}

async fn service(dir: &TempDir) -> HotspotService {
    let mut config = HazardwatchConfig::default();
    config.storage.retry_backoff_ms = 1;
    let store: Arc<dyn HotspotStore> =
        Arc::new(SqliteStore::open(&dir.path().join("hazardwatch.db")).unwrap());
    HotspotService::open(config, store).await.unwrap()
}

fn active_in_db(dir: &TempDir) -> Vec<Hotspot> {
    SqliteStore::open(&dir.path().join("hazardwatch.db"))
        .unwrap()
        .load_active()
        .unwrap()
}

fn partitions(service: &HotspotService) -> BTreeSet<BTreeSet<Uuid>> {
    service
        .snapshot()
        .iter()
        .map(|h| h.member_report_ids.clone())
        .collect()
}

#[tokio::test]
async fn test_insertion_order_does_not_change_hotspots() {
    let mut reports: Vec<Report> = [0.0, 0.3, 0.6, 0.9, 10.0, 10.4, 10.8, 25.0]
        .iter()
        .map(|km| report_at(*km, Severity::Medium))
        .collect();

    let dir_a = TempDir::new().unwrap();
    let forward = service(&dir_a).await;
    for r in &reports {
        forward.submit_report(r.clone()).await.unwrap();
    }
    forward.run_once(t0()).await.unwrap();

    reports.reverse();
    reports.swap(1, 5);
    let dir_b = TempDir::new().unwrap();
    let shuffled = service(&dir_b).await;
    for r in &reports {
        shuffled.submit_report(r.clone()).await.unwrap();
    }
    shuffled.run_once(t0()).await.unwrap();

    assert_eq!(forward.snapshot().len(), 2);
    assert_eq!(partitions(&forward), partitions(&shuffled));
}

#[tokio::test]
async fn test_bridging_reports_merge_two_hotspots() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;
    let mut events = service.subscribe();

    for km in [0.0, 0.2, 0.4, 3.0, 3.2, 3.4] {
        service.submit_report(report_at(km, Severity::High)).await.unwrap();
    }
    let first = service.run_once(t0()).await.unwrap();
    assert_eq!(first.record.created, 2);
    let near_id = service
        .snapshot()
        .iter()
        .min_by(|a, b| a.center_latitude.total_cmp(&b.center_latitude))
        .map(|h| h.id)
        .unwrap();

    service.submit_report(report_at(1.2, Severity::High)).await.unwrap();
    let second = service.run_once(t0() + Duration::minutes(5)).await.unwrap();

    let snapshot = service.snapshot();
    assert_eq!(snapshot.len(), 1);
    let merged = snapshot.get(&near_id).expect("nearest hotspot survives");
    assert_eq!(merged.report_count, 7);
    assert_eq!(second.record.updated, 1);
    assert_eq!(second.record.retired, 1);
    assert!(second.events.iter().any(|e| matches!(
        e,
        HotspotEvent::Retired { reason: RetireReason::Merged, .. }
    )));

    // Subscribers saw both runs, in order.
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds.iter().filter(|k| **k == "created").count(), 2);
    assert_eq!(kinds.last().copied(), Some("retired"));
}

#[tokio::test]
async fn test_escalation_and_query_filters() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir).await;

    for km in [0.0, 0.2, 0.4] {
        service.submit_report(report_at(km, Severity::Low)).await.unwrap();
    }
    service.run_once(t0()).await.unwrap();
    let alerting = HotspotFilter {
        min_alert_level: Some(AlertLevel::Alert),
        ..HotspotFilter::default()
    };
    assert_eq!(service.query(&HotspotFilter::default()).len(), 1);
    assert!(service.query(&alerting).is_empty());

    let mut critical = report_at(0.6, Severity::Critical);
    critical.confidence_score = 0.95;
    service.submit_report(critical).await.unwrap();
    let run = service.run_once(t0() + Duration::minutes(5)).await.unwrap();

    match run.events.as_slice() {
        [HotspotEvent::Updated {
            hotspot,
            previous_alert_level,
            alert_level_changed,
        }] => {
            assert_eq!(*previous_alert_level, AlertLevel::Warning);
            assert_eq!(hotspot.alert_level, AlertLevel::Emergency);
            assert!(*alert_level_changed);
        }
        other => panic!("unexpected events {:?}", other),
    }
    assert_eq!(service.query(&alerting).len(), 1);

    let elsewhere = HotspotFilter {
        bbox: Some("-5,-5,5,5".parse().unwrap()),
        ..HotspotFilter::default()
    };
    assert!(service.query(&elsewhere).is_empty());
}

#[tokio::test]
async fn test_two_services_on_one_database_share_hotspots() {
    let dir = TempDir::new().unwrap();
    let daemon = service(&dir).await;
    let cli = service(&dir).await;

    for km in [0.0, 0.2, 0.4, 0.6, 0.8] {
        cli.submit_report(report_at(km, Severity::High)).await.unwrap();
    }
    let first = cli.run_once(t0()).await.unwrap();
    assert_eq!(first.record.created, 1);

    let second = daemon.run_once(t0() + Duration::minutes(1)).await.unwrap();
    assert_eq!(second.record.reports_considered, 5);
    assert_eq!(second.record.created, 0);
    assert!(second.events.is_empty());

    let stored = active_in_db(&dir);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].report_count, 5);
    assert_eq!(partitions(&daemon), partitions(&cli));
    assert!(daemon.snapshot().get(&stored[0].id).is_some());
}

#[tokio::test]
async fn test_running_service_sees_reports_ingested_elsewhere() {
    let dir = TempDir::new().unwrap();
    let daemon = service(&dir).await;
    assert_eq!(daemon.indexed_reports(), 0);

    let ingester = service(&dir).await;
    for km in [0.0, 0.2, 0.4, 0.6, 0.8] {
        ingester.submit_report(report_at(km, Severity::High)).await.unwrap();
    }
    drop(ingester);

    let run = daemon.run_once(t0()).await.unwrap();
    assert_eq!(run.record.reports_considered, 5);
    assert_eq!(run.record.created, 1);
    assert_eq!(daemon.indexed_reports(), 5);
}

#[tokio::test]
async fn test_concurrent_runs_never_claim_a_report_twice() {
    let dir = TempDir::new().unwrap();
    let a = service(&dir).await;
    let b = service(&dir).await;
    for km in [0.0, 0.2, 0.4, 0.6, 0.8] {
        a.submit_report(report_at(km, Severity::High)).await.unwrap();
    }

    let (ra, rb) = tokio::join!(a.run_once(t0()), b.run_once(t0()));
    assert!(ra.is_ok() || rb.is_ok());

    let stored = active_in_db(&dir);
    assert_eq!(stored.len(), 1);
    let mut seen = BTreeSet::new();
    for hotspot in &stored {
        for id in &hotspot.member_report_ids {
            assert!(seen.insert(*id), "report {} claimed twice", id);
        }
    }
}
