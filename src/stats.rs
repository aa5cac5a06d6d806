//! Dashboard statistics. Pure projections over reports and hotspots.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::detect::AlertLevel;
use crate::model::{HazardType, Report, ReportStatus, Severity};
use crate::registry::Hotspot;

/// Span counted as "recent" in report statistics.
pub const RECENT_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportStatistics {
    pub total_reports: usize,
    pub recent_reports: usize,
    /// Every status is present, zero counts included.
    pub by_status: BTreeMap<ReportStatus, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_hazard_type: BTreeMap<HazardType, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HotspotStatistics {
    pub active_hotspots: usize,
    pub by_alert_level: BTreeMap<AlertLevel, usize>,
    pub member_reports: usize,
    pub mean_confidence: Option<f64>,
    pub highest_alert_level: Option<AlertLevel>,
}

pub fn report_statistics<'a, I>(reports: I, now: DateTime<Utc>) -> ReportStatistics
where
    I: IntoIterator<Item = &'a Report>,
{
    let recent_cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
    let mut stats = ReportStatistics {
        total_reports: 0,
        recent_reports: 0,
        by_status: ReportStatus::ALL.iter().map(|s| (*s, 0)).collect(),
        by_severity: Severity::ALL.iter().map(|s| (*s, 0)).collect(),
        by_hazard_type: BTreeMap::new(),
    };

    for report in reports {
        stats.total_reports += 1;
        if report.occurred_at >= recent_cutoff {
            stats.recent_reports += 1;
        }
        *stats.by_status.entry(report.status).or_default() += 1;
        *stats.by_severity.entry(report.severity).or_default() += 1;
        *stats.by_hazard_type.entry(report.hazard_type).or_default() += 1;
    }
    stats
}

pub fn hotspot_statistics<'a, I>(hotspots: I) -> HotspotStatistics
where
    I: IntoIterator<Item = &'a Hotspot>,
{
    let mut by_alert_level: BTreeMap<AlertLevel, usize> =
        AlertLevel::ALL.iter().map(|l| (*l, 0)).collect();
    let mut active_hotspots = 0;
    let mut member_reports = 0;
    let mut confidence_sum = 0.0;
    let mut highest_alert_level = None;

    for hotspot in hotspots.into_iter().filter(|h| h.is_active) {
        active_hotspots += 1;
        member_reports += hotspot.member_report_ids.len();
        confidence_sum += hotspot.confidence_score;
        *by_alert_level.entry(hotspot.alert_level).or_default() += 1;
        highest_alert_level = highest_alert_level.max(Some(hotspot.alert_level));
    }

    HotspotStatistics {
        active_hotspots,
        by_alert_level,
        member_reports,
        mean_confidence: (active_hotspots > 0).then(|| confidence_sum / active_hotspots as f64),
        highest_alert_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{report, t0};
    use crate::registry::fixtures::hotspot;
    use uuid::Uuid;

    #[test]
    fn test_report_statistics_counts() {
        let mut reports = vec![
            report(10.0, 80.0, Severity::High, 0.8),
            report(10.0, 80.0, Severity::Low, 0.4),
            report(10.0, 80.0, Severity::High, 0.6),
        ];
        reports[1].status = ReportStatus::Pending;
        reports[2].hazard_type = HazardType::Flooding;
        reports[2].occurred_at = t0() - Duration::days(45);

        let stats = report_statistics(&reports, t0());
        assert_eq!(stats.total_reports, 3);
        assert_eq!(stats.recent_reports, 2);
        assert_eq!(stats.by_status[&ReportStatus::Verified], 2);
        assert_eq!(stats.by_status[&ReportStatus::Pending], 1);
        assert_eq!(stats.by_status[&ReportStatus::Rejected], 0);
        assert_eq!(stats.by_severity[&Severity::High], 2);
        assert_eq!(stats.by_hazard_type[&HazardType::HighWaves], 2);
        assert_eq!(stats.by_hazard_type.get(&HazardType::Tsunami), None);
    }

    #[test]
    fn test_hotspot_statistics() {
        let empty = hotspot_statistics(&Vec::<Hotspot>::new());
        assert_eq!(empty.active_hotspots, 0);
        assert_eq!(empty.mean_confidence, None);
        assert_eq!(empty.highest_alert_level, None);

        let mut a = hotspot(10.0, 80.0, AlertLevel::Alert);
        a.confidence_score = 0.8;
        a.member_report_ids = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut b = hotspot(12.0, 80.0, AlertLevel::Warning);
        b.confidence_score = 0.4;
        b.member_report_ids = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut retired = hotspot(14.0, 80.0, AlertLevel::Emergency);
        retired.is_active = false;

        let stats = hotspot_statistics(&[a, b, retired]);
        assert_eq!(stats.active_hotspots, 2);
        assert_eq!(stats.member_reports, 7);
        assert_eq!(stats.by_alert_level[&AlertLevel::Alert], 1);
        assert_eq!(stats.by_alert_level[&AlertLevel::Emergency], 0);
        assert_eq!(stats.highest_alert_level, Some(AlertLevel::Alert));
        assert!((stats.mean_confidence.unwrap() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_serialize_with_named_keys() {
        let stats = report_statistics(&[report(10.0, 80.0, Severity::Critical, 0.9)], t0());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["by_severity"]["critical"], 1);
        assert_eq!(json["by_status"]["verified"], 1);
    }
}
