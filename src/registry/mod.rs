//! Hotspot registry: the persistent, named view of clusters across runs.
//!
//! The registry owns the active hotspot set. Runs build a complete
//! replacement with [`reconcile::reconcile`], persist it, and only then
//! [`HotspotRegistry::swap`] it in. Readers take an `Arc` snapshot and never
//! observe a half-applied run.

pub mod reconcile;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::AlertLevel;
use crate::model::{BoundingBox, GeoPoint, HazardType, Severity};

pub use self::reconcile::{reconcile, Reconciliation};

/// A persistent cluster of correlated hazard reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub id: Uuid,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_km: f64,
    pub name: String,
    pub description: String,
    pub alert_level: AlertLevel,
    pub confidence_score: f64,
    pub report_count: usize,
    pub dominant_hazard_type: HazardType,
    pub max_severity: Severity,
    pub member_report_ids: BTreeSet<Uuid>,
    pub latest_report_at: DateTime<Utc>,
    pub is_active: bool,
    pub detected_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Hotspot {
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(self.center_latitude, self.center_longitude)
    }
}

/// Why a hotspot left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Its newest report fell out of the active window.
    Expired,
    /// Every remaining member was claimed by another hotspot's cluster.
    Merged,
    /// Its members were withdrawn or evicted.
    Emptied,
}

impl RetireReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetireReason::Expired => "expired",
            RetireReason::Merged => "merged",
            RetireReason::Emptied => "emptied",
        }
    }
}

/// Lifecycle notifications, published once per committed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HotspotEvent {
    Created {
        hotspot: Hotspot,
    },
    Updated {
        hotspot: Hotspot,
        previous_alert_level: AlertLevel,
        alert_level_changed: bool,
    },
    Retired {
        hotspot: Hotspot,
        reason: RetireReason,
    },
}

impl HotspotEvent {
    /// The hotspot state after the transition.
    pub fn hotspot(&self) -> &Hotspot {
        match self {
            HotspotEvent::Created { hotspot }
            | HotspotEvent::Updated { hotspot, .. }
            | HotspotEvent::Retired { hotspot, .. } => hotspot,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HotspotEvent::Created { .. } => "created",
            HotspotEvent::Updated { .. } => "updated",
            HotspotEvent::Retired { .. } => "retired",
        }
    }
}

/// Map/dashboard query parameters. Empty filter matches every hotspot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotspotFilter {
    pub bbox: Option<BoundingBox>,
    pub min_alert_level: Option<AlertLevel>,
    pub hazard_type: Option<HazardType>,
}

impl HotspotFilter {
    pub fn matches(&self, hotspot: &Hotspot) -> bool {
        if let Some(bbox) = &self.bbox {
            if !bbox.contains(&hotspot.center()) {
                return false;
            }
        }
        if let Some(level) = self.min_alert_level {
            if hotspot.alert_level < level {
                return false;
            }
        }
        if let Some(hazard) = self.hazard_type {
            if hotspot.dominant_hazard_type != hazard {
                return false;
            }
        }
        true
    }
}

/// Immutable set of active hotspots keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HotspotSet {
    hotspots: BTreeMap<Uuid, Hotspot>,
}

impl HotspotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Hotspot> {
        self.hotspots.get(id)
    }

    pub fn len(&self) -> usize {
        self.hotspots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hotspots.is_empty()
    }

    /// Hotspots in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Hotspot> {
        self.hotspots.values()
    }

    /// The active hotspot that currently claims `report_id`, if any.
    pub fn hotspot_for_report(&self, report_id: &Uuid) -> Option<&Hotspot> {
        self.hotspots
            .values()
            .find(|h| h.member_report_ids.contains(report_id))
    }

    /// Matching hotspots, highest alert level first, then by id.
    pub fn query(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        let mut hits: Vec<Hotspot> = self
            .hotspots
            .values()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.alert_level.cmp(&a.alert_level).then(a.id.cmp(&b.id)));
        hits
    }

    pub(crate) fn insert(&mut self, hotspot: Hotspot) {
        self.hotspots.insert(hotspot.id, hotspot);
    }
}

impl FromIterator<Hotspot> for HotspotSet {
    fn from_iter<I: IntoIterator<Item = Hotspot>>(iter: I) -> Self {
        Self {
            hotspots: iter
                .into_iter()
                .filter(|h| h.is_active)
                .map(|h| (h.id, h))
                .collect(),
        }
    }
}

/// Holder of the authoritative active set.
#[derive(Debug, Default)]
pub struct HotspotRegistry {
    active: RwLock<Arc<HotspotSet>>,
}

impl HotspotRegistry {
    pub fn new(initial: HotspotSet) -> Self {
        Self {
            active: RwLock::new(Arc::new(initial)),
        }
    }

    /// Consistent read-only view of the active set.
    pub fn snapshot(&self) -> Arc<HotspotSet> {
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the active set wholesale.
    pub fn swap(&self, next: HotspotSet) {
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
    }

    pub fn query(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        self.snapshot().query(filter)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::model::fixtures::t0;

    pub fn hotspot(lat: f64, lng: f64, level: AlertLevel) -> Hotspot {
        Hotspot {
            id: Uuid::new_v4(),
            center_latitude: lat,
            center_longitude: lng,
            radius_km: 1.0,
            name: "test hotspot".to_string(),
            description: String::new(),
            alert_level: level,
            confidence_score: 0.5,
            report_count: 0,
            dominant_hazard_type: HazardType::HighWaves,
            max_severity: Severity::Medium,
            member_report_ids: BTreeSet::new(),
            latest_report_at: t0(),
            is_active: true,
            detected_at: t0(),
            last_updated: t0(),
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::hotspot;
    use super::*;

    #[test]
    fn test_filter_by_bbox_and_level() {
        let set: HotspotSet = vec![
            hotspot(10.0, 80.0, AlertLevel::Alert),
            hotspot(10.5, 80.5, AlertLevel::Info),
            hotspot(20.0, 70.0, AlertLevel::Emergency),
        ]
        .into_iter()
        .collect();

        let filter = HotspotFilter {
            bbox: Some("9,79,11,81".parse().unwrap()),
            ..HotspotFilter::default()
        };
        assert_eq!(set.query(&filter).len(), 2);

        let filter = HotspotFilter {
            min_alert_level: Some(AlertLevel::Alert),
            ..HotspotFilter::default()
        };
        let levels: Vec<AlertLevel> = set.query(&filter).iter().map(|h| h.alert_level).collect();
        assert_eq!(levels, vec![AlertLevel::Emergency, AlertLevel::Alert]);
    }

    #[test]
    fn test_inactive_hotspots_are_not_collected() {
        let mut retired = hotspot(10.0, 80.0, AlertLevel::Alert);
        retired.is_active = false;
        let set: HotspotSet = vec![retired, hotspot(10.0, 80.0, AlertLevel::Info)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_swap() {
        let registry = HotspotRegistry::new(HotspotSet::new());
        let before = registry.snapshot();

        let next: HotspotSet = vec![hotspot(10.0, 80.0, AlertLevel::Warning)]
            .into_iter()
            .collect();
        registry.swap(next);

        assert!(before.is_empty());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = HotspotEvent::Retired {
            hotspot: hotspot(10.0, 80.0, AlertLevel::Info),
            reason: RetireReason::Expired,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retired");
        assert_eq!(json["reason"], "expired");
        assert_eq!(event.kind(), "retired");
    }
}
