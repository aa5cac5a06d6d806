//! In-memory spatial index over active hazard reports.
//!
//! Reports are stored as `[lng, lat]` points in an R-tree. Radius queries
//! query the tree with a degree envelope that bounds the search circle, then
//! keep only reports whose haversine distance is within the radius; a planar
//! approximation is not good enough for coastlines spanning tens of degrees
//! of longitude.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rstar::{RTree, RTreeObject, AABB};
use uuid::Uuid;

use crate::model::{GeoPoint, Report};

/// Mean earth radius in kilometres, matching `geo`'s haversine radius.
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Slack added to envelopes so points exactly on the circle survive rounding.
const ENVELOPE_SLACK_DEG: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
struct IndexedReport {
    id: Uuid,
    position: [f64; 2],
}

impl RTreeObject for IndexedReport {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

/// Spatial index of reports keyed by id.
///
/// Not synchronized; the service keeps it behind a mutex and clones it to
/// take a run snapshot.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    tree: RTree<IndexedReport>,
    reports: HashMap<Uuid, Report>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a report. Returns `false` (and changes nothing) when a report
    /// with the same id is already present.
    pub fn insert(&mut self, report: Report) -> bool {
        if self.reports.contains_key(&report.id) {
            return false;
        }
        self.tree.insert(IndexedReport {
            id: report.id,
            position: [report.longitude, report.latitude],
        });
        self.reports.insert(report.id, report);
        true
    }

    /// Remove a report by id, returning it if it was present.
    pub fn remove(&mut self, id: &Uuid) -> Option<Report> {
        let report = self.reports.remove(id)?;
        self.tree.remove(&IndexedReport {
            id: report.id,
            position: [report.longitude, report.latitude],
        });
        Some(report)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Report> {
        self.reports.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.reports.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    /// Ids of all reports in ascending order.
    pub fn sorted_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.reports.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All report ids within `radius_km` (great-circle) of `point`, sorted.
    pub fn query_radius(&self, point: &GeoPoint, radius_km: f64) -> Vec<Uuid> {
        if !(radius_km >= 0.0) {
            return Vec::new();
        }
        let mut ids = Vec::new();
        for envelope in search_envelopes(point, radius_km) {
            for entry in self.tree.locate_in_envelope(&envelope) {
                let candidate = GeoPoint::new(entry.position[1], entry.position[0]);
                if point.haversine_km(&candidate) <= radius_km {
                    ids.push(entry.id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Evict every report that occurred more than `max_age` before `now`.
    /// Returns the evicted ids, sorted.
    pub fn active_window(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<Uuid> {
        let cutoff = now - max_age;
        let mut expired: Vec<Uuid> = self
            .reports
            .values()
            .filter(|r| r.occurred_at < cutoff)
            .map(|r| r.id)
            .collect();
        expired.sort();
        for id in &expired {
            self.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), %cutoff, "evicted expired reports");
        }
        expired
    }
}

/// Degree envelopes covering the circle of `radius_km` around `center`.
///
/// Uses the exact spherical bounding-coordinates formula. Circles that reach
/// a pole cover every longitude; circles crossing the antimeridian are split
/// into two boxes.
fn search_envelopes(center: &GeoPoint, radius_km: f64) -> Vec<AABB<[f64; 2]>> {
    let angular = radius_km / EARTH_RADIUS_KM;
    let dlat = angular.to_degrees() + ENVELOPE_SLACK_DEG;
    let south = center.latitude - dlat;
    let north = center.latitude + dlat;

    if south <= -90.0 || north >= 90.0 {
        return vec![AABB::from_corners(
            [-180.0, south.max(-90.0)],
            [180.0, north.min(90.0)],
        )];
    }

    let ratio = angular.sin() / center.latitude.to_radians().cos();
    if !(ratio < 1.0) || angular >= std::f64::consts::FRAC_PI_2 {
        return vec![AABB::from_corners([-180.0, south], [180.0, north])];
    }
    let dlng = ratio.asin().to_degrees() + ENVELOPE_SLACK_DEG;
    if dlng >= 180.0 {
        return vec![AABB::from_corners([-180.0, south], [180.0, north])];
    }

    let west = center.longitude - dlng;
    let east = center.longitude + dlng;
    if west < -180.0 {
        vec![
            AABB::from_corners([west + 360.0, south], [180.0, north]),
            AABB::from_corners([-180.0, south], [east, north]),
        ]
    } else if east > 180.0 {
        vec![
            AABB::from_corners([west, south], [180.0, north]),
            AABB::from_corners([-180.0, south], [east - 360.0, north]),
        ]
    } else {
        vec![AABB::from_corners([west, south], [east, north])]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{north_of, report, t0};
    use crate::model::Severity;

    #[test]
    fn test_insert_is_idempotent_by_id() {
        let mut index = SpatialIndex::new();
        let r = report(10.0, 80.0, Severity::High, 0.8);
        assert!(index.insert(r.clone()));
        assert!(!index.insert(r.clone()));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut index = SpatialIndex::new();
        assert!(index.remove(&Uuid::new_v4()).is_none());

        let r = report(10.0, 80.0, Severity::High, 0.8);
        index.insert(r.clone());
        assert_eq!(index.remove(&r.id).map(|x| x.id), Some(r.id));
        assert!(index.is_empty());
        assert!(index
            .query_radius(&GeoPoint::new(10.0, 80.0), 5.0)
            .is_empty());
    }

    #[test]
    fn test_query_radius_uses_great_circle_distance() {
        let mut index = SpatialIndex::new();
        let near = report(north_of(10.0, 1.5), 80.0, Severity::Low, 0.5);
        let far = report(north_of(10.0, 2.5), 80.0, Severity::Low, 0.5);
        index.insert(near.clone());
        index.insert(far.clone());

        let hits = index.query_radius(&GeoPoint::new(10.0, 80.0), 2.0);
        assert_eq!(hits, vec![near.id]);
    }

    #[test]
    fn test_query_radius_high_latitude_longitude_span() {
        // At 60N one degree of longitude is ~55.6 km, so a planar degree
        // box sized for the equator would miss this neighbour.
        let mut index = SpatialIndex::new();
        let r = report(60.0, 10.9, Severity::Low, 0.5);
        index.insert(r.clone());
        let hits = index.query_radius(&GeoPoint::new(60.0, 10.0), 60.0);
        assert_eq!(hits, vec![r.id]);
    }

    #[test]
    fn test_query_radius_across_antimeridian() {
        let mut index = SpatialIndex::new();
        let east = report(0.0, 179.995, Severity::Low, 0.5);
        let west = report(0.0, -179.995, Severity::Low, 0.5);
        index.insert(east.clone());
        index.insert(west.clone());

        let hits = index.query_radius(&GeoPoint::new(0.0, 179.999), 2.0);
        let mut expected = vec![east.id, west.id];
        expected.sort();
        assert_eq!(hits, expected);
    }

    #[test]
    fn test_query_radius_near_pole() {
        let mut index = SpatialIndex::new();
        let r = report(89.99, -120.0, Severity::Low, 0.5);
        index.insert(r.clone());
        let hits = index.query_radius(&GeoPoint::new(89.99, 60.0), 5.0);
        assert_eq!(hits, vec![r.id]);
    }

    #[test]
    fn test_active_window_evicts_old_reports() {
        let mut index = SpatialIndex::new();
        let mut old = report(10.0, 80.0, Severity::Low, 0.5);
        old.occurred_at = t0() - Duration::hours(80);
        let fresh = report(10.0, 80.0, Severity::Low, 0.5);
        index.insert(old.clone());
        index.insert(fresh.clone());

        let evicted = index.active_window(t0(), Duration::hours(72));
        assert_eq!(evicted, vec![old.id]);
        assert!(!index.contains(&old.id));
        assert_eq!(
            index.query_radius(&GeoPoint::new(10.0, 80.0), 1.0),
            vec![fresh.id]
        );
    }

    #[test]
    fn test_clone_is_an_independent_snapshot() {
        let mut index = SpatialIndex::new();
        index.insert(report(10.0, 80.0, Severity::Low, 0.5));
        let snapshot = index.clone();
        index.insert(report(10.0, 80.0, Severity::Low, 0.5));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(index.len(), 2);
    }
}
