//! Density-based (DBSCAN-style) clustering over a spatial index snapshot.
//!
//! Core points have at least `min_points` reports (themselves included)
//! within `eps_km`. Clusters are the connected components of core points;
//! border points join the cluster of their nearest core neighbour. Because
//! border assignment does not depend on which component expands first, the
//! partition is the same for any insertion or traversal order.
//!
//! Unlike classic DBSCAN, a component whose border points went to nearer
//! cores elsewhere can end up below `min_points`; it is then discarded and
//! all of its members, core points included, are reported as noise.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use uuid::Uuid;

use super::ClusterError;
use crate::model::GeoPoint;
use crate::spatial::SpatialIndex;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub eps_km: f64,
    pub min_points: usize,
    /// Fractional margin added to the member-derived radius.
    pub radius_margin: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps_km: 2.0,
            min_points: 3,
            radius_margin: 0.1,
        }
    }
}

/// An unscored group of reports produced by one clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub member_report_ids: BTreeSet<Uuid>,
    /// Arithmetic mean of member coordinates. Not a geodesic centroid, which
    /// is acceptable for extents under ~100 km.
    pub centroid: GeoPoint,
    pub radius_km: f64,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.member_report_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_report_ids.is_empty()
    }
}

/// Result of one clustering pass.
#[derive(Debug, Clone, Default)]
pub struct Clustering {
    /// Ordered by smallest member id.
    pub clusters: Vec<Cluster>,
    pub noise: Vec<Uuid>,
}

pub struct Clusterer {
    params: ClusterParams,
}

impl Clusterer {
    pub fn new(params: ClusterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Cluster every report in `index`.
    pub fn run(&self, index: &SpatialIndex) -> Result<Clustering, ClusterError> {
        let ClusterParams {
            eps_km,
            min_points,
            radius_margin,
        } = self.params;
        if !(eps_km > 0.0) || min_points == 0 || !(radius_margin >= 0.0) {
            return Err(ClusterError::InvariantViolation(format!(
                "invalid parameters: eps_km={}, min_points={}, radius_margin={}",
                eps_km, min_points, radius_margin
            )));
        }

        let ids = index.sorted_ids();
        if ids.is_empty() {
            return Ok(Clustering::default());
        }

        let mut neighbors: HashMap<Uuid, Vec<Uuid>> = HashMap::with_capacity(ids.len());
        for id in &ids {
            let report = index.get(id).ok_or(ClusterError::UnknownMember(*id))?;
            neighbors.insert(*id, index.query_radius(&report.location(), eps_km));
        }

        let is_core = |id: &Uuid| neighbors.get(id).map_or(false, |n| n.len() >= min_points);

        // Connected components over core points, seeded in id order.
        let mut labels: HashMap<Uuid, usize> = HashMap::new();
        let mut next_label = 0usize;
        for id in &ids {
            if !is_core(id) || labels.contains_key(id) {
                continue;
            }
            let label = next_label;
            next_label += 1;
            labels.insert(*id, label);

            let mut frontier = VecDeque::from([*id]);
            while let Some(current) = frontier.pop_front() {
                for neighbor in &neighbors[&current] {
                    if is_core(neighbor) && !labels.contains_key(neighbor) {
                        labels.insert(*neighbor, label);
                        frontier.push_back(*neighbor);
                    }
                }
            }
        }

        // Border points attach to their nearest core neighbour.
        let mut border_labels: Vec<(Uuid, usize)> = Vec::new();
        for id in &ids {
            if is_core(id) {
                continue;
            }
            let Some(report) = index.get(id) else {
                return Err(ClusterError::UnknownMember(*id));
            };
            let here = report.location();
            let mut best: Option<(f64, Uuid)> = None;
            for neighbor in &neighbors[id] {
                if !is_core(neighbor) {
                    continue;
                }
                let other = index
                    .get(neighbor)
                    .ok_or(ClusterError::UnknownMember(*neighbor))?;
                let d = here.haversine_km(&other.location());
                let closer = match best {
                    None => true,
                    Some((best_d, best_id)) => d < best_d || (d == best_d && *neighbor < best_id),
                };
                if closer {
                    best = Some((d, *neighbor));
                }
            }
            if let Some((_, core_id)) = best {
                border_labels.push((*id, labels[&core_id]));
            }
        }
        labels.extend(border_labels);

        let mut groups: BTreeMap<usize, BTreeSet<Uuid>> = BTreeMap::new();
        for (id, label) in &labels {
            groups.entry(*label).or_default().insert(*id);
        }

        let mut clusters = Vec::new();
        let mut clustered: BTreeSet<Uuid> = BTreeSet::new();
        for (_, members) in groups {
            if members.len() < min_points {
                tracing::debug!(
                    size = members.len(),
                    min_points,
                    "discarding undersized component"
                );
                continue;
            }
            let cluster = self.build_cluster(index, members)?;
            clustered.extend(cluster.member_report_ids.iter().copied());
            clusters.push(cluster);
        }
        clusters.sort_by_key(|c| c.member_report_ids.iter().next().copied());

        let noise = ids.into_iter().filter(|id| !clustered.contains(id)).collect();
        Ok(Clustering { clusters, noise })
    }

    fn build_cluster(
        &self,
        index: &SpatialIndex,
        members: BTreeSet<Uuid>,
    ) -> Result<Cluster, ClusterError> {
        if members.len() < self.params.min_points {
            return Err(ClusterError::InvariantViolation(format!(
                "cluster of {} members is below min_points {}",
                members.len(),
                self.params.min_points
            )));
        }
        summarize(index, members, self.params.radius_margin)
    }
}

/// Centroid and radius for an arbitrary member set. Used for fresh clusters
/// and for re-summarizing hotspots whose membership shrank.
pub fn summarize(
    index: &SpatialIndex,
    members: BTreeSet<Uuid>,
    radius_margin: f64,
) -> Result<Cluster, ClusterError> {
    if members.is_empty() {
        return Err(ClusterError::InvariantViolation(
            "cluster has no members".to_string(),
        ));
    }
    let mut points = Vec::with_capacity(members.len());
    for id in &members {
        let report = index.get(id).ok_or(ClusterError::UnknownMember(*id))?;
        points.push(report.location());
    }

    let centroid = mean_centroid(&points);
    let max_distance = points
        .iter()
        .map(|p| centroid.haversine_km(p))
        .fold(0.0_f64, f64::max);
    let radius_km = max_distance * (1.0 + radius_margin);

    if !radius_km.is_finite() || radius_km < 0.0 {
        return Err(ClusterError::InvariantViolation(format!(
            "radius {} is not a non-negative finite number",
            radius_km
        )));
    }
    if points.iter().any(|p| centroid.haversine_km(p) > radius_km) {
        return Err(ClusterError::InvariantViolation(
            "member lies outside cluster radius".to_string(),
        ));
    }

    Ok(Cluster {
        member_report_ids: members,
        centroid,
        radius_km,
    })
}

/// Mean latitude/longitude. Longitudes are unwrapped first when the points
/// straddle the antimeridian so the mean lands between them.
fn mean_centroid(points: &[GeoPoint]) -> GeoPoint {
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.latitude).sum::<f64>() / n;

    let min_lng = points.iter().map(|p| p.longitude).fold(f64::INFINITY, f64::min);
    let max_lng = points
        .iter()
        .map(|p| p.longitude)
        .fold(f64::NEG_INFINITY, f64::max);
    let wraps = max_lng - min_lng > 180.0;

    let mut lng = points
        .iter()
        .map(|p| {
            if wraps && p.longitude < 0.0 {
                p.longitude + 360.0
            } else {
                p.longitude
            }
        })
        .sum::<f64>()
        / n;
    if lng > 180.0 {
        lng -= 360.0;
    }
    GeoPoint::new(lat, lng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{north_of, report};
    use crate::model::{Report, Severity};

    fn params(eps_km: f64, min_points: usize) -> ClusterParams {
        ClusterParams {
            eps_km,
            min_points,
            radius_margin: 0.1,
        }
    }

    fn index_of(reports: &[Report]) -> SpatialIndex {
        let mut index = SpatialIndex::new();
        for r in reports {
            index.insert(r.clone());
        }
        index
    }

    fn tight_group(lat: f64, lng: f64, n: usize) -> Vec<Report> {
        (0..n)
            .map(|i| report(north_of(lat, 0.2 * i as f64), lng, Severity::High, 0.8))
            .collect()
    }

    #[test]
    fn test_empty_index_yields_no_clusters() {
        let result = Clusterer::new(params(2.0, 3)).run(&SpatialIndex::new()).unwrap();
        assert!(result.clusters.is_empty());
        assert!(result.noise.is_empty());
    }

    #[test]
    fn test_single_critical_report_is_noise() {
        let r = report(10.0, 80.0, Severity::Critical, 1.0);
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&[r.clone()])).unwrap();
        assert!(result.clusters.is_empty());
        assert_eq!(result.noise, vec![r.id]);
    }

    #[test]
    fn test_tight_group_forms_one_cluster() {
        let group = tight_group(10.0, 80.0, 5);
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&group)).unwrap();
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].len(), 5);
        assert!(result.noise.is_empty());
    }

    #[test]
    fn test_distant_pair_is_noise() {
        let a = report(10.0, 80.0, Severity::High, 0.8);
        let b = report(north_of(10.0, 50.0), 80.0, Severity::High, 0.8);
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&[a, b])).unwrap();
        assert!(result.clusters.is_empty());
        assert_eq!(result.noise.len(), 2);
    }

    #[test]
    fn test_separate_groups_form_separate_clusters() {
        let mut reports = tight_group(10.0, 80.0, 4);
        reports.extend(tight_group(12.0, 80.0, 3));
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&reports)).unwrap();
        assert_eq!(result.clusters.len(), 2);
        let sizes: BTreeSet<usize> = result.clusters.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, BTreeSet::from([3, 4]));
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // Three reports packed together plus one 1.9 km away: the outlier has
        // only two neighbours (itself and the nearest core) but is absorbed.
        let mut reports = tight_group(10.0, 80.0, 3);
        let border = report(north_of(10.0, 0.4 + 1.9), 80.0, Severity::Low, 0.3);
        reports.push(border.clone());
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&reports)).unwrap();
        assert_eq!(result.clusters.len(), 1);
        assert!(result.clusters[0].member_report_ids.contains(&border.id));
    }

    #[test]
    fn test_core_that_loses_its_border_becomes_noise() {
        // Offsets in km along one meridian, eps 1 km, min_points 4.
        // The core at 0.0 reaches 0.9 but the core at 1.5 is nearer to it,
        // leaving {-0.9, -0.8, 0.0}: one short of a cluster.
        let at = |km: f64| report(north_of(10.0, km), 80.0, Severity::High, 0.8);
        let stranded: Vec<Report> = [-0.9, -0.8, 0.0].into_iter().map(at).collect();
        let dense: Vec<Report> = [0.9, 1.5, 2.0, 2.1, 2.2].into_iter().map(at).collect();
        let mut reports = stranded.clone();
        reports.extend(dense.iter().cloned());

        let result = Clusterer::new(params(1.0, 4)).run(&index_of(&reports)).unwrap();
        assert_eq!(result.clusters.len(), 1);
        let expected: BTreeSet<Uuid> = dense.iter().map(|r| r.id).collect();
        assert_eq!(result.clusters[0].member_report_ids, expected);
        let mut noise: Vec<Uuid> = stranded.iter().map(|r| r.id).collect();
        noise.sort();
        let mut got = result.noise.clone();
        got.sort();
        assert_eq!(got, noise);
    }

    #[test]
    fn test_every_member_within_radius() {
        let mut reports = tight_group(10.0, 80.0, 6);
        reports.push(report(10.001, 80.01, Severity::Medium, 0.4));
        let index = index_of(&reports);
        let result = Clusterer::new(params(2.0, 3)).run(&index).unwrap();
        for cluster in &result.clusters {
            for id in &cluster.member_report_ids {
                let loc = index.get(id).unwrap().location();
                assert!(cluster.centroid.haversine_km(&loc) <= cluster.radius_km);
            }
        }
    }

    #[test]
    fn test_no_cluster_below_min_points() {
        let mut reports = tight_group(10.0, 80.0, 2);
        reports.extend(tight_group(20.0, 80.0, 5));
        let result = Clusterer::new(params(2.0, 4)).run(&index_of(&reports)).unwrap();
        assert!(result.clusters.iter().all(|c| c.len() >= 4));
        assert_eq!(result.clusters.len(), 1);
    }

    #[test]
    fn test_partition_is_insertion_order_invariant() {
        // Two dense groups with a border report reachable from both; it must
        // land with its nearest core point whichever group is found first.
        let at = |km: f64| report(north_of(10.0, km), 80.0, Severity::Medium, 0.6);
        let group_a: Vec<Report> = [0.0, -0.5, -1.0, -1.5].iter().map(|k| at(*k)).collect();
        let group_b: Vec<Report> = [3.6, 4.1, 4.6, 5.1].iter().map(|k| at(*k)).collect();
        let border = at(1.7);
        let loner = report(10.0, 80.05, Severity::Low, 0.5);

        let mut reports = Vec::new();
        reports.extend(group_a.iter().cloned());
        reports.extend(group_b.iter().cloned());
        reports.push(border.clone());
        reports.push(loner.clone());

        let clusterer = Clusterer::new(params(2.0, 4));
        let forward = clusterer.run(&index_of(&reports)).unwrap();

        let mut reversed = reports.clone();
        reversed.reverse();
        let backward = clusterer.run(&index_of(&reversed)).unwrap();

        let mut rotated = reports.clone();
        rotated.rotate_left(5);
        let rotated = clusterer.run(&index_of(&rotated)).unwrap();

        let members = |c: &Clustering| -> Vec<BTreeSet<Uuid>> {
            c.clusters.iter().map(|x| x.member_report_ids.clone()).collect()
        };
        assert_eq!(forward.clusters.len(), 2);
        assert_eq!(members(&forward), members(&backward));
        assert_eq!(members(&forward), members(&rotated));
        assert_eq!(forward.noise, vec![loner.id]);
        assert_eq!(forward.noise, backward.noise);

        let with_border = forward
            .clusters
            .iter()
            .find(|c| c.member_report_ids.contains(&border.id))
            .unwrap();
        assert!(with_border.member_report_ids.contains(&group_a[0].id));
        assert_eq!(with_border.len(), 5);
    }

    #[test]
    fn test_identical_coordinates_have_zero_radius() {
        let reports: Vec<Report> = (0..3)
            .map(|_| report(10.0, 80.0, Severity::High, 0.8))
            .collect();
        let result = Clusterer::new(params(2.0, 3)).run(&index_of(&reports)).unwrap();
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.clusters[0].radius_km, 0.0);
    }

    #[test]
    fn test_centroid_across_antimeridian() {
        let points = [GeoPoint::new(0.0, 179.9), GeoPoint::new(0.0, -179.9)];
        let c = mean_centroid(&points);
        assert!((c.longitude.abs() - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let err = Clusterer::new(params(0.0, 3)).run(&SpatialIndex::new());
        assert!(matches!(err, Err(ClusterError::InvariantViolation(_))));
    }
}
