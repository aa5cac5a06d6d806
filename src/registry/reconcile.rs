//! Reconciliation of freshly scored clusters against the active hotspot set.
//!
//! [`reconcile`] is pure: it reads the current set and the run snapshot and
//! returns the complete next set plus the lifecycle events that lead there.
//! Nothing is written until the caller has persisted the result.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{Hotspot, HotspotEvent, HotspotSet, RetireReason};
use crate::config::RegistryConfig;
use crate::detect::{ClusterError, ScoredCluster, Scorer};
use crate::model::SocialSignal;
use crate::spatial::SpatialIndex;

/// Inputs shared by every step of one run.
pub struct RunContext<'a> {
    /// Index view the clusters were computed from.
    pub snapshot: &'a SpatialIndex,
    pub signals: &'a [SocialSignal],
    pub scorer: &'a Scorer<'a>,
    pub now: DateTime<Utc>,
    /// Start of the active window; hotspots whose newest report is older expire.
    pub cutoff: DateTime<Utc>,
}

/// Outcome of planning one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// The complete active set after this run.
    pub next: HotspotSet,
    /// Created, updated and retired hotspots, in that order of discovery.
    pub events: Vec<HotspotEvent>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.iter().filter(|e| e.kind() == kind).count()
    }
}

/// Plan the transition from `current` given this run's scored clusters.
pub fn reconcile(
    current: &HotspotSet,
    clusters: Vec<ScoredCluster>,
    ctx: &RunContext<'_>,
    config: &RegistryConfig,
) -> Result<Reconciliation, ClusterError> {
    let matches = match_clusters(current, &clusters, config.match_radius_km);
    let claimed: BTreeSet<Uuid> = clusters
        .iter()
        .flat_map(|c| c.cluster.member_report_ids.iter().copied())
        .collect();

    let mut next = HotspotSet::new();
    let mut events = Vec::new();
    let mut matched = BTreeSet::new();

    for (scored, hotspot_id) in clusters.into_iter().zip(matches) {
        match hotspot_id.and_then(|id| current.get(&id)) {
            Some(existing) => {
                matched.insert(existing.id);
                let hotspot = update_from(existing, &scored, ctx.now, &mut events);
                next.insert(hotspot);
            }
            None => {
                let hotspot = create_from(&scored, ctx.now);
                debug!(hotspot_id = %hotspot.id, name = %hotspot.name, "new hotspot");
                events.push(HotspotEvent::Created {
                    hotspot: hotspot.clone(),
                });
                next.insert(hotspot);
            }
        }
    }

    for existing in current.iter().filter(|h| !matched.contains(&h.id)) {
        if existing.latest_report_at < ctx.cutoff {
            events.push(retire(existing, RetireReason::Expired, ctx.now));
            continue;
        }

        let survivors: BTreeSet<Uuid> = existing
            .member_report_ids
            .iter()
            .filter(|id| !claimed.contains(id) && ctx.snapshot.contains(id))
            .copied()
            .collect();

        if survivors.is_empty() {
            let reason = if existing
                .member_report_ids
                .iter()
                .any(|id| claimed.contains(id))
            {
                RetireReason::Merged
            } else {
                RetireReason::Emptied
            };
            events.push(retire(existing, reason, ctx.now));
        } else {
            // Grace period: keep the hotspot on what is left of it. Rescoring
            // an intact hotspot picks up new signals and is otherwise a no-op.
            let rescored = ctx.scorer.rescore(survivors, ctx.snapshot, ctx.signals)?;
            let hotspot = update_from(existing, &rescored, ctx.now, &mut events);
            next.insert(hotspot);
        }
    }

    Ok(Reconciliation { next, events })
}

/// Greedy nearest-centroid one-to-one matching. Returns the matched hotspot
/// for each cluster, in cluster order.
fn match_clusters(
    current: &HotspotSet,
    clusters: &[ScoredCluster],
    match_radius_km: f64,
) -> Vec<Option<Uuid>> {
    let mut pairs: Vec<(f64, usize, Uuid)> = Vec::new();
    for (ci, scored) in clusters.iter().enumerate() {
        for hotspot in current.iter() {
            let distance = scored.cluster.centroid.haversine_km(&hotspot.center());
            if distance <= match_radius_km {
                pairs.push((distance, ci, hotspot.id));
            }
        }
    }
    pairs.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let mut assigned = vec![None; clusters.len()];
    let mut taken = BTreeSet::new();
    for (_, ci, hotspot_id) in pairs {
        if assigned[ci].is_none() && !taken.contains(&hotspot_id) {
            assigned[ci] = Some(hotspot_id);
            taken.insert(hotspot_id);
        }
    }
    assigned
}

fn create_from(scored: &ScoredCluster, now: DateTime<Utc>) -> Hotspot {
    let centroid = scored.cluster.centroid;
    let mut hotspot = Hotspot {
        id: Uuid::new_v4(),
        center_latitude: centroid.latitude,
        center_longitude: centroid.longitude,
        radius_km: scored.cluster.radius_km,
        name: format!(
            "{} hotspot near {:.3}, {:.3}",
            scored.dominant_hazard_type.label(),
            centroid.latitude,
            centroid.longitude
        ),
        description: String::new(),
        alert_level: scored.alert_level,
        confidence_score: scored.confidence_score,
        report_count: 0,
        dominant_hazard_type: scored.dominant_hazard_type,
        max_severity: scored.max_severity,
        member_report_ids: BTreeSet::new(),
        latest_report_at: scored.latest_report_at,
        is_active: true,
        detected_at: now,
        last_updated: now,
        resolved_at: None,
    };
    apply(&mut hotspot, scored);
    hotspot
}

/// Apply `scored` to a copy of `existing`. Emits `Updated` and bumps
/// `last_updated` only when something actually changed.
fn update_from(
    existing: &Hotspot,
    scored: &ScoredCluster,
    now: DateTime<Utc>,
    events: &mut Vec<HotspotEvent>,
) -> Hotspot {
    let mut hotspot = existing.clone();
    apply(&mut hotspot, scored);
    if hotspot == *existing {
        return hotspot;
    }
    hotspot.last_updated = now;
    debug!(
        hotspot_id = %hotspot.id,
        reports = hotspot.report_count,
        level = %hotspot.alert_level,
        "hotspot updated"
    );
    events.push(HotspotEvent::Updated {
        hotspot: hotspot.clone(),
        previous_alert_level: existing.alert_level,
        alert_level_changed: existing.alert_level != hotspot.alert_level,
    });
    hotspot
}

fn apply(hotspot: &mut Hotspot, scored: &ScoredCluster) {
    let cluster = &scored.cluster;
    hotspot.center_latitude = cluster.centroid.latitude;
    hotspot.center_longitude = cluster.centroid.longitude;
    hotspot.radius_km = cluster.radius_km;
    hotspot.alert_level = scored.alert_level;
    hotspot.confidence_score = scored.confidence_score;
    hotspot.report_count = cluster.len();
    hotspot.dominant_hazard_type = scored.dominant_hazard_type;
    hotspot.max_severity = scored.max_severity;
    hotspot.member_report_ids = cluster.member_report_ids.clone();
    hotspot.latest_report_at = scored.latest_report_at;
    hotspot.description = format!(
        "{} reports, max severity {}, {} corroborating social signals",
        cluster.len(),
        scored.max_severity,
        scored.corroborating_signals
    );
}

fn retire(existing: &Hotspot, reason: RetireReason, now: DateTime<Utc>) -> HotspotEvent {
    let mut hotspot = existing.clone();
    hotspot.is_active = false;
    hotspot.resolved_at = Some(now);
    hotspot.last_updated = now;
    debug!(hotspot_id = %hotspot.id, reason = reason.as_str(), "hotspot retired");
    HotspotEvent::Retired { hotspot, reason }
}
