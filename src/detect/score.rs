//! Cluster scoring: dominant hazard type, confidence and alert level.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cluster::summarize;
use super::{AlertLevel, Cluster, ClusterError, ClusterParams};
use crate::config::ScoringConfig;
use crate::model::{HazardType, Report, Severity, SocialSignal};
use crate::spatial::SpatialIndex;

/// One row of the alert-level table. All conditions must hold for the rule
/// to match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub level: AlertLevel,
    /// At least one member must be at or above this severity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub min_confidence: f64,
    /// Member count must reach `min_density * min_points`.
    #[serde(default)]
    pub min_density: f64,
}

impl AlertRule {
    fn matches(&self, max_severity: Severity, confidence: f64, density: f64) -> bool {
        self.min_severity.map_or(true, |s| max_severity >= s)
            && confidence >= self.min_confidence
            && density >= self.min_density
    }
}

/// Default table: emergency needs a critical member and confidence 0.7,
/// alert needs a high member and 0.5, any full-size cluster is a warning.
pub fn default_alert_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            level: AlertLevel::Emergency,
            min_severity: Some(Severity::Critical),
            min_confidence: 0.7,
            min_density: 0.0,
        },
        AlertRule {
            level: AlertLevel::Alert,
            min_severity: Some(Severity::High),
            min_confidence: 0.5,
            min_density: 0.0,
        },
        AlertRule {
            level: AlertLevel::Warning,
            min_severity: None,
            min_confidence: 0.0,
            min_density: 1.0,
        },
    ]
}

/// Evaluate `rules` top-down; the first match wins, otherwise `Info`.
pub fn classify(
    rules: &[AlertRule],
    max_severity: Severity,
    confidence: f64,
    member_count: usize,
    min_points: usize,
) -> AlertLevel {
    let density = member_count as f64 / min_points.max(1) as f64;
    rules
        .iter()
        .find(|rule| rule.matches(max_severity, confidence, density))
        .map_or(AlertLevel::Info, |rule| rule.level)
}

/// A cluster together with its derived hotspot metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCluster {
    pub cluster: Cluster,
    pub dominant_hazard_type: HazardType,
    pub confidence_score: f64,
    pub alert_level: AlertLevel,
    pub max_severity: Severity,
    pub latest_report_at: DateTime<Utc>,
    pub corroborating_signals: usize,
}

pub struct Scorer<'a> {
    config: &'a ScoringConfig,
    params: ClusterParams,
}

impl<'a> Scorer<'a> {
    pub fn new(config: &'a ScoringConfig, params: ClusterParams) -> Self {
        Self { config, params }
    }

    pub fn score(
        &self,
        cluster: Cluster,
        index: &SpatialIndex,
        signals: &[SocialSignal],
    ) -> Result<ScoredCluster, ClusterError> {
        let mut members: Vec<&Report> = Vec::with_capacity(cluster.len());
        for id in &cluster.member_report_ids {
            members.push(index.get(id).ok_or(ClusterError::UnknownMember(*id))?);
        }
        let Some(latest_report_at) = members.iter().map(|r| r.occurred_at).max() else {
            return Err(ClusterError::InvariantViolation(
                "cannot score an empty cluster".to_string(),
            ));
        };
        let max_severity = members
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::Low);

        let dominant_hazard_type = dominant_hazard(&members);

        let mean = members.iter().map(|r| r.confidence_score).sum::<f64>() / members.len() as f64;
        let density = members.len() as f64 / self.params.min_points.max(1) as f64;
        let mut confidence = mean * (1.0 + self.config.density_bonus * density);

        let corroborating_signals = signals
            .iter()
            .filter(|s| self.corroborates(s, &cluster, dominant_hazard_type))
            .count();
        if corroborating_signals > 0 && self.config.social_saturation > 0 {
            let saturation = self.config.social_saturation as f64;
            let counted = (corroborating_signals as f64).min(saturation);
            confidence += self.config.social_weight * counted / saturation;
        }
        let confidence_score = confidence.clamp(0.0, 1.0);

        let alert_level = classify(
            &self.config.alert_rules,
            max_severity,
            confidence_score,
            members.len(),
            self.params.min_points,
        );

        Ok(ScoredCluster {
            cluster,
            dominant_hazard_type,
            confidence_score,
            alert_level,
            max_severity,
            latest_report_at,
            corroborating_signals,
        })
    }

    /// Summarize and score an arbitrary member set, e.g. the surviving
    /// members of a hotspot that was not matched this run.
    pub fn rescore(
        &self,
        members: BTreeSet<Uuid>,
        index: &SpatialIndex,
        signals: &[SocialSignal],
    ) -> Result<ScoredCluster, ClusterError> {
        let cluster = summarize(index, members, self.params.radius_margin)?;
        self.score(cluster, index, signals)
    }

    fn corroborates(&self, signal: &SocialSignal, cluster: &Cluster, dominant: HazardType) -> bool {
        let Some(location) = signal.location() else {
            return false;
        };
        if signal.hazard_type.is_some_and(|h| h != dominant) {
            return false;
        }
        cluster.centroid.haversine_km(&location) <= cluster.radius_km + self.params.eps_km
    }
}

/// Most frequent hazard type; ties go to the highest summed
/// severity-weighted confidence, then to declaration order.
fn dominant_hazard(members: &[&Report]) -> HazardType {
    let mut tally: BTreeMap<HazardType, (usize, f64)> = BTreeMap::new();
    for r in members {
        let entry = tally.entry(r.hazard_type).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += r.severity.weight() * r.confidence_score;
    }

    let mut best: Option<(HazardType, usize, f64)> = None;
    for (hazard, (count, weight)) in tally {
        let better = match best {
            None => true,
            Some((_, best_count, best_weight)) => {
                count > best_count || (count == best_count && weight > best_weight)
            }
        };
        if better {
            best = Some((hazard, count, weight));
        }
    }
    best.map_or(HazardType::Other, |(hazard, _, _)| hazard)
}
