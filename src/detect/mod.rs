//! Hotspot detection: density clustering and cluster scoring.

pub mod cluster;
pub mod score;

use thiserror::Error;
use uuid::Uuid;

pub use self::cluster::{Cluster, ClusterParams, Clusterer, Clustering};
pub use self::score::{AlertRule, ScoredCluster, Scorer};

/// Internal invariant violations. Any of these aborts the clustering run and
/// leaves registry state untouched.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster invariant violated: {0}")]
    InvariantViolation(String),
    #[error("cluster member {0} is missing from the run snapshot")]
    UnknownMember(Uuid),
}

/// Alert levels for hotspots, strictly ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Alert,
    Emergency,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Alert => "alert",
            AlertLevel::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AlertLevel::Info),
            "warning" => Some(AlertLevel::Warning),
            "alert" => Some(AlertLevel::Alert),
            "emergency" => Some(AlertLevel::Emergency),
            _ => None,
        }
    }

    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::Info,
        AlertLevel::Warning,
        AlertLevel::Alert,
        AlertLevel::Emergency,
    ];
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertLevel::parse(s).ok_or_else(|| format!("unknown alert level '{}'", s))
    }
}
