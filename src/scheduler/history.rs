//! Execution history for clustering runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record of one clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub reports_considered: usize,
    pub clusters_found: usize,
    pub noise: usize,
    pub created: usize,
    pub updated: usize,
    pub retired: usize,
    /// Store write attempts spent on the commit, zero if never reached.
    pub write_attempts: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn started(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Success,
            reports_considered: 0,
            clusters_found: 0,
            noise: 0,
            created: 0,
            updated: 0,
            retired: 0,
            write_attempts: 0,
            error: None,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Clustering or scoring hit an invariant violation.
    Aborted,
    /// The durable write failed after all retries.
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "aborted" => Some(RunStatus::Aborted),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}
