//! Batch intake of reports and social signals from JSON files.
//!
//! Accepts either a JSON array or JSON lines. Each record is a report or a
//! signal, told apart by shape (`occurred_at` vs `observed_at`).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{Report, SocialSignal};
use crate::service::{HotspotService, IngestOutcome, ServiceError};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid JSON array: {0}")]
    Array(#[source] serde_json::Error),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntakeRecord {
    Report(Report),
    Signal(SocialSignal),
}

/// Tally of one intake batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub duplicate: usize,
    pub ineligible: usize,
    pub withdrawn: usize,
    pub signals: usize,
    /// Records that failed validation and were skipped.
    pub invalid: usize,
}

impl IngestSummary {
    /// Whether the batch can affect the next clustering run.
    pub fn changed(&self) -> bool {
        self.accepted + self.withdrawn + self.signals > 0
    }
}

pub fn parse_batch(text: &str) -> Result<Vec<IntakeRecord>, IntakeError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(IntakeError::Array);
    }

    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| IntakeError::Line {
            line: i + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Submit every record. Invalid records are counted and skipped; store
/// failures abort the batch. A batch that changed anything requests a run
/// from the service's scheduler.
pub async fn ingest_batch(
    service: &HotspotService,
    records: Vec<IntakeRecord>,
) -> Result<IngestSummary, ServiceError> {
    let mut summary = IngestSummary::default();
    for record in records {
        match record {
            IntakeRecord::Report(report) => {
                let id = report.id;
                match service.submit_report(report).await {
                    Ok(IngestOutcome::Accepted) => summary.accepted += 1,
                    Ok(IngestOutcome::Duplicate) => summary.duplicate += 1,
                    Ok(IngestOutcome::Ineligible) => summary.ineligible += 1,
                    Ok(IngestOutcome::Withdrawn) => summary.withdrawn += 1,
                    Err(ServiceError::InvalidReport(e)) => {
                        warn!(report_id = %id, error = %e, "skipping invalid report");
                        summary.invalid += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            IntakeRecord::Signal(signal) => {
                let id = signal.id;
                match service.submit_signal(signal).await {
                    Ok(true) => summary.signals += 1,
                    Ok(false) => summary.duplicate += 1,
                    Err(ServiceError::InvalidReport(e)) => {
                        warn!(signal_id = %id, error = %e, "skipping invalid signal");
                        summary.invalid += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
    if summary.changed() {
        service.trigger().request();
    }
    Ok(summary)
}
