//! The hotspot service: report intake, clustering runs and registry access.
//!
//! Intake and runs proceed concurrently. The store is the source of truth:
//! a run first takes the database-wide run lease, so runs from the daemon
//! and from CLI invocations on the same database never overlap, then reloads
//! the active hotspots, reports and signals from the store and works on that
//! view only. A run's plan is persisted with bounded retry before the
//! registry swaps it in and events go out. Until then nothing in memory
//! changes, so a failed run leaves the active set, the intake caches and
//! subscribers untouched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, HazardwatchConfig};
use crate::detect::{ClusterError, Clusterer, Scorer};
use crate::model::{Report, ReportError, SocialSignal};
use crate::registry::reconcile::RunContext;
use crate::registry::{
    reconcile, Hotspot, HotspotEvent, HotspotFilter, HotspotRegistry, HotspotSet, Reconciliation,
};
use crate::scheduler::history::{RunRecord, RunStatus};
use crate::scheduler::RunTrigger;
use crate::spatial::SpatialIndex;
use crate::storage::{HotspotStore, StoreError};

/// Buffered hotspot events per subscriber before the slowest one lags.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid report: {0}")]
    InvalidReport(#[from] ReportError),
    #[error("clustering run failed: {0}")]
    ClusteringRunFailure(#[from] ClusterError),
    #[error("registry write failed after {attempts} attempt(s): {source}")]
    RegistryWriteFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("another clustering run holds the database run lease")]
    RunInProgress,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What happened to a submitted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Eligible and now in the index.
    Accepted,
    /// Identical to a report already indexed.
    Duplicate,
    /// Stored, but its status keeps it out of clustering.
    Ineligible,
    /// Was indexed and has become ineligible; removed from the index.
    Withdrawn,
}

/// Result of one successful clustering run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub record: RunRecord,
    pub events: Vec<HotspotEvent>,
}

/// Everything a run reads from the store.
struct RunInputs {
    current: HotspotSet,
    snapshot: SpatialIndex,
    /// Every report id loaded, eligible or not.
    loaded: HashSet<Uuid>,
    signals: Vec<SocialSignal>,
}

pub struct HotspotService {
    config: HazardwatchConfig,
    /// Identifies this service as a run lease holder.
    instance_id: Uuid,
    index: Mutex<SpatialIndex>,
    signals: Mutex<Vec<SocialSignal>>,
    run_lock: tokio::sync::Mutex<()>,
    registry: HotspotRegistry,
    store: Arc<dyn HotspotStore>,
    events: broadcast::Sender<HotspotEvent>,
    trigger: RunTrigger,
}

impl HotspotService {
    /// Restore persisted state: active hotspots, plus eligible reports and
    /// signals inside the active window.
    pub async fn open(
        config: HazardwatchConfig,
        store: Arc<dyn HotspotStore>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let since = config.registry.cutoff(Utc::now())?;

        let loader = Arc::clone(&store);
        let (hotspots, reports, signals) = tokio::task::spawn_blocking(move || {
            Ok::<_, StoreError>((
                loader.load_active()?,
                loader.load_reports_since(since)?,
                loader.load_signals_since(since)?,
            ))
        })
        .await??;

        let index = eligible_index(&config, reports);
        info!(
            hotspots = hotspots.len(),
            reports = index.len(),
            signals = signals.len(),
            "hotspot service restored"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            instance_id: Uuid::new_v4(),
            registry: HotspotRegistry::new(hotspots.into_iter().collect()),
            index: Mutex::new(index),
            signals: Mutex::new(signals),
            run_lock: tokio::sync::Mutex::new(()),
            store,
            events,
            trigger: RunTrigger::new(),
            config,
        })
    }

    pub fn config(&self) -> &HazardwatchConfig {
        &self.config
    }

    /// Wakes a scheduler loop driving this service.
    pub fn trigger(&self) -> RunTrigger {
        self.trigger.clone()
    }

    /// Validate, persist and (if eligible) index a report.
    pub async fn submit_report(&self, report: Report) -> Result<IngestOutcome, ServiceError> {
        report.validate()?;

        let unchanged = self.lock_index().get(&report.id) == Some(&report);
        if unchanged {
            return Ok(IngestOutcome::Duplicate);
        }

        let stored = report.clone();
        self.blocking(move |store| store.save_report(&stored)).await?;

        let eligible = self.config.intake.is_eligible(report.status);
        let mut index = self.lock_index();
        let outcome = if eligible {
            // Replace any earlier version so edits take effect next run.
            index.remove(&report.id);
            index.insert(report.clone());
            IngestOutcome::Accepted
        } else if index.remove(&report.id).is_some() {
            IngestOutcome::Withdrawn
        } else {
            IngestOutcome::Ineligible
        };
        debug!(report_id = %report.id, status = %report.status, ?outcome, "report submitted");
        Ok(outcome)
    }

    /// Validate and record a social signal. Returns `false` for a repeat.
    pub async fn submit_signal(&self, signal: SocialSignal) -> Result<bool, ServiceError> {
        signal.validate()?;
        if self.lock_signals().iter().any(|s| s.id == signal.id) {
            return Ok(false);
        }

        let stored = signal.clone();
        self.blocking(move |store| store.save_signal(&stored)).await?;

        let mut signals = self.lock_signals();
        if signals.iter().any(|s| s.id == signal.id) {
            return Ok(false);
        }
        signals.push(signal);
        Ok(true)
    }

    /// Execute one clustering run as of `now`.
    ///
    /// Fails with [`ServiceError::RunInProgress`] when another service on the
    /// same database holds the run lease.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport, ServiceError> {
        let _guard = self.run_lock.lock().await;

        let holder = self.instance_id;
        let ttl = self.config.storage.run_lease();
        if !self
            .blocking(move |store| store.acquire_run_lease(holder, ttl))
            .await?
        {
            warn!("clustering run skipped, another run holds the lease");
            return Err(ServiceError::RunInProgress);
        }

        let result = self.run_leased(now).await;

        if let Err(e) = self
            .blocking(move |store| store.release_run_lease(holder))
            .await
        {
            warn!(error = %e, "failed to release run lease, it lapses after {:?}", ttl);
        }
        result
    }

    async fn run_leased(&self, now: DateTime<Utc>) -> Result<RunReport, ServiceError> {
        let mut record = RunRecord::started(now);
        let max_age = self.config.registry.max_age()?;
        let cutoff = self.config.registry.cutoff(now)?;

        let inputs = match self.load_inputs(cutoff).await {
            Ok(inputs) => inputs,
            Err(e) => {
                error!(run_id = %record.run_id, error = %e, "could not load run inputs");
                record.status = RunStatus::Failed;
                record.error = Some(e.to_string());
                self.finish(record).await;
                return Err(e);
            }
        };
        record.reports_considered = inputs.snapshot.len();

        let plan = match self.plan(&inputs, now, cutoff, &mut record) {
            Ok(plan) => plan,
            Err(e) => {
                error!(run_id = %record.run_id, error = %e, "clustering run aborted");
                record.status = RunStatus::Aborted;
                record.error = Some(e.to_string());
                self.finish(record).await;
                return Err(e.into());
            }
        };

        if !plan.is_noop() {
            match self.commit_with_retry(&plan.events).await {
                Ok(attempts) => record.write_attempts = attempts,
                Err(e) => {
                    error!(run_id = %record.run_id, error = %e, "run discarded, previous hotspots stay authoritative");
                    record.status = RunStatus::Failed;
                    record.error = Some(e.to_string());
                    if let ServiceError::RegistryWriteFailure { attempts, .. } = &e {
                        record.write_attempts = *attempts;
                    }
                    self.finish(record).await;
                    return Err(e);
                }
            }
        }

        record.created = plan.count("created");
        record.updated = plan.count("updated");
        record.retired = plan.count("retired");

        let Reconciliation { next, events } = plan;
        self.registry.swap(next);
        self.refresh_caches(inputs, now, max_age);
        for event in &events {
            // No subscribers is not an error.
            let _ = self.events.send(event.clone());
        }

        info!(
            run_id = %record.run_id,
            reports = record.reports_considered,
            clusters = record.clusters_found,
            created = record.created,
            updated = record.updated,
            retired = record.retired,
            "clustering run complete"
        );
        let record = self.finish(record).await;
        Ok(RunReport { record, events })
    }

    /// Consistent view of the active hotspot set.
    pub fn snapshot(&self) -> Arc<HotspotSet> {
        self.registry.snapshot()
    }

    pub fn query(&self, filter: &HotspotFilter) -> Vec<Hotspot> {
        self.registry.query(filter)
    }

    /// Receive every hotspot event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HotspotEvent> {
        self.events.subscribe()
    }

    pub fn indexed_reports(&self) -> usize {
        self.lock_index().len()
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>, ServiceError> {
        self.blocking(move |store| store.list_runs(limit)).await
    }

    async fn load_inputs(&self, cutoff: DateTime<Utc>) -> Result<RunInputs, ServiceError> {
        let (hotspots, reports, signals) = self
            .blocking(move |store| {
                Ok((
                    store.load_active()?,
                    store.load_reports_since(cutoff)?,
                    store.load_signals_since(cutoff)?,
                ))
            })
            .await?;
        let loaded = reports.iter().map(|r| r.id).collect();
        Ok(RunInputs {
            current: hotspots.into_iter().collect(),
            snapshot: eligible_index(&self.config, reports),
            loaded,
            signals,
        })
    }

    fn plan(
        &self,
        inputs: &RunInputs,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        record: &mut RunRecord,
    ) -> Result<Reconciliation, ClusterError> {
        let snapshot = &inputs.snapshot;
        let params = self.config.clustering.params();
        let clustering = Clusterer::new(params).run(snapshot)?;
        record.clusters_found = clustering.clusters.len();
        record.noise = clustering.noise.len();

        let scorer = Scorer::new(&self.config.scoring, params);
        let scored = clustering
            .clusters
            .into_iter()
            .map(|c| scorer.score(c, snapshot, &inputs.signals))
            .collect::<Result<Vec<_>, _>>()?;

        let ctx = RunContext {
            snapshot,
            signals: &inputs.signals,
            scorer: &scorer,
            now,
            cutoff,
        };
        reconcile(&inputs.current, scored, &ctx, &self.config.registry)
    }

    /// Bring the intake caches in line with what the run read from the
    /// store. Entries submitted here after the load are kept unless expired.
    fn refresh_caches(&self, inputs: RunInputs, now: DateTime<Utc>, max_age: TimeDelta) {
        let RunInputs {
            snapshot,
            loaded,
            signals: stored_signals,
            ..
        } = inputs;
        let cutoff = now - max_age;

        let mut index = self.lock_index();
        index.active_window(now, max_age);
        let mut refreshed = snapshot;
        for report in index.iter().filter(|r| !loaded.contains(&r.id)) {
            refreshed.insert(report.clone());
        }
        *index = refreshed;
        let indexed = index.len();
        drop(index);

        let mut signals = self.lock_signals();
        let stored: HashSet<Uuid> = stored_signals.iter().map(|s| s.id).collect();
        let mut kept = stored_signals;
        kept.extend(
            signals
                .iter()
                .filter(|s| s.observed_at >= cutoff && !stored.contains(&s.id))
                .cloned(),
        );
        *signals = kept;
        debug!(reports = indexed, signals = signals.len(), "intake caches refreshed");
    }

    /// Commit with exponential backoff. Returns the attempts used.
    async fn commit_with_retry(&self, events: &[HotspotEvent]) -> Result<u32, ServiceError> {
        let batch: Arc<[HotspotEvent]> = events.into();
        let max_attempts = self.config.storage.write_attempts.max(1);
        let mut delay = self.config.storage.retry_backoff();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let store = Arc::clone(&self.store);
            let events = Arc::clone(&batch);
            match tokio::task::spawn_blocking(move || store.commit(&events)).await? {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "registry write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(source) => {
                    return Err(ServiceError::RegistryWriteFailure {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Stamp and persist a run record. History is best effort.
    async fn finish(&self, mut record: RunRecord) -> RunRecord {
        record.finished_at = Utc::now().max(record.started_at);
        let stored = record.clone();
        if let Err(e) = self.blocking(move |store| store.record_run(&stored)).await {
            warn!(run_id = %record.run_id, error = %e, "failed to record run history");
        }
        record
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&dyn HotspotStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
    }

    fn lock_index(&self) -> MutexGuard<'_, SpatialIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_signals(&self) -> MutexGuard<'_, Vec<SocialSignal>> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Index the reports that participate in clustering.
fn eligible_index(config: &HazardwatchConfig, reports: Vec<Report>) -> SpatialIndex {
    let mut index = SpatialIndex::new();
    for report in reports {
        if config.intake.is_eligible(report.status) {
            index.insert(report);
        }
    }
    index
}
