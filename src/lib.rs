//! hazardwatch -- geospatial hotspot detection for citizen hazard reports.
//!
//! This crate provides the spatial index, density clustering, hotspot
//! scoring and the persistent hotspot registry, plus the service, scheduler
//! and storage that run them.

pub mod config;
pub mod detect;
pub mod intake;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod spatial;
pub mod stats;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};

use crate::config::HazardwatchConfig;
use crate::registry::HotspotEvent;
use crate::service::HotspotService;
use crate::storage::{HotspotStore, SqliteStore};

/// Open the configured database and restore the hotspot service from it.
pub async fn open_service(config: &HazardwatchConfig) -> Result<Arc<HotspotService>> {
    let db_path = &config.storage.database_path;
    tracing::info!(db_path = %db_path.display(), "Initializing database");
    let store: Arc<dyn HotspotStore> = Arc::new(SqliteStore::open(db_path)?);
    Ok(Arc::new(HotspotService::open(config.clone(), store).await?))
}

/// Start the hazardwatch daemon: scheduler and alert log, until Ctrl-C.
pub async fn serve(config: HazardwatchConfig) -> Result<()> {
    // 1. Initialize Storage + Service
    let service = open_service(&config).await?;

    // 2. Alert sink
    let alerts = tokio::spawn(log_events(service.subscribe()));

    // 3. Start Scheduler Engine (background task)
    let (stop_tx, stop_rx) = watch::channel(false);
    let engine = tokio::spawn(scheduler::run_scheduler_loop(
        Arc::clone(&service),
        config.scheduler.run_interval(),
        service.trigger(),
        stop_rx,
    ));

    tracing::info!(
        interval_secs = config.scheduler.run_interval_secs,
        "hazardwatch running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    stop_tx.send(true)?;
    engine.await?;
    alerts.abort();
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<HotspotEvent>) {
    loop {
        match events.recv().await {
            Ok(HotspotEvent::Created { hotspot }) => {
                tracing::warn!(
                    hotspot_id = %hotspot.id,
                    name = %hotspot.name,
                    level = %hotspot.alert_level,
                    reports = hotspot.report_count,
                    "New hotspot detected"
                );
            }
            Ok(HotspotEvent::Updated {
                hotspot,
                previous_alert_level,
                alert_level_changed: true,
            }) => {
                tracing::warn!(
                    hotspot_id = %hotspot.id,
                    name = %hotspot.name,
                    from = %previous_alert_level,
                    to = %hotspot.alert_level,
                    "Hotspot alert level changed"
                );
            }
            Ok(HotspotEvent::Updated { hotspot, .. }) => {
                tracing::debug!(hotspot_id = %hotspot.id, reports = hotspot.report_count, "Hotspot updated");
            }
            Ok(HotspotEvent::Retired { hotspot, reason }) => {
                tracing::info!(
                    hotspot_id = %hotspot.id,
                    name = %hotspot.name,
                    reason = reason.as_str(),
                    "Hotspot retired"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Alert log fell behind; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
