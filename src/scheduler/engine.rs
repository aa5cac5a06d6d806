use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::service::HotspotService;

/// Wakes the scheduler loop outside its regular interval, e.g. after an
/// intake batch. Requests made while a run is in flight coalesce into one.
#[derive(Debug, Clone, Default)]
pub struct RunTrigger {
    notify: Arc<Notify>,
}

impl RunTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Resolves once a run has been requested; a request made while nobody
    /// waits is kept for the next call.
    pub async fn requested(&self) {
        self.notify.notified().await
    }
}

/// Main scheduler execution loop.
/// Runs clustering every `interval` and whenever `trigger` fires, until
/// `shutdown` flips to `true`. Failed runs are logged and retried on the
/// next wake.
pub async fn run_scheduler_loop(
    service: Arc<HotspotService>,
    interval: Duration,
    trigger: RunTrigger,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Scheduler engine started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let reason = tokio::select! {
            _ = ticker.tick() => "interval",
            _ = trigger.requested() => "requested",
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Scheduler engine stopping");
                    return;
                }
                continue;
            }
        };

        match service.run_once(Utc::now()).await {
            Ok(run) => {
                if !run.events.is_empty() {
                    info!(
                        trigger = reason,
                        run_id = %run.record.run_id,
                        events = run.events.len(),
                        "Hotspots changed"
                    );
                }
            }
            Err(e) => {
                error!(trigger = reason, "Clustering run failed: {}", e);
            }
        }

        if *shutdown.borrow() {
            warn!("Shutdown requested during run; stopping after it completed");
            return;
        }
    }
}
