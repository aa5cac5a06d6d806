//! TOML configuration for hazardwatch.
//!
//! Every section is optional and falls back to compiled-in defaults. The
//! config file is located via `--config`, then the `HAZARDWATCH_CONFIG`
//! environment variable, then `/etc/hazardwatch/hazardwatch.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::score::default_alert_rules;
use crate::detect::{AlertRule, ClusterParams};
use crate::model::ReportStatus;

pub const CONFIG_ENV: &str = "HAZARDWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hazardwatch/hazardwatch.toml";

/// Upper bound on the active window: ten years.
pub const MAX_AGE_HOURS_LIMIT: u64 = 10 * 365 * 24;
/// Upper bound on how long a run may hold the store's run lease: one day.
pub const RUN_LEASE_SECS_LIMIT: u64 = 24 * 60 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("clustering.eps_km must be positive, got {0}")]
    NonPositiveEps(f64),
    #[error("clustering.min_points must be at least 1")]
    ZeroMinPoints,
    #[error("clustering.radius_margin must be non-negative, got {0}")]
    NegativeMargin(f64),
    #[error("registry.match_radius_km ({match_radius_km}) must be at least clustering.eps_km ({eps_km})")]
    MatchRadiusTooSmall { match_radius_km: f64, eps_km: f64 },
    #[error("registry.max_age_hours must be at least 1")]
    ZeroMaxAge,
    #[error("registry.max_age_hours must be at most 87600 (ten years), got {0}")]
    MaxAgeTooLarge(u64),
    #[error("storage.run_lease_secs must be within 1..=86400, got {0}")]
    RunLeaseOutOfRange(u64),
    #[error("scheduler.run_interval_secs must be at least 1")]
    ZeroInterval,
    #[error("storage.write_attempts must be at least 1")]
    ZeroWriteAttempts,
    #[error("scoring.{field} must be within [0, 1], got {value}")]
    ScoringOutOfRange { field: &'static str, value: f64 },
    #[error("intake.eligible_statuses must not be empty")]
    NoEligibleStatuses,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HazardwatchConfig {
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HazardwatchConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `HAZARDWATCH_CONFIG`, the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HAZARDWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; without one fall back to `load_or_default`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.clustering;
        if !(c.eps_km > 0.0) {
            return Err(ConfigError::NonPositiveEps(c.eps_km));
        }
        if c.min_points == 0 {
            return Err(ConfigError::ZeroMinPoints);
        }
        if !(c.radius_margin >= 0.0) {
            return Err(ConfigError::NegativeMargin(c.radius_margin));
        }
        if !(self.registry.match_radius_km >= c.eps_km) {
            return Err(ConfigError::MatchRadiusTooSmall {
                match_radius_km: self.registry.match_radius_km,
                eps_km: c.eps_km,
            });
        }
        if self.registry.max_age_hours == 0 {
            return Err(ConfigError::ZeroMaxAge);
        }
        self.registry.max_age()?;
        if self.scheduler.run_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.storage.write_attempts == 0 {
            return Err(ConfigError::ZeroWriteAttempts);
        }
        if !(1..=RUN_LEASE_SECS_LIMIT).contains(&self.storage.run_lease_secs) {
            return Err(ConfigError::RunLeaseOutOfRange(self.storage.run_lease_secs));
        }
        for (field, value) in [
            ("density_bonus", self.scoring.density_bonus),
            ("social_weight", self.scoring.social_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ScoringOutOfRange { field, value });
            }
        }
        for rule in &self.scoring.alert_rules {
            if !(0.0..=1.0).contains(&rule.min_confidence) {
                return Err(ConfigError::ScoringOutOfRange {
                    field: "alert_rules.min_confidence",
                    value: rule.min_confidence,
                });
            }
        }
        if self.intake.eligible_statuses.is_empty() {
            return Err(ConfigError::NoEligibleStatuses);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// DBSCAN neighbourhood radius in kilometres.
    pub eps_km: f64,
    /// Minimum reports (including the point itself) for a dense region.
    pub min_points: usize,
    /// Fractional safety margin added to each cluster radius.
    pub radius_margin: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps_km: 2.0,
            min_points: 3,
            radius_margin: 0.1,
        }
    }
}

impl ClusteringConfig {
    pub fn params(&self) -> ClusterParams {
        ClusterParams {
            eps_km: self.eps_km,
            min_points: self.min_points,
            radius_margin: self.radius_margin,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Centroid distance within which a cluster continues an existing hotspot.
    pub match_radius_km: f64,
    /// Active window: reports older than this stop counting.
    pub max_age_hours: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            match_radius_km: 5.0,
            max_age_hours: 72,
        }
    }
}

impl RegistryConfig {
    pub fn max_age(&self) -> Result<TimeDelta, ConfigError> {
        if self.max_age_hours > MAX_AGE_HOURS_LIMIT {
            return Err(ConfigError::MaxAgeTooLarge(self.max_age_hours));
        }
        i64::try_from(self.max_age_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .ok_or(ConfigError::MaxAgeTooLarge(self.max_age_hours))
    }

    /// Oldest `occurred_at` still inside the active window at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        now.checked_sub_signed(self.max_age()?)
            .ok_or(ConfigError::MaxAgeTooLarge(self.max_age_hours))
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Confidence multiplier per unit of `member_count / min_points`.
    pub density_bonus: f64,
    /// Maximum confidence added by corroborating social signals.
    pub social_weight: f64,
    /// Signal count at which the social bonus saturates.
    pub social_saturation: usize,
    /// Evaluated top-down, first match wins; no match means `info`.
    pub alert_rules: Vec<AlertRule>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            density_bonus: 0.05,
            social_weight: 0.1,
            social_saturation: 10,
            alert_rules: default_alert_rules(),
        }
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Report statuses that participate in clustering.
    pub eligible_statuses: Vec<ReportStatus>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            eligible_statuses: vec![ReportStatus::Verified, ReportStatus::Investigating],
        }
    }
}

impl IntakeConfig {
    pub fn is_eligible(&self, status: ReportStatus) -> bool {
        self.eligible_statuses.contains(&status)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between periodic clustering runs.
    pub run_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Attempts at the durable registry write before a run is failed.
    pub write_attempts: u32,
    /// Initial backoff between attempts; doubles each retry.
    pub retry_backoff_ms: u64,
    /// How long a run's lease on the database stays valid. A process that
    /// dies mid-run blocks other runs for at most this long.
    pub run_lease_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/hazardwatch.db"),
            write_attempts: 3,
            retry_backoff_ms: 100,
            run_lease_secs: 600,
        }
    }
}

impl StorageConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn run_lease(&self) -> Duration {
        Duration::from_secs(self.run_lease_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
