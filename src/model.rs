//! Input records supplied by the intake collaborators: hazard reports and
//! scored social-media signals, plus the small geometry helpers shared by the
//! index, clusterer and registry.

use chrono::{DateTime, Utc};
use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum ReportError {
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("confidence score {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("report id must not be nil")]
    MissingId,
}

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ReportError::LatitudeOutOfRange(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ReportError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    /// Great-circle distance in kilometres.
    pub fn haversine_km(&self, other: &GeoPoint) -> f64 {
        let a = Point::new(self.longitude, self.latitude);
        let b = Point::new(other.longitude, other.latitude);
        Haversine::distance(a, b) / 1000.0
    }
}

/// Report severity. Ordering is significant: low < medium < high < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used when severity is combined with confidence.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
            Severity::Critical => 4.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Review status assigned by analysts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Verified,
    Rejected,
    Investigating,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Verified => "verified",
            ReportStatus::Rejected => "rejected",
            ReportStatus::Investigating => "investigating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReportStatus::Pending),
            "verified" => Some(ReportStatus::Verified),
            "rejected" => Some(ReportStatus::Rejected),
            "investigating" => Some(ReportStatus::Investigating),
            _ => None,
        }
    }

    pub const ALL: [ReportStatus; 4] = [
        ReportStatus::Pending,
        ReportStatus::Verified,
        ReportStatus::Rejected,
        ReportStatus::Investigating,
    ];
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Ocean hazard categories. Declaration order doubles as the final
/// tie-breaker when picking a dominant type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardType {
    Tsunami,
    StormSurge,
    HighWaves,
    Flooding,
    Cyclone,
    MarineDebris,
    OilSpill,
    Other,
}

impl HazardType {
    pub fn as_str(self) -> &'static str {
        match self {
            HazardType::Tsunami => "tsunami",
            HazardType::StormSurge => "storm_surge",
            HazardType::HighWaves => "high_waves",
            HazardType::Flooding => "flooding",
            HazardType::Cyclone => "cyclone",
            HazardType::MarineDebris => "marine_debris",
            HazardType::OilSpill => "oil_spill",
            HazardType::Other => "other",
        }
    }

    /// Human-readable label, used in hotspot names.
    pub fn label(self) -> &'static str {
        match self {
            HazardType::Tsunami => "Tsunami",
            HazardType::StormSurge => "Storm surge",
            HazardType::HighWaves => "High waves",
            HazardType::Flooding => "Coastal flooding",
            HazardType::Cyclone => "Cyclone",
            HazardType::MarineDebris => "Marine debris",
            HazardType::OilSpill => "Oil spill",
            HazardType::Other => "Hazard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tsunami" => Some(HazardType::Tsunami),
            "storm_surge" => Some(HazardType::StormSurge),
            "high_waves" => Some(HazardType::HighWaves),
            "flooding" => Some(HazardType::Flooding),
            "cyclone" => Some(HazardType::Cyclone),
            "marine_debris" => Some(HazardType::MarineDebris),
            "oil_spill" => Some(HazardType::OilSpill),
            "other" => Some(HazardType::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for HazardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for HazardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HazardType::parse(s).ok_or_else(|| format!("unknown hazard type '{}'", s))
    }
}

/// One citizen hazard report. Immutable once received; hotspots refer to it
/// by `id` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub hazard_type: HazardType,
    pub severity: Severity,
    pub confidence_score: f64,
    pub occurred_at: DateTime<Utc>,
    pub status: ReportStatus,
}

impl Report {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if self.id.is_nil() {
            return Err(ReportError::MissingId);
        }
        self.location().validate()?;
        validate_confidence(self.confidence_score)
    }
}

/// A scored social-media post deposited by the external ingestion pipeline.
/// Signals corroborate clusters; they never form clusters on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialSignal {
    pub id: Uuid,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub hazard_type: Option<HazardType>,
    pub confidence_score: f64,
    pub observed_at: DateTime<Utc>,
}

impl SocialSignal {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if self.id.is_nil() {
            return Err(ReportError::MissingId);
        }
        if let Some(point) = self.location() {
            point.validate()?;
        }
        validate_confidence(self.confidence_score)
    }
}

fn validate_confidence(score: f64) -> Result<(), ReportError> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(ReportError::ConfidenceOutOfRange(score));
    }
    Ok(())
}

/// Axis-aligned lat/lng box. `west > east` denotes a box crossing the
/// antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        if point.latitude < self.south || point.latitude > self.north {
            return false;
        }
        if self.west <= self.east {
            point.longitude >= self.west && point.longitude <= self.east
        } else {
            point.longitude >= self.west || point.longitude <= self.east
        }
    }
}

impl std::str::FromStr for BoundingBox {
    type Err = String;

    /// Parses `south,west,north,east`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid bounding box '{}': {}", s, e))?;
        if parts.len() != 4 {
            return Err(format!(
                "invalid bounding box '{}': expected south,west,north,east",
                s
            ));
        }
        let bbox = BoundingBox {
            south: parts[0],
            west: parts[1],
            north: parts[2],
            east: parts[3],
        };
        if bbox.south > bbox.north {
            return Err(format!("invalid bounding box '{}': south > north", s));
        }
        Ok(bbox)
    }
}
