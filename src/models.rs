//! Data models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PtiError;
use serde_helpers::*;

/// A point on the WGS84 ellipsoid, in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that latitude is within [-90, 90] and longitude within [-180, 180]
    pub fn validate(&self) -> Result<(), PtiError> {
        let lat_ok = (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(PtiError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// Normalized location record
///
/// Produced by the position tracker from every accepted device fix or
/// on-demand read. Never mutated; the next sample supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in WGS84 decimal degrees
    pub latitude: f64,
    /// Longitude in WGS84 decimal degrees
    pub longitude: f64,
    /// Horizontal accuracy radius in meters, None if not reported
    pub accuracy: Option<f64>,
    /// Fix time in milliseconds from Unix epoch, on the producer's clock
    pub timestamp: i64,
    /// Ground speed in m/s, None if not reported
    pub speed: Option<f64>,
    /// Course over ground in degrees, None if not reported
    pub heading: Option<f64>,
}

impl LocationSample {
    /// Create a sample with only the mandatory fields
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Result<Self, PtiError> {
        Coordinates::new(latitude, longitude).validate()?;
        Ok(Self {
            latitude,
            longitude,
            accuracy: None,
            timestamp,
            speed: None,
            heading: None,
        })
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Fix time as a UTC datetime
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Fix as delivered by the platform location API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub coords: RawCoords,
    /// Milliseconds from Unix epoch. Some platforms send fractional values.
    #[serde(deserialize_with = "deserialize_millis")]
    pub timestamp: i64,
}

/// Coordinate block of a platform fix
///
/// Platforms report "unavailable" for accuracy, speed and heading either as
/// null or as a negative number (-1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawCoords {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

impl RawFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            coords: RawCoords {
                latitude,
                longitude,
                ..Default::default()
            },
            timestamp,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.coords.accuracy = Some(accuracy);
        self
    }
}

impl TryFrom<RawFix> for LocationSample {
    type Error = PtiError;

    fn try_from(fix: RawFix) -> Result<Self, Self::Error> {
        let c = fix.coords;
        Coordinates::new(c.latitude, c.longitude).validate()?;
        Ok(Self {
            latitude: c.latitude,
            longitude: c.longitude,
            accuracy: non_negative(c.accuracy),
            timestamp: fix.timestamp,
            speed: non_negative(c.speed),
            heading: non_negative(c.heading),
        })
    }
}

fn non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Identifier of the worker an alert concerns
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl TryFrom<String> for SubjectId {
    type Error = PtiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PtiError::InvalidSubjectId(value));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<&str> for SubjectId {
    type Error = PtiError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<SubjectId> for String {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}

impl SubjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker identity as supplied by the session provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
}

impl Subject {
    pub fn new(id: SubjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Opaque alert identifier, assigned by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(String);

impl AlertId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a recorded audio clip owned by the media service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioRef(String);

impl AudioRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cause that triggered an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Manual,
    Automatic,
    Fall,
    Immobility,
    Sos,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Manual => "manual",
            AlertKind::Automatic => "automatic",
            AlertKind::Fall => "fall",
            AlertKind::Immobility => "immobility",
            AlertKind::Sos => "sos",
        }
    }
}

impl FromStr for AlertKind {
    type Err = PtiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(AlertKind::Manual),
            "automatic" => Ok(AlertKind::Automatic),
            "fall" => Ok(AlertKind::Fall),
            "immobility" => Ok(AlertKind::Immobility),
            "sos" => Ok(AlertKind::Sos),
            other => Err(PtiError::UnknownMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator action on an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Acknowledge,
    Resolve,
    Cancel,
}

impl AlertAction {
    /// Status an alert ends up in after this action
    pub fn target(&self) -> AlertStatus {
        match self {
            AlertAction::Acknowledge => AlertStatus::Acknowledged,
            AlertAction::Resolve => AlertStatus::Resolved,
            AlertAction::Cancel => AlertStatus::Cancelled,
        }
    }
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertAction::Acknowledge => "acknowledge",
            AlertAction::Resolve => "resolve",
            AlertAction::Cancel => "cancel",
        })
    }
}

/// Alert lifecycle status
///
/// - pending -> acknowledged | cancelled
/// - acknowledged -> resolved
/// - resolved, cancelled: terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    /// Actions with an outgoing edge from this status
    pub fn available_actions(&self) -> &'static [AlertAction] {
        match self {
            AlertStatus::Pending => &[AlertAction::Acknowledge, AlertAction::Cancel],
            AlertStatus::Acknowledged => &[AlertAction::Resolve],
            AlertStatus::Resolved | AlertStatus::Cancelled => &[],
        }
    }

    /// Follow the edge for `action`, None if there is none
    pub fn apply(&self, action: AlertAction) -> Option<AlertStatus> {
        self.available_actions()
            .contains(&action)
            .then(|| action.target())
    }

    pub fn is_terminal(&self) -> bool {
        self.available_actions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = PtiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AlertStatus::Pending),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            "cancelled" => Ok(AlertStatus::Cancelled),
            other => Err(PtiError::UnknownMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for creating an alert
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub subject_id: SubjectId,
    pub subject_name: String,
    pub kind: AlertKind,
    pub location: Option<LocationSample>,
    pub audio_ref: Option<AudioRef>,
    pub description: Option<String>,
}

impl NewAlert {
    pub fn new(subject_id: SubjectId, subject_name: impl Into<String>, kind: AlertKind) -> Self {
        Self {
            subject_id,
            subject_name: subject_name.into(),
            kind,
            location: None,
            audio_ref: None,
            description: None,
        }
    }

    pub fn with_location(mut self, location: Option<LocationSample>) -> Self {
        self.location = location;
        self
    }

    pub fn with_audio(mut self, audio_ref: Option<AudioRef>) -> Self {
        self.audio_ref = audio_ref;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Safety alert raised for a worker
///
/// Only `status` and `updated_at` change after creation, and only through
/// [`crate::lifecycle::AlertLifecycle::transition`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// None until the persistence layer assigns one
    pub id: Option<AlertId>,
    pub subject_id: SubjectId,
    /// Display name at creation time
    pub subject_name: String,
    pub kind: AlertKind,
    /// Location snapshot at creation time
    pub location: Option<LocationSample>,
    pub audio_ref: Option<AudioRef>,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub(crate) status: AlertStatus,
    pub(crate) updated_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn status(&self) -> AlertStatus {
        self.status
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Copy of this alert carrying the id assigned by the store
    pub fn with_id(mut self, id: AlertId) -> Self {
        self.id = Some(id);
        self
    }

    /// Pending SOS and fall alerts need a supervisor's immediate attention
    pub fn is_critical(&self) -> bool {
        self.status == AlertStatus::Pending
            && matches!(self.kind, AlertKind::Sos | AlertKind::Fall)
    }
}

/// Custom deserializers
mod serde_helpers {
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrFloat {
            Int(i64),
            Float(f64),
        }

        match IntOrFloat::deserialize(deserializer)? {
            IntOrFloat::Int(i) => Ok(i),
            IntOrFloat::Float(f) if f.is_finite() => Ok(f.round() as i64),
            IntOrFloat::Float(f) => Err(serde::de::Error::custom(format!(
                "invalid timestamp: {}",
                f
            ))),
        }
    }
}
