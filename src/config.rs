//! Application configuration

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::PtiError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub subject: SubjectConfig,
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// Worker this device belongs to
#[derive(Debug, Deserialize, Clone)]
pub struct SubjectConfig {
    pub id: String,
    pub name: String,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    /// Broker host name, or full `wss://` URL for the websocket transport
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: String,
    /// Topics `<prefix>/location` and `<prefix>/alert` are used
    pub topic_prefix: String,
    #[serde(default)]
    pub transport: MqttTransport,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Duration,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    #[default]
    Tcp,
    Tls,
    Wss,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Desired accuracy of platform fixes
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredAccuracy {
    Low,
    Medium,
    #[default]
    High,
}

impl DesiredAccuracy {
    /// Largest accuracy radius, in meters, that satisfies this level
    pub fn max_error_meters(&self) -> f64 {
        match self {
            DesiredAccuracy::Low => 1000.0,
            DesiredAccuracy::Medium => 100.0,
            DesiredAccuracy::High => 10.0,
        }
    }

    /// Whether a fix with the given accuracy radius is good enough.
    /// Fixes that do not report accuracy are accepted.
    pub fn accepts(&self, accuracy: Option<f64>) -> bool {
        accuracy.map_or(true, |a| a <= self.max_error_meters())
    }
}

/// Continuous tracking parameters
#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TrackingConfig {
    /// Minimum time between delivered samples
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(default = "default_min_interval")]
    pub min_interval: Duration,
    /// Minimum movement between delivered samples
    #[serde(default = "default_min_distance")]
    pub min_distance_meters: f64,
    #[serde(default)]
    pub desired_accuracy: DesiredAccuracy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            min_distance_meters: default_min_distance(),
            desired_accuracy: DesiredAccuracy::default(),
        }
    }
}

impl TrackingConfig {
    /// Deliver every fix, regardless of time or movement
    pub fn unfiltered() -> Self {
        Self {
            min_interval: Duration::ZERO,
            min_distance_meters: 0.0,
            desired_accuracy: DesiredAccuracy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), PtiError> {
        if !self.min_distance_meters.is_finite() || self.min_distance_meters < 0.0 {
            return Err(PtiError::ConfigurationError {
                message: "Minimum distance must be a non-negative number".to_string(),
            });
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AlertConfig {
    /// Bound on a single-shot location read
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(default = "default_immobility_threshold")]
    pub immobility_threshold_minutes: u64,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_immobility_check_interval")]
    pub immobility_check_interval: Duration,
    /// Length of the audio clip attached to SOS alerts
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_audio_duration")]
    pub audio_duration: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            immobility_threshold_minutes: default_immobility_threshold(),
            immobility_check_interval: default_immobility_check_interval(),
            audio_duration: default_audio_duration(),
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(5)
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_interval() -> Duration {
    Duration::from_millis(10_000)
}

fn default_min_distance() -> f64 {
    10.0
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_immobility_threshold() -> u64 {
    5
}

fn default_immobility_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_audio_duration() -> Duration {
    Duration::from_secs(10)
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(File::with_name("config/default").required(false))
    }

    /// Load from an explicit file, still allowing environment overrides
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("PTI")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), PtiError> {
        if self.subject.id.trim().is_empty() {
            return Err(PtiError::ConfigurationError {
                message: "Subject id cannot be empty".to_string(),
            });
        }
        if self.database.url.is_empty() {
            return Err(PtiError::ConfigurationError {
                message: "Database url cannot be empty".to_string(),
            });
        }
        self.tracking.validate()?;
        self.alerts.validate()
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), PtiError> {
        if self.read_timeout.is_zero() {
            return Err(PtiError::ConfigurationError {
                message: "Read timeout must be greater than zero".to_string(),
            });
        }
        if self.immobility_check_interval.is_zero() {
            return Err(PtiError::ConfigurationError {
                message: "Immobility check interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
