//! Errors for the PTI safety core
use thiserror::Error;

use crate::models::{AlertAction, AlertStatus};

#[derive(Error, Debug)]
pub enum PtiError {
    #[error("Location permission denied: {0}")]
    PermissionDenied(String),

    #[error("Location acquisition failed: {0}")]
    AcquisitionFailed(String),

    #[error("Cannot {action} an alert that is {from}")]
    InvalidTransition {
        from: AlertStatus,
        action: AlertAction,
    },

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Alert {id} is no longer {expected}")]
    StaleStatus { id: String, expected: AlertStatus },

    #[error("Alert has not been persisted yet")]
    AlertNotPersisted,

    #[error("Invalid coordinates: lat={latitude}, lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("Invalid subject id")]
    InvalidSubjectId(String),

    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Invalid topic")]
    InvalidTopic(String),

    #[error("Unknown message type")]
    UnknownMessageType(String),

    #[error("Database connection error: {0}")]
    DatabaseConnectionError(String),

    #[error("Database migration error: {0}")]
    MigrationError(String),
}

impl From<sqlx::Error> for PtiError {
    fn from(e: sqlx::Error) -> Self {
        PtiError::PersistenceFailed(e.to_string())
    }
}
