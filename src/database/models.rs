// src/database/models.rs
use chrono::{DateTime, Utc};

use crate::{
    errors::PtiError,
    models::{Alert, AlertId, AudioRef, LocationSample, SubjectId},
};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AlertRow {
    pub id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub kind: String,
    pub status: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub location_time: Option<i64>, // epoch millis of the snapshot
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub audio_ref: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = PtiError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        let location = match (row.latitude, row.longitude, row.location_time) {
            (Some(latitude), Some(longitude), Some(timestamp)) => Some(LocationSample {
                latitude,
                longitude,
                accuracy: row.accuracy,
                timestamp,
                speed: row.speed,
                heading: row.heading,
            }),
            _ => None,
        };

        Ok(Alert {
            id: Some(AlertId::new(row.id)),
            subject_id: SubjectId::try_from(row.subject_id)?,
            subject_name: row.subject_name,
            kind: row.kind.parse()?,
            location,
            audio_ref: row.audio_ref.map(AudioRef::new),
            created_at: row.created_at,
            description: row.description,
            status: row.status.parse()?,
            updated_at: row.updated_at,
        })
    }
}
