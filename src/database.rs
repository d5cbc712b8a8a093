//! Postgres alert store

mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    PgPool, Postgres,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::DatabaseConfig,
    errors::PtiError,
    models::{Alert, AlertId, AlertStatus, SubjectId},
    store::{AlertFilter, AlertStore, AlertSubscription},
};
use models::AlertRow;

/// Notification channel fed by the `alerts_changed` trigger
const ALERTS_CHANNEL: &str = "alerts_changed";

macro_rules! select_alerts {
    ($clause:literal) => {
        concat!(
            "SELECT id, subject_id, subject_name, kind, status, latitude, longitude, ",
            "accuracy, location_time, speed, heading, audio_ref, description, ",
            "created_at, updated_at FROM alerts ",
            $clause,
            " ORDER BY created_at DESC"
        )
    };
}

/// Alert persistence on Postgres
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Wrap an existing pool, running pending migrations
    pub async fn new(pool: PgPool) -> Result<Self, PtiError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PtiError::MigrationError(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, PtiError> {
        info!("Connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| PtiError::DatabaseConnectionError(e.to_string()))?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_alerts(pool: &PgPool, filter: &AlertFilter) -> Result<Vec<Alert>, PtiError> {
        let query = match filter {
            AlertFilter::All => sqlx::query_as::<Postgres, AlertRow>(select_alerts!("")),
            AlertFilter::Pending => sqlx::query_as(select_alerts!("WHERE status = $1"))
                .bind(AlertStatus::Pending.as_str()),
            AlertFilter::Resolved => sqlx::query_as(select_alerts!("WHERE status = $1"))
                .bind(AlertStatus::Resolved.as_str()),
            AlertFilter::Kind(kind) => {
                sqlx::query_as(select_alerts!("WHERE kind = $1")).bind(kind.as_str())
            }
            AlertFilter::Subject(subject) => {
                sqlx::query_as(select_alerts!("WHERE subject_id = $1")).bind(subject.as_str())
            }
        };

        query
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(Alert::try_from)
            .collect()
    }
}

#[async_trait]
impl AlertStore for Database {
    async fn persist_alert_create(&self, alert: &Alert) -> Result<AlertId, PtiError> {
        let location = alert.location.as_ref();
        let id: String = sqlx::query_scalar(
            "INSERT INTO alerts (
                subject_id, subject_name, kind, status, latitude, longitude,
                accuracy, location_time, speed, heading, audio_ref, description,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id",
        )
        .bind(alert.subject_id.as_str())
        .bind(alert.subject_name.as_str())
        .bind(alert.kind.as_str())
        .bind(alert.status().as_str())
        .bind(location.map(|l| l.latitude))
        .bind(location.map(|l| l.longitude))
        .bind(location.and_then(|l| l.accuracy))
        .bind(location.map(|l| l.timestamp))
        .bind(location.and_then(|l| l.speed))
        .bind(location.and_then(|l| l.heading))
        .bind(alert.audio_ref.as_ref().map(|a| a.as_str()))
        .bind(alert.description.as_deref())
        .bind(alert.created_at)
        .bind(alert.updated_at())
        .fetch_one(&self.pool)
        .await?;

        debug!("Inserted {} alert {}", alert.kind, id);
        Ok(AlertId::new(id))
    }

    async fn persist_alert_status_change(
        &self,
        id: &AlertId,
        from: AlertStatus,
        to: AlertStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PtiError> {
        let result = sqlx::query(
            "UPDATE alerts SET status = $1, updated_at = $2 WHERE id = $3 AND status = $4",
        )
        .bind(to.as_str())
        .bind(updated_at)
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM alerts WHERE id = $1)")
                    .bind(id.as_str())
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists {
                PtiError::StaleStatus {
                    id: id.to_string(),
                    expected: from,
                }
            } else {
                PtiError::PersistenceFailed(format!("alert {} not found", id))
            });
        }
        debug!("Alert {} is now {}", id, to);
        Ok(())
    }

    async fn alerts_for_subject(&self, subject: &SubjectId) -> Result<Vec<Alert>, PtiError> {
        Self::fetch_alerts(&self.pool, &AlertFilter::Subject(subject.clone())).await
    }

    async fn subscribe_alerts(&self, filter: AlertFilter) -> Result<AlertSubscription, PtiError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(ALERTS_CHANNEL).await?;
        let pool = self.pool.clone();
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move {
            loop {
                match Self::fetch_alerts(&pool, &filter).await {
                    Ok(alerts) => {
                        if tx.send(alerts).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to refresh alerts: {}", e),
                }

                match listener.recv().await {
                    Ok(notification) => {
                        debug!("Alert {} changed", notification.payload());
                    }
                    Err(e) => {
                        error!("Alert notification stream failed: {}", e);
                        break;
                    }
                }
            }
        });

        info!("Subscribed to alert changes");
        Ok(AlertSubscription::new(rx, handle))
    }
}
