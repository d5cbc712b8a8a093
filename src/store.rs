//! Document persistence boundary for alerts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::PtiError;
use crate::models::{Alert, AlertId, AlertKind, AlertStatus, SubjectId};

/// Selection of alerts for queries and live feeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertFilter {
    All,
    Pending,
    Resolved,
    Kind(AlertKind),
    Subject(SubjectId),
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        match self {
            AlertFilter::All => true,
            AlertFilter::Pending => alert.status() == AlertStatus::Pending,
            AlertFilter::Resolved => alert.status() == AlertStatus::Resolved,
            AlertFilter::Kind(kind) => alert.kind == *kind,
            AlertFilter::Subject(subject) => alert.subject_id == *subject,
        }
    }

    /// Matching alerts, newest first
    pub fn select<'a, I>(&self, alerts: I) -> Vec<Alert>
    where
        I: IntoIterator<Item = &'a Alert>,
    {
        let mut selected: Vec<Alert> = alerts
            .into_iter()
            .filter(|a| self.matches(a))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        selected
    }
}

/// Live feed of alert lists
///
/// Each message is the complete filtered list, newest first. The feed stops
/// when this handle is dropped or [`AlertSubscription::unsubscribe`] is called.
pub struct AlertSubscription {
    updates: mpsc::Receiver<Vec<Alert>>,
    handle: JoinHandle<()>,
}

impl AlertSubscription {
    pub fn new(updates: mpsc::Receiver<Vec<Alert>>, handle: JoinHandle<()>) -> Self {
        Self { updates, handle }
    }

    /// Next snapshot, None once the feed has ended
    pub async fn recv(&mut self) -> Option<Vec<Alert>> {
        self.updates.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for AlertSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Store a new alert and return the id assigned to it
    async fn persist_alert_create(&self, alert: &Alert) -> Result<AlertId, PtiError>;

    /// Move a stored alert from `from` to `to`
    ///
    /// Fails with `StaleStatus` if the stored alert is no longer in `from`.
    async fn persist_alert_status_change(
        &self,
        id: &AlertId,
        from: AlertStatus,
        to: AlertStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PtiError>;

    /// All alerts of one subject, newest first
    async fn alerts_for_subject(&self, subject: &SubjectId) -> Result<Vec<Alert>, PtiError>;

    async fn subscribe_alerts(&self, filter: AlertFilter) -> Result<AlertSubscription, PtiError>;
}

/// In-process alert store
#[derive(Clone)]
pub struct MemoryAlertStore {
    alerts: Arc<RwLock<Vec<Alert>>>,
    changes: broadcast::Sender<()>,
    next_id: Arc<AtomicU64>,
    reject_writes: Arc<AtomicBool>,
}

impl Default for MemoryAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            alerts: Arc::new(RwLock::new(Vec::new())),
            changes,
            next_id: Arc::new(AtomicU64::new(1)),
            reject_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every following write fail with `PersistenceFailed`
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub async fn get(&self, id: &AlertId) -> Option<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .find(|a| a.id.as_ref() == Some(id))
            .cloned()
    }

    fn check_writable(&self) -> Result<(), PtiError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PtiError::PersistenceFailed("store is read-only".to_string()));
        }
        Ok(())
    }

    fn notify(&self) {
        // No receivers is fine
        let _ = self.changes.send(());
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn persist_alert_create(&self, alert: &Alert) -> Result<AlertId, PtiError> {
        self.check_writable()?;
        let id = AlertId::new(format!(
            "alert-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.alerts
            .write()
            .await
            .push(alert.clone().with_id(id.clone()));
        debug!("Stored alert {}", id);
        self.notify();
        Ok(id)
    }

    async fn persist_alert_status_change(
        &self,
        id: &AlertId,
        from: AlertStatus,
        to: AlertStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<(), PtiError> {
        self.check_writable()?;
        {
            let mut alerts = self.alerts.write().await;
            let alert = alerts
                .iter_mut()
                .find(|a| a.id.as_ref() == Some(id))
                .ok_or_else(|| PtiError::PersistenceFailed(format!("alert {} not found", id)))?;
            if alert.status != from {
                return Err(PtiError::StaleStatus {
                    id: id.to_string(),
                    expected: from,
                });
            }
            alert.status = to;
            alert.updated_at = Some(updated_at);
        }
        self.notify();
        Ok(())
    }

    async fn alerts_for_subject(&self, subject: &SubjectId) -> Result<Vec<Alert>, PtiError> {
        let alerts = self.alerts.read().await;
        Ok(AlertFilter::Subject(subject.clone()).select(alerts.iter()))
    }

    async fn subscribe_alerts(&self, filter: AlertFilter) -> Result<AlertSubscription, PtiError> {
        let (tx, rx) = mpsc::channel(16);
        let mut changes = self.changes.subscribe();
        let alerts = self.alerts.clone();

        let handle = tokio::spawn(async move {
            loop {
                let snapshot = filter.select(alerts.read().await.iter());
                if tx.send(snapshot).await.is_err() {
                    break;
                }
                match changes.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(AlertSubscription::new(rx, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::AlertLifecycle;
    use crate::models::NewAlert;

    fn lifecycle() -> (AlertLifecycle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
        (AlertLifecycle::new(clock.clone()), clock)
    }

    fn subject(id: &str) -> SubjectId {
        SubjectId::try_from(id).unwrap()
    }

    #[test]
    fn filters() {
        let (lifecycle, _) = lifecycle();
        let sos = lifecycle.create(NewAlert::new(subject("w1"), "One", AlertKind::Sos));
        let fall = lifecycle.create(NewAlert::new(subject("w2"), "Two", AlertKind::Fall));
        let acked = lifecycle
            .transition(&fall, crate::models::AlertAction::Acknowledge)
            .unwrap();
        let resolved = lifecycle
            .transition(&acked, crate::models::AlertAction::Resolve)
            .unwrap();

        assert!(AlertFilter::All.matches(&resolved));
        assert!(AlertFilter::Pending.matches(&sos));
        assert!(!AlertFilter::Pending.matches(&acked));
        assert!(AlertFilter::Resolved.matches(&resolved));
        assert!(AlertFilter::Kind(AlertKind::Fall).matches(&acked));
        assert!(!AlertFilter::Kind(AlertKind::Fall).matches(&sos));
        assert!(AlertFilter::Subject(subject("w1")).matches(&sos));
        assert!(!AlertFilter::Subject(subject("w1")).matches(&fall));
    }

    #[tokio::test]
    async fn create_and_update() {
        let (lifecycle, _) = lifecycle();
        let store = MemoryAlertStore::new();
        let alert = lifecycle.create(NewAlert::new(subject("w1"), "One", AlertKind::Sos));

        let id = store.persist_alert_create(&alert).await.unwrap();
        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.id, Some(id.clone()));
        assert_eq!(stored.status(), AlertStatus::Pending);

        let now = Utc::now();
        store
            .persist_alert_status_change(&id, AlertStatus::Pending, AlertStatus::Acknowledged, now)
            .await
            .unwrap();
        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.status(), AlertStatus::Acknowledged);
        assert_eq!(stored.updated_at(), Some(now));
    }

    #[tokio::test]
    async fn unknown_alert_update_fails() {
        let store = MemoryAlertStore::new();
        let result = store
            .persist_alert_status_change(
                &AlertId::new("nope"),
                AlertStatus::Acknowledged,
                AlertStatus::Resolved,
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(PtiError::PersistenceFailed(_))));
    }

    #[tokio::test]
    async fn status_change_from_stale_status_fails() {
        let (lifecycle, _) = lifecycle();
        let store = MemoryAlertStore::new();
        let alert = lifecycle.create(NewAlert::new(subject("w1"), "One", AlertKind::Sos));
        let id = store.persist_alert_create(&alert).await.unwrap();
        store
            .persist_alert_status_change(
                &id,
                AlertStatus::Pending,
                AlertStatus::Cancelled,
                Utc::now(),
            )
            .await
            .unwrap();

        let result = store
            .persist_alert_status_change(
                &id,
                AlertStatus::Pending,
                AlertStatus::Acknowledged,
                Utc::now(),
            )
            .await;
        assert!(matches!(
            result,
            Err(PtiError::StaleStatus {
                expected: AlertStatus::Pending,
                ..
            })
        ));
        assert_eq!(store.get(&id).await.unwrap().status(), AlertStatus::Cancelled);
    }

    #[tokio::test]
    async fn rejected_writes() {
        let (lifecycle, _) = lifecycle();
        let store = MemoryAlertStore::new();
        store.reject_writes(true);
        let alert = lifecycle.create(NewAlert::new(subject("w1"), "One", AlertKind::Sos));
        assert!(matches!(
            store.persist_alert_create(&alert).await,
            Err(PtiError::PersistenceFailed(_))
        ));
    }

    #[tokio::test]
    async fn subject_history_newest_first() {
        let (lifecycle, clock) = lifecycle();
        let store = MemoryAlertStore::new();
        for kind in [AlertKind::Sos, AlertKind::Immobility, AlertKind::Fall] {
            let alert = lifecycle.create(NewAlert::new(subject("w1"), "One", kind));
            store.persist_alert_create(&alert).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        let other = lifecycle.create(NewAlert::new(subject("w2"), "Two", AlertKind::Sos));
        store.persist_alert_create(&other).await.unwrap();

        let history = store.alerts_for_subject(&subject("w1")).await.unwrap();
        let kinds: Vec<AlertKind> = history.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AlertKind::Fall, AlertKind::Immobility, AlertKind::Sos]
        );
    }

    #[tokio::test]
    async fn live_feed() {
        let (lifecycle, _) = lifecycle();
        let store = MemoryAlertStore::new();
        let mut feed = store.subscribe_alerts(AlertFilter::Pending).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), Vec::<Alert>::new());

        let alert = lifecycle.create(NewAlert::new(subject("w1"), "One", AlertKind::Sos));
        let id = store.persist_alert_create(&alert).await.unwrap();
        let pending = feed.recv().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_critical());

        store
            .persist_alert_status_change(
                &id,
                AlertStatus::Pending,
                AlertStatus::Cancelled,
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(feed.recv().await.unwrap().is_empty());

        feed.unsubscribe();
    }
}
