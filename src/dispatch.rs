//! Raising and updating alerts against the store.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{AlertConfig, DesiredAccuracy};
use crate::errors::PtiError;
use crate::lifecycle::AlertLifecycle;
use crate::models::{Alert, AlertAction, AlertKind, NewAlert, Subject, SubjectId};
use crate::platform::MediaCapture;
use crate::store::{AlertFilter, AlertStore, AlertSubscription};
use crate::tracker::{LocationObserver, PositionTracker, ReadOptions};

pub const SOS_DESCRIPTION: &str = "Manual SOS alert triggered";

/// Alert lifecycle backed by a store
#[derive(Clone)]
pub struct AlertService {
    lifecycle: AlertLifecycle,
    store: Arc<dyn AlertStore>,
    config: AlertConfig,
}

impl AlertService {
    pub fn new(lifecycle: AlertLifecycle, store: Arc<dyn AlertStore>, config: AlertConfig) -> Self {
        Self {
            lifecycle,
            store,
            config,
        }
    }

    /// Create a pending alert and persist it
    pub async fn raise(&self, new: NewAlert) -> Result<Alert, PtiError> {
        let alert = self.lifecycle.create(new);
        let id = self.store.persist_alert_create(&alert).await?;
        info!(
            "Raised {} alert {} for {} ({})",
            alert.kind, id, alert.subject_name, alert.subject_id
        );
        Ok(alert.with_id(id))
    }

    /// Apply an operator action and persist the new status
    ///
    /// The write only succeeds while the stored alert still has the status
    /// of `alert`; a stale copy gets `StaleStatus`.
    pub async fn apply(&self, alert: &Alert, action: AlertAction) -> Result<Alert, PtiError> {
        let id = alert.id.as_ref().ok_or(PtiError::AlertNotPersisted)?;
        let updated = self.lifecycle.transition(alert, action)?;
        let updated_at = updated.updated_at().unwrap_or(updated.created_at);

        self.store
            .persist_alert_status_change(id, alert.status(), updated.status(), updated_at)
            .await?;
        info!("Alert {} is now {}", id, updated.status());
        Ok(updated)
    }

    /// Raise an alert of `kind` with a fresh location and optional audio
    ///
    /// A failed fix falls back to the last known location, or none at all;
    /// a failed recording is dropped. Neither prevents the alert.
    pub async fn trigger(
        &self,
        tracker: &PositionTracker,
        subject: &Subject,
        kind: AlertKind,
        description: impl Into<String>,
        media: Option<&dyn MediaCapture>,
    ) -> Result<Alert, PtiError> {
        let options = ReadOptions {
            accuracy: DesiredAccuracy::High,
            timeout: self.config.read_timeout,
        };
        let location = match tracker.read_once(options).await {
            Ok(sample) => Some(sample),
            Err(e) => {
                let fallback = tracker.last_known_location();
                warn!(
                    "No fresh fix for {} alert ({}), falling back to {}",
                    kind,
                    e,
                    if fallback.is_some() {
                        "last known location"
                    } else {
                        "no location"
                    }
                );
                fallback
            }
        };

        let audio_ref = match media {
            Some(media) => match media.record(self.config.audio_duration).await {
                Ok(audio_ref) => Some(audio_ref),
                Err(e) => {
                    warn!("Audio capture failed, raising alert without it: {}", e);
                    None
                }
            },
            None => None,
        };

        self.raise(
            NewAlert::new(subject.id.clone(), subject.name.clone(), kind)
                .with_location(location)
                .with_audio(audio_ref)
                .with_description(description),
        )
        .await
    }

    /// SOS button press
    pub async fn trigger_sos(
        &self,
        tracker: &PositionTracker,
        subject: &Subject,
        media: Option<&dyn MediaCapture>,
    ) -> Result<Alert, PtiError> {
        self.trigger(tracker, subject, AlertKind::Sos, SOS_DESCRIPTION, media).await
    }

    pub async fn history(&self, subject: &SubjectId) -> Result<Vec<Alert>, PtiError> {
        self.store.alerts_for_subject(subject).await
    }

    pub async fn subscribe(&self, filter: AlertFilter) -> Result<AlertSubscription, PtiError> {
        self.store.subscribe_alerts(filter).await
    }
}

/// Raises an immobility alert when no fix has been accepted for too long
///
/// One alert per episode: the watchdog re-arms once a newer sample arrives.
pub struct ImmobilityWatchdog {
    service: AlertService,
    observer: LocationObserver,
    subject: Subject,
    threshold_minutes: u64,
    check_interval: std::time::Duration,
    reported: Option<i64>,
}

impl ImmobilityWatchdog {
    pub fn new(
        service: AlertService,
        observer: LocationObserver,
        subject: Subject,
        config: &AlertConfig,
    ) -> Result<Self, PtiError> {
        config.validate()?;
        Ok(Self {
            service,
            observer,
            subject,
            threshold_minutes: config.immobility_threshold_minutes,
            check_interval: config.immobility_check_interval,
            reported: None,
        })
    }

    /// Run one check, returning the alert if one was raised
    pub async fn check(&mut self) -> Result<Option<Alert>, PtiError> {
        if !self.observer.is_immobile_since(self.threshold_minutes) {
            return Ok(None);
        }
        let last = self.observer.last_known_location();
        let stamp = last.as_ref().map(|s| s.timestamp);
        if stamp == self.reported {
            return Ok(None);
        }

        let alert = self
            .service
            .raise(
                NewAlert::new(
                    self.subject.id.clone(),
                    self.subject.name.clone(),
                    AlertKind::Immobility,
                )
                .with_location(last)
                .with_description(format!(
                    "No movement for more than {} minutes",
                    self.threshold_minutes
                )),
            )
            .await?;
        self.reported = stamp;
        Ok(Some(alert))
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.check().await {
                error!("Immobility check failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::models::{AlertStatus, AudioRef, RawFix};
    use crate::platform::{PermissionStatus, ScriptedLocationSource};
    use crate::store::MemoryAlertStore;

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        source: ScriptedLocationSource,
        store: MemoryAlertStore,
        tracker: PositionTracker,
        service: AlertService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::from_millis(T0));
        let source = ScriptedLocationSource::new(PermissionStatus::Granted);
        let store = MemoryAlertStore::new();
        let tracker = PositionTracker::new(Arc::new(source.clone()), clock.clone());
        let service = AlertService::new(
            AlertLifecycle::new(clock.clone()),
            Arc::new(store.clone()),
            AlertConfig::default(),
        );
        Fixture {
            clock,
            source,
            store,
            tracker,
            service,
        }
    }

    fn worker() -> Subject {
        Subject::new(SubjectId::try_from("w1").unwrap(), "Alice")
    }

    struct Microphone(Option<&'static str>);

    #[async_trait::async_trait]
    impl MediaCapture for Microphone {
        async fn record(&self, duration: Duration) -> Result<AudioRef, PtiError> {
            assert_eq!(duration, Duration::from_secs(10));
            match self.0 {
                Some(path) => Ok(AudioRef::new(path)),
                None => Err(PtiError::PermissionDenied("microphone".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn raise_assigns_id() {
        let f = fixture();
        let subject = worker();
        let alert = f
            .service
            .raise(NewAlert::new(subject.id, subject.name, AlertKind::Manual))
            .await
            .unwrap();

        let id = alert.id.clone().unwrap();
        assert_eq!(f.store.get(&id).await.unwrap(), alert);
        assert_eq!(alert.status(), AlertStatus::Pending);
    }

    #[tokio::test]
    async fn apply_requires_persisted_alert() {
        let f = fixture();
        let subject = worker();
        let draft = AlertLifecycle::new(f.clock.clone()).create(NewAlert::new(
            subject.id,
            subject.name,
            AlertKind::Sos,
        ));
        assert!(matches!(
            f.service.apply(&draft, AlertAction::Acknowledge).await,
            Err(PtiError::AlertNotPersisted)
        ));
    }

    #[tokio::test]
    async fn apply_persists_status() {
        let f = fixture();
        let subject = worker();
        let alert = f
            .service
            .raise(NewAlert::new(subject.id, subject.name, AlertKind::Fall))
            .await
            .unwrap();
        let id = alert.id.clone().unwrap();

        f.clock.advance(chrono::Duration::seconds(30));
        let acked = f
            .service
            .apply(&alert, AlertAction::Acknowledge)
            .await
            .unwrap();
        let stored = f.store.get(&id).await.unwrap();
        assert_eq!(stored.status(), AlertStatus::Acknowledged);
        assert_eq!(stored.updated_at(), acked.updated_at());

        let err = f.service.apply(&acked, AlertAction::Cancel).await;
        assert!(matches!(err, Err(PtiError::InvalidTransition { .. })));
        assert_eq!(
            f.store.get(&id).await.unwrap().status(),
            AlertStatus::Acknowledged
        );

        f.service.apply(&acked, AlertAction::Resolve).await.unwrap();
        assert_eq!(
            f.store.get(&id).await.unwrap().status(),
            AlertStatus::Resolved
        );
    }

    #[tokio::test]
    async fn sos_with_fresh_fix_and_audio() {
        let f = fixture();
        f.source
            .queue_read(Ok(RawFix::new(48.85, 2.35, T0).with_accuracy(5.0)))
            .await;

        let alert = f
            .service
            .trigger_sos(&f.tracker, &worker(), Some(&Microphone(Some("clips/1.m4a"))))
            .await
            .unwrap();

        assert_eq!(alert.kind, AlertKind::Sos);
        assert_eq!(alert.description.as_deref(), Some(SOS_DESCRIPTION));
        assert_eq!(alert.location.as_ref().map(|l| l.timestamp), Some(T0));
        assert_eq!(alert.audio_ref, Some(AudioRef::new("clips/1.m4a")));
        assert_eq!(alert.subject_name, "Alice");
    }

    #[tokio::test]
    async fn sos_falls_back_to_last_known_location() {
        let f = fixture();
        f.source.queue_read(Ok(RawFix::new(45.0, 5.0, T0))).await;
        f.tracker.read_once(ReadOptions::default()).await.unwrap();
        f.source
            .queue_read(Err(PtiError::AcquisitionFailed("no signal".to_string())))
            .await;

        let alert = f
            .service
            .trigger_sos(&f.tracker, &worker(), Some(&Microphone(None)))
            .await
            .unwrap();

        let location = alert.location.unwrap();
        assert_eq!((location.latitude, location.longitude), (45.0, 5.0));
        assert_eq!(alert.audio_ref, None);
    }

    #[tokio::test]
    async fn sos_without_any_location() {
        let f = fixture();
        f.source
            .queue_read(Err(PtiError::AcquisitionFailed("no signal".to_string())))
            .await;

        let alert = f
            .service
            .trigger_sos(&f.tracker, &worker(), None)
            .await
            .unwrap();
        assert!(alert.location.is_none());
        assert!(alert.id.is_some());
    }

    #[tokio::test]
    async fn sos_surfaces_persistence_failure() {
        let f = fixture();
        f.source.queue_read(Ok(RawFix::new(45.0, 5.0, T0))).await;
        f.store.reject_writes(true);

        let result = f.service.trigger_sos(&f.tracker, &worker(), None).await;
        assert!(matches!(result, Err(PtiError::PersistenceFailed(_))));
    }

    #[tokio::test]
    async fn watchdog_raises_once_per_episode() {
        let f = fixture();
        let mut watchdog = ImmobilityWatchdog::new(
            f.service.clone(),
            f.tracker.observer(),
            worker(),
            &AlertConfig::default(),
        )
        .unwrap();

        // No sample yet
        f.clock.advance(chrono::Duration::minutes(10));
        assert!(watchdog.check().await.unwrap().is_none());

        let now = f.clock.now_millis();
        f.source.queue_read(Ok(RawFix::new(45.0, 5.0, now))).await;
        f.tracker.read_once(ReadOptions::default()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(4));
        assert!(watchdog.check().await.unwrap().is_none());

        f.clock.advance(chrono::Duration::minutes(2));
        let alert = watchdog.check().await.unwrap().unwrap();
        assert_eq!(alert.kind, AlertKind::Immobility);
        assert_eq!(alert.location.as_ref().map(|l| l.timestamp), Some(now));

        f.clock.advance(chrono::Duration::minutes(10));
        assert!(watchdog.check().await.unwrap().is_none());

        // Movement re-arms the watchdog
        let later = f.clock.now_millis();
        f.source.queue_read(Ok(RawFix::new(45.1, 5.1, later))).await;
        f.tracker.read_once(ReadOptions::default()).await.unwrap();
        assert!(watchdog.check().await.unwrap().is_none());
        f.clock.advance(chrono::Duration::minutes(6));
        assert!(watchdog.check().await.unwrap().is_some());

        let history = f.service.history(&worker().id).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn watchdog_retries_after_failed_write() {
        let f = fixture();
        let mut watchdog = ImmobilityWatchdog::new(
            f.service.clone(),
            f.tracker.observer(),
            worker(),
            &AlertConfig::default(),
        )
        .unwrap();
        f.source.queue_read(Ok(RawFix::new(45.0, 5.0, T0))).await;
        f.tracker.read_once(ReadOptions::default()).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(6));

        f.store.reject_writes(true);
        assert!(watchdog.check().await.is_err());
        f.store.reject_writes(false);
        assert!(watchdog.check().await.unwrap().is_some());
    }

    #[test]
    fn watchdog_rejects_zero_check_interval() {
        let f = fixture();
        let config = AlertConfig {
            immobility_check_interval: Duration::ZERO,
            ..AlertConfig::default()
        };
        let result = ImmobilityWatchdog::new(f.service, f.tracker.observer(), worker(), &config);
        assert!(matches!(result, Err(PtiError::ConfigurationError { .. })));
    }
}
