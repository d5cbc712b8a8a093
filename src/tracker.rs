//! Position tracker
//!
//! Owns at most one continuous platform subscription and the most recent
//! accepted sample. Samples are pushed to a single listener channel; the
//! listener can be swapped without re-subscribing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::{DesiredAccuracy, TrackingConfig};
use crate::errors::PtiError;
use crate::geo;
use crate::models::{Coordinates, LocationSample, RawFix};
use crate::platform::{LocationSource, PermissionStatus};

/// Default bound on a single-shot read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Options for [`PositionTracker::read_once`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOptions {
    pub accuracy: DesiredAccuracy,
    pub timeout: Duration,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            accuracy: DesiredAccuracy::High,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Read-only view of the tracker's latest sample
///
/// Cheap to clone; stays valid across start/stop of the subscription.
#[derive(Clone)]
pub struct LocationObserver {
    samples: watch::Receiver<Option<LocationSample>>,
    clock: Arc<dyn Clock>,
}

impl LocationObserver {
    pub fn last_known_location(&self) -> Option<LocationSample> {
        self.samples.borrow().clone()
    }

    /// True iff a sample exists and it is older than the threshold
    pub fn is_immobile_since(&self, threshold_minutes: u64) -> bool {
        let Some(timestamp) = self.samples.borrow().as_ref().map(|s| s.timestamp) else {
            return false;
        };
        let threshold_ms = i64::try_from(threshold_minutes)
            .unwrap_or(i64::MAX)
            .saturating_mul(60_000);
        self.clock.now_millis().saturating_sub(timestamp) > threshold_ms
    }
}

/// Active platform subscription. Dropping it ends the forwarding task.
struct Subscription {
    listeners: mpsc::UnboundedSender<mpsc::Sender<LocationSample>>,
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct PositionTracker {
    source: Arc<dyn LocationSource>,
    clock: Arc<dyn Clock>,
    authorized: bool,
    last_sample: Arc<watch::Sender<Option<LocationSample>>>,
    subscription: Option<Subscription>,
}

impl PositionTracker {
    pub fn new(source: Arc<dyn LocationSource>, clock: Arc<dyn Clock>) -> Self {
        let (last_sample, _) = watch::channel(None);
        Self {
            source,
            clock,
            authorized: false,
            last_sample: Arc::new(last_sample),
            subscription: None,
        }
    }

    /// Ask the platform for location permission. Required before tracking.
    pub async fn request_authorization(&mut self) -> Result<(), PtiError> {
        let status = self
            .source
            .request_permission()
            .await
            .map_err(|e| PtiError::PermissionDenied(e.to_string()))?;

        match status {
            PermissionStatus::Granted => {
                info!("Location permission granted");
                self.authorized = true;
                Ok(())
            }
            PermissionStatus::Denied => {
                warn!("Location permission denied");
                self.authorized = false;
                Err(PtiError::PermissionDenied(
                    "location access was declined".to_string(),
                ))
            }
        }
    }

    /// Fetch a single fix, bounded by `options.timeout`
    ///
    /// Does not touch the continuous subscription. The result becomes the
    /// last known location unless a newer sample is already held.
    pub async fn read_once(&self, options: ReadOptions) -> Result<LocationSample, PtiError> {
        let fix = match timeout(options.timeout, self.source.current_fix(options.accuracy)).await
        {
            Ok(Ok(fix)) => fix,
            Ok(Err(e)) => {
                warn!("Single-shot location read failed: {}", e);
                return Err(PtiError::AcquisitionFailed(e.to_string()));
            }
            Err(_) => {
                warn!("No fix within {:?}", options.timeout);
                return Err(PtiError::AcquisitionFailed(format!(
                    "no fix within {:?}",
                    options.timeout
                )));
            }
        };

        let sample = LocationSample::try_from(fix)
            .map_err(|e| PtiError::AcquisitionFailed(e.to_string()))?;
        remember(&self.last_sample, &sample);
        debug!(
            "Single-shot fix: lat={}, lon={}, accuracy={:?}",
            sample.latitude, sample.longitude, sample.accuracy
        );
        Ok(sample)
    }

    /// Start continuous tracking, delivering accepted samples to `listener`
    ///
    /// If already tracking, only the listener is replaced; no second platform
    /// subscription is created and `config` is ignored.
    ///
    /// Besides `PermissionDenied` and `AcquisitionFailed`, a new subscription
    /// fails with `ConfigurationError` when `config` does not validate.
    pub async fn start_tracking(
        &mut self,
        listener: mpsc::Sender<LocationSample>,
        config: TrackingConfig,
    ) -> Result<(), PtiError> {
        if !self.authorized {
            return Err(PtiError::PermissionDenied(
                "location permission has not been granted".to_string(),
            ));
        }

        let listener = match self.active_subscription() {
            Some(subscription) => match subscription.listeners.send(listener) {
                Ok(()) => {
                    info!("Tracking already active, listener replaced");
                    return Ok(());
                }
                Err(mpsc::error::SendError(listener)) => listener,
            },
            None => listener,
        };

        config.validate()?;
        self.subscription = None;

        let fixes = self.source.watch(&config).await.map_err(|e| match e {
            PtiError::PermissionDenied(reason) => PtiError::PermissionDenied(reason),
            other => PtiError::AcquisitionFailed(other.to_string()),
        })?;

        let (listeners_tx, listeners_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward_fixes(
            fixes,
            listeners_rx,
            listener,
            self.last_sample.clone(),
            FixGate::new(&config),
        ));

        info!(
            "Tracking started: min_interval={:?}, min_distance={}m, accuracy={:?}",
            config.min_interval, config.min_distance_meters, config.desired_accuracy
        );
        self.subscription = Some(Subscription {
            listeners: listeners_tx,
            handle,
        });
        Ok(())
    }

    /// Convenience wrapper creating the listener channel
    pub async fn track(
        &mut self,
        config: TrackingConfig,
    ) -> Result<mpsc::Receiver<LocationSample>, PtiError> {
        let (tx, rx) = mpsc::channel(64);
        self.start_tracking(tx, config).await?;
        Ok(rx)
    }

    /// Release the subscription. The last sample is kept.
    pub fn stop_tracking(&mut self) {
        if self.subscription.take().is_some() {
            info!("Tracking stopped");
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.active_subscription().is_some()
    }

    pub fn last_known_location(&self) -> Option<LocationSample> {
        self.last_sample.borrow().clone()
    }

    pub fn is_immobile_since(&self, threshold_minutes: u64) -> bool {
        self.observer().is_immobile_since(threshold_minutes)
    }

    pub fn observer(&self) -> LocationObserver {
        LocationObserver {
            samples: self.last_sample.subscribe(),
            clock: self.clock.clone(),
        }
    }

    pub fn distance_meters(a: Coordinates, b: Coordinates) -> f64 {
        geo::distance_meters(a, b)
    }

    pub fn is_within_geofence(point: Coordinates, center: Coordinates, radius_meters: f64) -> bool {
        geo::is_within_geofence(point, center, radius_meters)
    }

    fn active_subscription(&self) -> Option<&Subscription> {
        self.subscription
            .as_ref()
            .filter(|s| !s.handle.is_finished())
    }
}

/// Replace the held sample unless it is newer than `sample`
fn remember(last: &watch::Sender<Option<LocationSample>>, sample: &LocationSample) {
    last.send_if_modified(|current| {
        let newer = current
            .as_ref()
            .map_or(true, |c| sample.timestamp >= c.timestamp);
        if newer {
            *current = Some(sample.clone());
        }
        newer
    });
}

/// Decides which continuous fixes are delivered
struct FixGate {
    min_interval_ms: i64,
    min_distance_meters: f64,
    last: Option<LocationSample>,
}

impl FixGate {
    fn new(config: &TrackingConfig) -> Self {
        Self {
            min_interval_ms: i64::try_from(config.min_interval.as_millis()).unwrap_or(i64::MAX),
            min_distance_meters: config.min_distance_meters,
            last: None,
        }
    }

    fn accept(&mut self, sample: &LocationSample) -> bool {
        if let Some(last) = &self.last {
            if sample.timestamp < last.timestamp {
                return false;
            }
            let elapsed = sample.timestamp - last.timestamp;
            let moved = geo::distance_meters(last.coordinates(), sample.coordinates());
            if elapsed < self.min_interval_ms || moved < self.min_distance_meters {
                return false;
            }
        }
        self.last = Some(sample.clone());
        true
    }
}

/// Forward accepted fixes until the subscription is dropped or the platform
/// stream ends
///
/// A listener that falls behind loses fixes; it never stalls the stream.
async fn forward_fixes(
    mut fixes: mpsc::Receiver<RawFix>,
    mut listeners: mpsc::UnboundedReceiver<mpsc::Sender<LocationSample>>,
    mut listener: mpsc::Sender<LocationSample>,
    last_sample: Arc<watch::Sender<Option<LocationSample>>>,
    mut gate: FixGate,
) {
    loop {
        tokio::select! {
            biased;
            replacement = listeners.recv() => match replacement {
                Some(next) => listener = next,
                None => break,
            },
            fix = fixes.recv() => {
                let Some(fix) = fix else {
                    warn!("Platform location stream ended");
                    break;
                };
                let sample = match LocationSample::try_from(fix) {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Discarding fix: {}", e);
                        continue;
                    }
                };
                if !gate.accept(&sample) {
                    trace!("Fix at {} filtered out", sample.timestamp);
                    continue;
                }
                remember(&last_sample, &sample);
                match listener.try_send(sample) {
                    Ok(()) => {}
                    Err(TrySendError::Full(sample)) => {
                        warn!("Tracking listener is full, dropped fix at {}", sample.timestamp);
                    }
                    Err(TrySendError::Closed(_)) => debug!("Tracking listener dropped"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::platform::ScriptedLocationSource;

    const T0: i64 = 1_700_000_000_000;

    fn tracker(
        permission: PermissionStatus,
    ) -> (PositionTracker, ScriptedLocationSource, Arc<ManualClock>) {
        let source = ScriptedLocationSource::new(permission);
        let clock = Arc::new(ManualClock::from_millis(T0));
        let tracker = PositionTracker::new(Arc::new(source.clone()), clock.clone());
        (tracker, source, clock)
    }

    fn sample(lat: f64, lon: f64, timestamp: i64) -> LocationSample {
        LocationSample::new(lat, lon, timestamp).unwrap()
    }

    #[test]
    fn gate_requires_time_and_movement() {
        let mut gate = FixGate::new(&TrackingConfig {
            min_interval: Duration::from_secs(10),
            min_distance_meters: 10.0,
            desired_accuracy: DesiredAccuracy::High,
        });

        assert!(gate.accept(&sample(45.0, 5.0, T0)));
        // moved ~111 m but too soon
        assert!(!gate.accept(&sample(45.001, 5.0, T0 + 5_000)));
        // late enough but moved ~1 m
        assert!(!gate.accept(&sample(45.00001, 5.0, T0 + 20_000)));
        assert!(gate.accept(&sample(45.001, 5.0, T0 + 20_000)));
        // older than the last accepted fix
        assert!(!gate.accept(&sample(46.0, 5.0, T0 + 1_000)));
    }

    #[test]
    fn remember_keeps_newest() {
        let (tx, _) = watch::channel(None);
        remember(&tx, &sample(1.0, 1.0, 20));
        remember(&tx, &sample(2.0, 2.0, 10));
        assert_eq!(tx.borrow().as_ref().unwrap().timestamp, 20);
        remember(&tx, &sample(3.0, 3.0, 20));
        assert_eq!(tx.borrow().as_ref().unwrap().latitude, 3.0);
    }

    #[tokio::test]
    async fn start_requires_authorization() {
        let (mut tracker, _, _) = tracker(PermissionStatus::Granted);
        let (tx, _rx) = mpsc::channel(1);
        let result = tracker.start_tracking(tx, TrackingConfig::default()).await;
        assert!(matches!(result, Err(PtiError::PermissionDenied(_))));
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn denied_permission() {
        let (mut tracker, _, _) = tracker(PermissionStatus::Denied);
        assert!(matches!(
            tracker.request_authorization().await,
            Err(PtiError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn read_once_updates_last_known() {
        let (tracker, source, _) = tracker(PermissionStatus::Granted);
        source
            .queue_read(Ok(RawFix::new(48.85, 2.35, T0).with_accuracy(5.0)))
            .await;

        let read = tracker.read_once(ReadOptions::default()).await.unwrap();
        assert_eq!(read.accuracy, Some(5.0));
        assert_eq!(tracker.last_known_location(), Some(read));
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn read_once_times_out() {
        let (tracker, _, _) = tracker(PermissionStatus::Granted);
        let options = ReadOptions {
            timeout: Duration::from_millis(20),
            ..ReadOptions::default()
        };
        assert!(matches!(
            tracker.read_once(options).await,
            Err(PtiError::AcquisitionFailed(_))
        ));
        assert_eq!(tracker.last_known_location(), None);
    }

    #[tokio::test]
    async fn read_once_rejects_invalid_fix() {
        let (tracker, source, _) = tracker(PermissionStatus::Granted);
        source.queue_read(Ok(RawFix::new(120.0, 0.0, T0))).await;
        assert!(matches!(
            tracker.read_once(ReadOptions::default()).await,
            Err(PtiError::AcquisitionFailed(_))
        ));
    }

    #[tokio::test]
    async fn immobility() {
        let (tracker, source, clock) = tracker(PermissionStatus::Granted);
        assert!(!tracker.is_immobile_since(0));

        source.queue_read(Ok(RawFix::new(10.0, 10.0, T0))).await;
        tracker.read_once(ReadOptions::default()).await.unwrap();

        clock.advance(chrono::Duration::minutes(5));
        assert!(!tracker.is_immobile_since(5));
        clock.advance(chrono::Duration::milliseconds(1));
        assert!(tracker.is_immobile_since(5));
        assert!(tracker.observer().is_immobile_since(5));
    }

    #[tokio::test]
    async fn platform_stream_end_stops_tracking() {
        let (mut tracker, source, _) = tracker(PermissionStatus::Granted);
        tracker.request_authorization().await.unwrap();
        let mut rx = tracker.track(TrackingConfig::unfiltered()).await.unwrap();
        assert!(tracker.is_tracking());

        source.close_watch().await;
        assert_eq!(rx.recv().await, None);
        tokio::task::yield_now().await;
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let (mut tracker, source, _) = tracker(PermissionStatus::Granted);
        tracker.request_authorization().await.unwrap();
        let config = TrackingConfig {
            min_distance_meters: f64::NAN,
            ..TrackingConfig::unfiltered()
        };

        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            tracker.start_tracking(tx, config).await,
            Err(PtiError::ConfigurationError { .. })
        ));
        assert!(!tracker.is_tracking());
        assert_eq!(source.watch_calls(), 0);
    }
}
