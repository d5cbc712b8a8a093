//! Boundaries to the device platform: location fixes and media capture.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::{DesiredAccuracy, TrackingConfig};
use crate::errors::PtiError;
use crate::models::{AudioRef, RawFix};

/// Outcome of a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Platform location API
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Prompt for location permission
    async fn request_permission(&self) -> Result<PermissionStatus, PtiError>;

    /// Produce a single fix. May wait indefinitely; callers bound it.
    async fn current_fix(&self, accuracy: DesiredAccuracy) -> Result<RawFix, PtiError>;

    /// Start delivering fixes. Delivery stops when the receiver is dropped.
    async fn watch(&self, options: &TrackingConfig) -> Result<mpsc::Receiver<RawFix>, PtiError>;
}

/// Media capture service
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Record a clip of the given length and return a reference to it
    async fn record(&self, duration: Duration) -> Result<AudioRef, PtiError>;
}

/// Location source driven by the caller, for tests and replays
///
/// One-shot reads are served from a queue and wait forever when it is empty.
/// Continuous fixes are pushed to whichever watcher was registered last.
#[derive(Clone)]
pub struct ScriptedLocationSource {
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    permission: PermissionStatus,
    one_shot: Mutex<VecDeque<Result<RawFix, PtiError>>>,
    watcher: Mutex<Option<mpsc::Sender<RawFix>>>,
    watch_calls: AtomicUsize,
}

impl ScriptedLocationSource {
    pub fn new(permission: PermissionStatus) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                permission,
                one_shot: Mutex::new(VecDeque::new()),
                watcher: Mutex::new(None),
                watch_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue the result of the next `current_fix` call
    pub async fn queue_read(&self, result: Result<RawFix, PtiError>) {
        self.inner.one_shot.lock().await.push_back(result);
    }

    /// Deliver a fix to the active watcher. Returns false if nobody listens.
    pub async fn push_fix(&self, fix: RawFix) -> bool {
        let watcher = self.inner.watcher.lock().await.clone();
        match watcher {
            Some(tx) => tx.send(fix).await.is_ok(),
            None => false,
        }
    }

    /// End the active watch stream, as if the platform dropped it
    pub async fn close_watch(&self) {
        self.inner.watcher.lock().await.take();
    }

    /// Whether the most recent watch stream still has a receiver
    pub async fn is_watched(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of subscriptions created so far
    pub fn watch_calls(&self) -> usize {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationSource for ScriptedLocationSource {
    async fn request_permission(&self) -> Result<PermissionStatus, PtiError> {
        Ok(self.inner.permission)
    }

    async fn current_fix(&self, _accuracy: DesiredAccuracy) -> Result<RawFix, PtiError> {
        let next = self.inner.one_shot.lock().await.pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn watch(&self, options: &TrackingConfig) -> Result<mpsc::Receiver<RawFix>, PtiError> {
        if self.inner.permission == PermissionStatus::Denied {
            return Err(PtiError::PermissionDenied(
                "location access revoked".to_string(),
            ));
        }
        debug!("Scripted watch started with {:?}", options);
        let (tx, rx) = mpsc::channel(32);
        *self.inner.watcher.lock().await = Some(tx);
        self.inner.watch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }
}
