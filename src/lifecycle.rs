//! Alert lifecycle state machine.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::errors::PtiError;
use crate::models::{Alert, AlertAction, AlertStatus, NewAlert};

/// Creates alerts and moves them along the status graph
///
/// Role checks (who may cancel, who may resolve) belong to the caller; this
/// only enforces which edges exist.
#[derive(Clone)]
pub struct AlertLifecycle {
    clock: Arc<dyn Clock>,
}

impl AlertLifecycle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// New alert in `Pending`, stamped with the current time
    pub fn create(&self, new: NewAlert) -> Alert {
        debug!(
            "Creating {} alert for subject {} (location: {})",
            new.kind,
            new.subject_id,
            new.location.is_some()
        );
        Alert {
            id: None,
            subject_id: new.subject_id,
            subject_name: new.subject_name,
            kind: new.kind,
            location: new.location,
            audio_ref: new.audio_ref,
            created_at: self.clock.now(),
            description: new.description,
            status: AlertStatus::Pending,
            updated_at: None,
        }
    }

    /// Apply `action`, returning the updated copy
    pub fn transition(&self, alert: &Alert, action: AlertAction) -> Result<Alert, PtiError> {
        let Some(next) = alert.status.apply(action) else {
            warn!(
                "Rejected {} on {} alert {:?}",
                action, alert.status, alert.id
            );
            return Err(PtiError::InvalidTransition {
                from: alert.status,
                action,
            });
        };

        Ok(Alert {
            status: next,
            updated_at: Some(self.clock.now()),
            ..alert.clone()
        })
    }
}
