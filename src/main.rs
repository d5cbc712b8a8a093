//! PTI guard: relays a wearable's fixes and alerts to the alert store

use std::sync::Arc;

use pti_guard::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    database::Database,
    dispatch::{AlertService, ImmobilityWatchdog},
    errors::PtiError,
    lifecycle::AlertLifecycle,
    models::{Alert, AlertKind, Subject, SubjectId},
    mqtt::{DeviceAlert, MqttBridge, MqttBridgeBuilder},
    store::{AlertFilter, AlertSubscription},
    tracker::PositionTracker,
};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), PtiError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;
    let subject = Subject::new(
        SubjectId::try_from(config.subject.id.as_str())?,
        config.subject.name.as_str(),
    );

    let database = Database::connect(&config.database).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = AlertService::new(
        AlertLifecycle::new(clock.clone()),
        Arc::new(database),
        config.alerts.clone(),
    );

    let bridge = MqttBridgeBuilder::new(&config.mqtt)?.connect();
    let mut tracker = PositionTracker::new(Arc::new(bridge.location_source()), clock);
    tracker.request_authorization().await?;

    let watchdog = ImmobilityWatchdog::new(
        service.clone(),
        tracker.observer(),
        subject.clone(),
        &config.alerts,
    )?;
    let watchdog = tokio::spawn(watchdog.run());
    let pending = service.subscribe(AlertFilter::Pending).await?;

    let result = run_guard(&mut tracker, bridge, &service, &subject, pending, &config).await;

    tracker.stop_tracking();
    watchdog.abort();
    info!("PTI guard stopped");
    result
}

async fn run_guard(
    tracker: &mut PositionTracker,
    mut bridge: MqttBridge,
    service: &AlertService,
    subject: &Subject,
    mut pending: AlertSubscription,
    config: &AppConfig,
) -> Result<(), PtiError> {
    let mut samples = tracker.track(config.tracking.clone()).await?;
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Tracking {} ({})", subject.name, subject.id);
    loop {
        tokio::select! {
            sample = samples.recv() => match sample {
                Some(sample) => debug!(
                    "Position: lat={}, lon={}, accuracy={:?}",
                    sample.latitude, sample.longitude, sample.accuracy
                ),
                None => {
                    warn!("Location stream ended");
                    break;
                }
            },
            device_alert = bridge.recv_alert() => match device_alert {
                Some(device_alert) => {
                    let raised = raise_device_alert(tracker, service, subject, device_alert).await;
                    if let Err(e) = raised {
                        error!("Failed to raise alert: {}", e);
                    }
                }
                None => {
                    error!("MQTT bridge closed");
                    break;
                }
            },
            snapshot = pending.recv() => match snapshot {
                Some(alerts) => report_pending(&alerts),
                None => {
                    error!("Alert feed closed");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

async fn raise_device_alert(
    tracker: &PositionTracker,
    service: &AlertService,
    subject: &Subject,
    device_alert: DeviceAlert,
) -> Result<Alert, PtiError> {
    match device_alert.time() {
        Some(time) => info!("Device {} alert sent at {}", device_alert.kind, time),
        None => info!("Device {} alert without device time", device_alert.kind),
    }
    match (device_alert.kind, device_alert.description) {
        (AlertKind::Sos, None) => service.trigger_sos(tracker, subject, None).await,
        (kind, description) => {
            let description = description.unwrap_or_else(|| format!("{} alert from device", kind));
            service.trigger(tracker, subject, kind, description, None).await
        }
    }
}

fn report_pending(alerts: &[Alert]) {
    let mut critical = alerts.iter().filter(|a| a.is_critical());
    match critical.next() {
        Some(latest) => warn!(
            "{} pending alerts, {} critical (latest: {} for {})",
            alerts.len(),
            critical.count() + 1,
            latest.kind,
            latest.subject_name
        ),
        None => info!("{} pending alerts", alerts.len()),
    }
}
