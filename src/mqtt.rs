//! MQTT device bridge
//!
//! The wearable publishes JSON fixes to `<prefix>/location` and alert events
//! (SOS button, fall detector) to `<prefix>/alert`. Fixes are exposed through
//! [`MqttLocationSource`], alert events through [`MqttBridge::recv_alert`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, Transport,
};

use crate::{
    config::{DesiredAccuracy, MqttConfig, MqttTransport, TrackingConfig},
    errors::PtiError,
    models::{AlertKind, RawFix},
    platform::{LocationSource, PermissionStatus},
};

/// How long to wait for the broker to answer the subscription
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Alert event raised on the device itself
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceAlert {
    #[serde(default = "default_alert_kind")]
    pub kind: AlertKind,
    /// Device time of the event, milliseconds from Unix epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DeviceAlert {
    /// Device time of the event, if it sent a valid one
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.timestamp.and_then(DateTime::from_timestamp_millis)
    }
}

fn default_alert_kind() -> AlertKind {
    AlertKind::Sos
}

/// Messages published by the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Fix(RawFix),
    Alert(DeviceAlert),
}

/// MQTT client for the device bridge
pub struct MqttBridgeBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    topic_prefix: String,
}

pub struct MqttBridge {
    _client: AsyncClient,
    source: MqttLocationSource,
    alerts: mpsc::Receiver<DeviceAlert>,
    _handle: tokio::task::JoinHandle<Result<(), PtiError>>,
}

/// Location source fed by device fixes arriving over MQTT
///
/// Permission is granted once the broker accepts the subscriptions.
#[derive(Clone)]
pub struct MqttLocationSource {
    fixes: broadcast::Sender<RawFix>,
    permission: watch::Receiver<Option<PermissionStatus>>,
}

impl MqttBridgeBuilder {
    /// Create a new MQTT client
    pub fn new(config: &MqttConfig) -> Result<Self, PtiError> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);

        match config.transport {
            MqttTransport::Tcp => {}
            MqttTransport::Tls => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
            MqttTransport::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
        }
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self {
            client,
            event_loop,
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
        })
    }

    /// Start the event loop
    ///
    /// Subscription happens in the event loop on every (re)connect.
    pub fn connect(self) -> MqttBridge {
        let (fixes, _) = broadcast::channel(64);
        let (alerts_tx, alerts_rx) = mpsc::channel(16);
        let (permission_tx, permission_rx) = watch::channel(None);

        let _handle = tokio::spawn(Self::process_events(
            self.event_loop,
            self.client.clone(),
            self.topic_prefix,
            fixes.clone(),
            alerts_tx,
            permission_tx,
        ));

        MqttBridge {
            _client: self.client,
            source: MqttLocationSource {
                fixes,
                permission: permission_rx,
            },
            alerts: alerts_rx,
            _handle,
        }
    }

    fn topics(prefix: &str) -> Vec<SubscribeFilter> {
        ["location", "alert"]
            .iter()
            .map(|suffix| SubscribeFilter::new(format!("{}/{}", prefix, suffix), QoS::AtLeastOnce))
            .collect()
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on its own but subscriptions must be renewed,
    /// so they are issued on every ConnAck. The SubAck decides permission.
    async fn process_events(
        mut event_loop: EventLoop,
        client: AsyncClient,
        prefix: String,
        fixes: broadcast::Sender<RawFix>,
        alerts: mpsc::Sender<DeviceAlert>,
        permission: watch::Sender<Option<PermissionStatus>>,
    ) -> Result<(), PtiError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing under {}", prefix);
                    if let Err(e) = client.subscribe_many(Self::topics(&prefix)).await {
                        error!("Failed to subscribe: {}", e);
                        permission.send_replace(Some(PermissionStatus::Denied));
                        break Err(e.into());
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                    let status = if granted {
                        PermissionStatus::Granted
                    } else {
                        warn!("Broker refused device subscriptions");
                        PermissionStatus::Denied
                    };
                    permission.send_replace(Some(status));
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Self::parse_message(&prefix, &publish.topic, &publish.payload) {
                        Ok(DeviceMessage::Fix(fix)) => {
                            // Nobody tracking is not an error
                            let _ = fixes.send(fix);
                        }
                        Ok(DeviceMessage::Alert(alert)) => {
                            if let Err(e) = alerts.send(alert).await {
                                error!("Failed to forward device alert: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                _ => continue,
            }
        }
    }

    /// Parse incoming message based on topic
    fn parse_message(prefix: &str, topic: &str, payload: &[u8]) -> Result<DeviceMessage, PtiError> {
        let suffix = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| PtiError::InvalidTopic(topic.to_string()))?;

        match suffix {
            "location" => Ok(DeviceMessage::Fix(serde_json::from_slice(payload)?)),
            "alert" => Ok(DeviceMessage::Alert(serde_json::from_slice(payload)?)),
            other => Err(PtiError::UnknownMessageType(other.to_string())),
        }
    }
}

impl MqttBridge {
    pub fn location_source(&self) -> MqttLocationSource {
        self.source.clone()
    }

    /// Receive next device alert event
    pub async fn recv_alert(&mut self) -> Option<DeviceAlert> {
        self.alerts.recv().await
    }
}

impl MqttLocationSource {
    /// Source driven directly by a fix channel, without a broker
    pub fn detached(permission: PermissionStatus) -> (Self, broadcast::Sender<RawFix>) {
        let (fixes, _) = broadcast::channel(64);
        let (_, permission_rx) = watch::channel(Some(permission));
        (
            Self {
                fixes: fixes.clone(),
                permission: permission_rx,
            },
            fixes,
        )
    }
}

#[async_trait]
impl LocationSource for MqttLocationSource {
    async fn request_permission(&self) -> Result<PermissionStatus, PtiError> {
        let mut permission = self.permission.clone();
        let current = *permission.borrow();
        if let Some(status) = current {
            return Ok(status);
        }

        let result = match timeout(PERMISSION_TIMEOUT, permission.wait_for(|p| p.is_some())).await {
            Ok(Ok(status)) => Ok((*status).unwrap_or(PermissionStatus::Denied)),
            Ok(Err(_)) => Err(PtiError::PermissionDenied(
                "device bridge stopped".to_string(),
            )),
            Err(_) => Err(PtiError::PermissionDenied(
                "broker did not acknowledge the subscription".to_string(),
            )),
        };
        result
    }

    async fn current_fix(&self, accuracy: DesiredAccuracy) -> Result<RawFix, PtiError> {
        let mut fixes = self.fixes.subscribe();
        loop {
            match fixes.recv().await {
                Ok(fix) if accuracy.accepts(fix.coords.accuracy) => return Ok(fix),
                Ok(fix) => debug!("Skipping fix with accuracy {:?}", fix.coords.accuracy),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("Skipped {} fixes", n),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(PtiError::AcquisitionFailed(
                        "device bridge stopped".to_string(),
                    ))
                }
            }
        }
    }

    async fn watch(&self, options: &TrackingConfig) -> Result<mpsc::Receiver<RawFix>, PtiError> {
        let mut fixes = self.fixes.subscribe();
        let accuracy = options.desired_accuracy;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    received = fixes.recv() => match received {
                        Ok(fix) => {
                            if !accuracy.accepts(fix.coords.accuracy) {
                                continue;
                            }
                            if tx.send(fix).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Location watcher lagged, {} fixes dropped", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Location watcher finished");
        });

        Ok(rx)
    }
}
