//! MQTT client for receiving zone-change events

use crate::domain::types::ZoneChangeEvent;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use anyhow::{bail, Context};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Parse a zone-change payload. A payload without a car id is rejected.
pub fn parse_zone_change(payload: &[u8]) -> anyhow::Result<ZoneChangeEvent> {
    let event: ZoneChangeEvent =
        serde_json::from_slice(payload).context("invalid zone change payload")?;
    if event.vehicle_id.trim().is_empty() {
        bail!("zone change payload has no carId");
    }
    Ok(event)
}

/// Start the MQTT client and forward parsed zone changes to the channel
///
/// Events are sent with `send().await`: when the consumer falls behind, the
/// eventloop stops polling and the broker holds the backlog (QoS 1).
/// Malformed payloads are logged, counted and dropped.
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<ZoneChangeEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions = MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtLeastOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_client_subscribed");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = match parse_zone_change(&publish.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                metrics.record_event_malformed();
                                warn!(topic = %publish.topic, error = %format!("{:#}", e), "zone_change_malformed");
                                continue;
                            }
                        };
                        debug!(
                            vehicle = %event.vehicle_id,
                            previous_zone = ?event.previous_zone,
                            next_zone = ?event.next_zone,
                            "zone_change_received"
                        );
                        if event_tx.send(event).await.is_err() {
                            warn!("event_channel_closed");
                            return Ok(());
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
