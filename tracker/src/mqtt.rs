use crate::errors::{Error, Result};
use crate::model::{Ack, LocationUpdate};
use crate::tracker::FleetTracker;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    tracker: Arc<FleetTracker>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(topic.as_str(), QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", topic);

    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    match process_message(&publish.topic, &publish.payload, &tracker).await {
                        Ok(ack) => debug!(device_id = %ack.device_id, version = ack.version, "Location applied"),
                        // Stale updates are acknowledged at the transport level like accepted ones.
                        Err(Error::StaleUpdate { .. }) => {}
                        Err(e) => warn!(topic = %publish.topic, "Failed to process message: {}", e),
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Last topic level, when the topic carries one (`locations/<device_id>`).
fn topic_device_id(topic: &str) -> Option<&str> {
    let (_, last) = topic.rsplit_once('/')?;
    (!last.is_empty()).then_some(last)
}

/// Decodes one payload and submits it to the tracker.
async fn process_message(topic: &str, payload: &[u8], tracker: &FleetTracker) -> Result<Ack> {
    let update = serde_json::from_slice::<LocationUpdate>(payload)
        .map_err(|e| Error::InvalidUpdate(format!("JSON parse error: {}", e)))?;

    if let Some(device_id) = topic_device_id(topic) {
        if device_id != update.device_id {
            return Err(Error::InvalidUpdate(format!(
                "Topic device {} does not match payload device {}",
                device_id, update.device_id
            )));
        }
    }

    tracker.submit_update(update).await
}
