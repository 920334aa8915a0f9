//! MQTT ingestion adapter (§6): subscribes to the `v1/*` topic family and
//! normalizes every publish into zero or more [`InternalEvent`]s. Reconnects
//! indefinitely on a flat 5 s period (§5, §7) — MQTT has no attempt cap,
//! unlike the SignalR adapter's bounded retry.
use log::{info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use crate::config::MQTT_RECONNECT_PERIOD;
use crate::events::EventSource;
use crate::normalizer::normalize_mqtt;

use super::rest_fallback::MqttActivity;
use super::EventSink;

const MQTT_TOPICS: &[&str] = &[
    "v1/location",
    "v1/laps",
    "v1/sessions",
    "v1/drivers",
    "v1/car_data",
    "v1/intervals",
    "v1/pit",
    "v1/stints",
    "v1/position",
    "v1/race_control",
    "v1/weather",
    "v1/overtakes",
];

/// Runs the MQTT adapter until `sink` is closed. Never returns `Err` —
/// connection failures are logged and retried, matching the "never throws
/// past the writer boundary" propagation policy (§7). `activity` records
/// each publish's topic so the REST fallback poller knows when a topic has
/// gone quiet.
pub async fn run_mqtt_adapter(
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    sink: EventSink,
    activity: MqttActivity,
) {
    loop {
        let mut options = MqttOptions::new("f1-session-core", host.clone(), port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&username, &password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);
        for topic in MQTT_TOPICS {
            if let Err(err) = client.subscribe(*topic, QoS::AtLeastOnce).await {
                warn!("mqtt subscribe to {topic} failed: {err}");
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&publish.topic, &publish.payload, &sink, &activity).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt connection lost: {err}, reconnecting in {MQTT_RECONNECT_PERIOD:?}");
                    break;
                }
            }
        }

        tokio::time::sleep(MQTT_RECONNECT_PERIOD).await;
        info!("retrying mqtt connection");
    }
}

async fn handle_publish(topic: &str, payload: &[u8], sink: &EventSink, activity: &MqttActivity) {
    let parsed: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!("discarding malformed mqtt payload on {topic}: {err}");
            return;
        }
    };

    let leaf = topic.rsplit('/').next().unwrap_or(topic);
    activity.record(leaf);

    let timestamp_millis = chrono::Utc::now().timestamp_millis();
    for mut event in normalize_mqtt(topic, &parsed, timestamp_millis) {
        event.source = EventSource::Mqtt;
        if sink.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn malformed_payload_is_discarded_without_emitting() {
        let (tx, mut rx) = mpsc::channel(4);
        handle_publish("v1/location", b"not json", &tx, &MqttActivity::new()).await;
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn valid_publish_normalizes_into_an_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let payload = serde_json::json!({"driver_number": 44, "x": 1.0, "y": 2.0}).to_string();
        handle_publish("v1/location", payload.as_bytes(), &tx, &MqttActivity::new()).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, EventSource::Mqtt);
    }

    #[tokio::test]
    async fn publish_records_topic_activity() {
        let (tx, _rx) = mpsc::channel(4);
        let activity = MqttActivity::new();
        let payload = serde_json::json!({"driver_number": 44, "air_temperature": 20.0}).to_string();
        handle_publish("v1/weather", payload.as_bytes(), &tx, &activity).await;
        assert!(!activity.is_quiet("weather"));
    }
}
