//! REST fallback poller (§6): polls the OpenF1 REST API for each topic on a
//! topic-specific cadence, but only once that topic has gone quiet on MQTT
//! for at least `REST_FALLBACK_GRACE_PERIOD` (§4.2, §6). MQTT is preferred
//! while it's alive; this exists only to plug gaps in it.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{RestPollCadences, REST_FALLBACK_GRACE_PERIOD};
use crate::events::EventSource;
use crate::normalizer::normalize_mqtt;

use super::EventSink;

const TOPICS: &[&str] = &["car_data", "intervals", "position", "pit", "stints", "race_control", "weather", "overtakes"];

/// Shared record of the last time each topic received an MQTT publish,
/// written by the MQTT adapter and read here to gate fallback polling.
#[derive(Debug, Default, Clone)]
pub struct MqttActivity(Arc<Mutex<HashMap<&'static str, Instant>>>);

impl MqttActivity {
    pub fn new() -> Self {
        MqttActivity(Arc::new(Mutex::new(HashMap::new())))
    }

    /// Records an MQTT publish on `topic`, silently ignoring topics the
    /// fallback poller doesn't track (e.g. `location`, `laps`).
    pub fn record(&self, topic: &str) {
        if let Some(&known) = TOPICS.iter().find(|t| **t == topic) {
            self.0.lock().unwrap().insert(known, Instant::now());
        }
    }

    pub(crate) fn is_quiet(&self, topic: &str) -> bool {
        match self.0.lock().unwrap().get(topic) {
            Some(&last) => last.elapsed() >= REST_FALLBACK_GRACE_PERIOD,
            None => true,
        }
    }
}

fn cadence_for(cadences: &RestPollCadences, topic: &str) -> Duration {
    match topic {
        "car_data" => cadences.car_data,
        "intervals" => cadences.intervals,
        "position" => cadences.position,
        "pit" => cadences.pit,
        "stints" => cadences.stints,
        "race_control" => cadences.race_control,
        "weather" => cadences.weather,
        "overtakes" => cadences.overtakes,
        _ => Duration::from_secs(10),
    }
}

/// Runs one fallback poller per §6 topic until `sink` closes. Each topic
/// polls independently so a slow/erroring endpoint doesn't stall the rest.
pub async fn run_rest_fallback_poller(
    base_url: String,
    cadences: RestPollCadences,
    session_key: watch::Receiver<Option<i64>>,
    activity: MqttActivity,
    sink: EventSink,
) {
    let client = Client::new();
    let mut handles = Vec::with_capacity(TOPICS.len());
    for topic in TOPICS {
        handles.push(tokio::spawn(run_topic_loop(
            client.clone(),
            base_url.clone(),
            topic,
            cadence_for(&cadences, topic),
            session_key.clone(),
            activity.clone(),
            sink.clone(),
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn run_topic_loop(
    client: Client,
    base_url: String,
    topic: &'static str,
    cadence: Duration,
    session_key: watch::Receiver<Option<i64>>,
    activity: MqttActivity,
    sink: EventSink,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !activity.is_quiet(topic) {
            continue;
        }
        let Some(key) = *session_key.borrow() else { continue };
        poll_topic(&client, &base_url, topic, key, &sink).await;
        if sink.is_closed() {
            return;
        }
    }
}

async fn poll_topic(client: &Client, base_url: &str, topic: &str, session_key: i64, sink: &EventSink) {
    let url = format!("{base_url}/{topic}?session_key={session_key}");
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("rest fallback GET {topic} failed: {err}");
            return;
        }
    };
    if !response.status().is_success() {
        warn!("rest fallback {topic} returned {}", response.status());
        return;
    }
    let items: Vec<Value> = match response.json().await {
        Ok(items) => items,
        Err(err) => {
            warn!("rest fallback {topic} decode failed: {err}");
            return;
        }
    };

    let timestamp_millis = chrono::Utc::now().timestamp_millis();
    for item in items {
        for mut event in normalize_mqtt(topic, &item, timestamp_millis) {
            event.source = EventSource::Mqtt;
            if sink.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_topic_with_no_activity_is_immediately_pollable() {
        let activity = MqttActivity::new();
        assert!(activity.is_quiet("weather"));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_mqtt_activity_silences_the_topic() {
        let activity = MqttActivity::new();
        activity.record("weather");
        assert!(!activity.is_quiet("weather"));
        tokio::time::advance(REST_FALLBACK_GRACE_PERIOD + Duration::from_millis(1)).await;
        assert!(activity.is_quiet("weather"));
    }

    #[test]
    fn untracked_topic_record_is_a_no_op() {
        let activity = MqttActivity::new();
        activity.record("location");
        assert!(activity.0.lock().unwrap().is_empty());
    }
}
