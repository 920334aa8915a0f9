//! SignalR ingestion adapter (§6): HTTPS negotiate handshake followed by a
//! WebSocket subscription to the `Streaming` hub's topic set. Retries on a
//! flat 60 s period up to 3 attempts (§5, §7) before giving up and leaving
//! the fallback clock/REST poller to carry the session.
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{SIGNALR_MAX_RETRIES, SIGNALR_RETRY_PERIOD};
use crate::errors::AdapterError;
use crate::events::InternalEvent;
use crate::normalizer::{normalize_signalr, SignalRAccumulator};

use super::EventSink;

const HUB_TOPICS: &[&str] = &[
    "Heartbeat",
    "ExtrapolatedClock",
    "TimingData",
    "TimingAppData",
    "TimingStats",
    "DriverList",
    "SessionInfo",
    "SessionStatus",
    "TrackStatus",
    "RaceControlMessages",
    "WeatherData",
    "LapCount",
    "TeamRadio",
    "SessionData",
];

#[derive(Debug, Deserialize)]
struct NegotiateResponse {
    #[serde(rename = "ConnectionToken")]
    connection_token: String,
}

/// A batched SignalR frame: `M` carries update arrays, `R` carries the
/// initial-state map for a freshly (re)subscribed hub (§6).
#[derive(Debug, Deserialize)]
struct SignalRFrame {
    #[serde(rename = "M", default)]
    m: Vec<SignalRUpdate>,
    #[serde(rename = "R", default)]
    r: Option<std::collections::HashMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct SignalRUpdate {
    #[serde(rename = "A")]
    args: Vec<Value>,
}

/// Runs the SignalR adapter to completion: up to `SIGNALR_MAX_RETRIES`
/// negotiate+connect attempts, each separated by `SIGNALR_RETRY_PERIOD`.
/// Gives up silently after the cap — connection status is observable via
/// the capability report (§4.3), not a returned error.
pub async fn run_signalr_adapter(negotiate_base_url: String, hub_ws_url: String, sink: EventSink) {
    let http = Client::new();
    let mut accumulator = SignalRAccumulator::new();

    for attempt in 1..=SIGNALR_MAX_RETRIES {
        match negotiate(&http, &negotiate_base_url).await {
            Ok(token) => {
                info!("signalr negotiated connection token on attempt {attempt}");
                if let Err(err) = stream_hub(&hub_ws_url, &token, &mut accumulator, &sink).await {
                    warn!("signalr stream ended: {err}");
                }
            }
            Err(err) => warn!("signalr negotiate failed on attempt {attempt}: {err}"),
        }
        if attempt < SIGNALR_MAX_RETRIES {
            tokio::time::sleep(SIGNALR_RETRY_PERIOD).await;
        }
    }
    warn!("{}", AdapterError::Unavailable);
}

async fn negotiate(http: &Client, base_url: &str) -> Result<String, AdapterError> {
    let url = format!("{base_url}/negotiate");
    let response = http.get(&url).send().await.map_err(|e| AdapterError::Negotiate(e.to_string()))?;
    if !response.status().is_success() {
        return Err(AdapterError::Negotiate(format!("negotiate returned {}", response.status())));
    }
    let parsed: NegotiateResponse = response.json().await.map_err(|e| AdapterError::Negotiate(e.to_string()))?;
    Ok(parsed.connection_token)
}

async fn stream_hub(hub_ws_url: &str, token: &str, accumulator: &mut SignalRAccumulator, sink: &EventSink) -> Result<(), AdapterError> {
    let url = format!("{hub_ws_url}?connectionToken={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| AdapterError::Connect(e.to_string()))?;

    for topic in HUB_TOPICS {
        let subscribe = serde_json::json!({ "H": "Streaming", "M": "Subscribe", "A": [[*topic]] }).to_string();
        ws.send(Message::Text(subscribe)).await.map_err(|e| AdapterError::Connect(e.to_string()))?;
    }

    while let Some(message) = ws.next().await {
        let message = message.map_err(|e| AdapterError::Connect(e.to_string()))?;
        let Message::Text(text) = message else { continue };
        handle_frame(&text, accumulator, sink).await;
    }
    Ok(())
}

async fn handle_frame(text: &str, accumulator: &mut SignalRAccumulator, sink: &EventSink) {
    let frame: SignalRFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("{}", AdapterError::MalformedPayload(err.to_string()));
            return;
        }
    };
    let timestamp_millis = chrono::Utc::now().timestamp_millis();

    if let Some(initial) = frame.r {
        for (topic, value) in initial {
            let accumulated = accumulator.apply(&topic, value);
            emit(normalize_signalr(&topic, &accumulated, timestamp_millis), sink).await;
        }
    }

    for update in frame.m {
        let Some(topic) = update.args.first().and_then(Value::as_str) else { continue };
        let Some(payload) = update.args.get(1).cloned() else { continue };
        let accumulated = accumulator.apply(topic, payload);
        emit(normalize_signalr(topic, &accumulated, timestamp_millis), sink).await;
    }
}

async fn emit(events: Vec<InternalEvent>, sink: &EventSink) {
    for event in events {
        if sink.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_frame_is_discarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut accumulator = SignalRAccumulator::new();
        handle_frame("not json", &mut accumulator, &tx).await;
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn initial_state_frame_normalizes_weather() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut accumulator = SignalRAccumulator::new();
        let frame = serde_json::json!({
            "R": { "WeatherData": { "AirTemp": "20.0", "TrackTemp": "30.0", "Humidity": "50.0", "Rainfall": "0", "WindSpeed": "1.0", "WindDirection": "180.0", "Pressure": "1000.0" } }
        })
        .to_string();
        handle_frame(&frame, &mut accumulator, &tx).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, crate::events::EventType::Weather);
    }

    #[tokio::test]
    async fn batched_update_frame_routes_by_topic() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut accumulator = SignalRAccumulator::new();
        let frame = serde_json::json!({
            "M": [{ "A": ["LapCount", {"CurrentLap": 3, "TotalLaps": 58}] }]
        })
        .to_string();
        handle_frame(&frame, &mut accumulator, &tx).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, crate::events::EventType::Lapcount);
    }
}
