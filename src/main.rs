//! Live service entry point: wires the ingestion adapters, the single
//! writer task, and the output batchers together and runs until the
//! process receives a shutdown signal. The actual HTTP/WebSocket surface
//! subscribers connect to is out of scope here (§1) — `ChannelBroadcaster`'s
//! receiver stands in for wherever that transport would forward messages.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use f1_session_core::adapters::{run_mqtt_adapter, run_rest_fallback_poller, run_signalr_adapter, MqttActivity};
use f1_session_core::aggregator::compute_driver_states;
use f1_session_core::batcher::{run_clock_fallback, run_driver_state_batcher, run_positions_batcher};
use f1_session_core::broadcaster::ChannelBroadcaster;
use f1_session_core::config::CoreConfig;
use f1_session_core::controller::{run_session_poller, SessionCandidate};
use f1_session_core::events::EventPayload;
use f1_session_core::persistence::InMemoryStorage;
use f1_session_core::session::types::SessionType;
use f1_session_core::session::{Session, SessionSnapshot};
use f1_session_core::writer::{run_writer, WriterContext};
use log::{info, warn};
use tokio::sync::{mpsc, watch};

/// Polls the OpenF1 sessions endpoint for the session currently marked
/// `session_key=latest`, used by the idle-state poller (§4.3) as a backstop
/// to event-stream-driven discovery.
async fn discover_latest_session(client: reqwest::Client, rest_base_url: String) -> Option<SessionCandidate> {
    let url = format!("{rest_base_url}/sessions?session_key=latest");
    let items: Vec<serde_json::Value> = match client.get(&url).send().await {
        Ok(response) => response.json().await.ok()?,
        Err(err) => {
            warn!("session discovery poll failed: {err}");
            return None;
        }
    };
    let item = items.first()?;
    let timestamp_millis = Utc::now().timestamp_millis();
    let event = f1_session_core::normalizer::normalize_mqtt("sessions", item, timestamp_millis).into_iter().next()?;
    let EventPayload::Session(payload) = event.payload else { return None };
    Some(SessionCandidate {
        session_key: payload.session_key,
        meeting_key: payload.meeting_key,
        track_name: payload.track_name,
        session_type: payload.session_type,
        session_name: payload.session_name,
        date_end_ts: payload.date_end_ts,
    })
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = CoreConfig::from_env();
    info!("starting f1-session-core with {config:?}");

    let storage = Arc::new(InMemoryStorage::new());
    let (broadcaster, mut broadcast_out) = ChannelBroadcaster::new(1024);
    let broadcaster = Arc::new(broadcaster);
    tokio::spawn(async move {
        while let Some(message) = broadcast_out.recv().await {
            info!("broadcast {}/{}: {}", message.room, message.event, message.payload);
        }
    });

    let (sink, events_rx) = mpsc::channel(1024);
    let mqtt_activity = MqttActivity::new();

    tokio::spawn(run_mqtt_adapter(
        config.host.clone(),
        config.port,
        config.upstream_username.clone(),
        config.upstream_password.clone(),
        sink.clone(),
        mqtt_activity.clone(),
    ));
    tokio::spawn(run_signalr_adapter(config.signalr_negotiate_url.clone(), config.signalr_hub_ws_url.clone(), sink.clone()));

    let (session_key_tx, session_key_rx) = watch::channel(None);
    tokio::spawn(run_rest_fallback_poller(
        config.rest_base_url.clone(),
        config.rest_poll,
        session_key_rx.clone(),
        mqtt_activity.clone(),
        sink.clone(),
    ));

    let (_poller_stop_tx, poller_stop_rx) = watch::channel(false);
    let discover_client = reqwest::Client::new();
    let rest_base_url = config.rest_base_url.clone();
    let discover_sink = sink.clone();
    tokio::spawn(run_session_poller(
        poller_stop_rx,
        move || discover_latest_session(discover_client.clone(), rest_base_url.clone()),
        discover_sink,
    ));

    let placeholder = Session::new(0, None, String::new(), SessionType::Practice, String::new(), Utc::now());
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SessionSnapshot::from(&placeholder)));

    let writer_ctx = WriterContext {
        storage,
        broadcaster: broadcaster.clone(),
        multiviewer_base_url: config.multiviewer_base_url.clone(),
        snapshot_tx,
        session_key_tx,
        last_upstream_clock_at: Arc::new(Mutex::new(Utc::now())),
    };
    let writer_clock = writer_ctx.last_upstream_clock_at.clone();
    tokio::spawn(run_writer(events_rx, writer_ctx));

    tokio::spawn(run_positions_batcher(snapshot_rx.clone(), broadcaster.clone()));
    tokio::spawn(run_driver_state_batcher(snapshot_rx.clone(), broadcaster.clone(), |snapshot| {
        compute_driver_states(snapshot, false, &HashSet::new())
    }));
    tokio::spawn(run_clock_fallback(snapshot_rx, broadcaster, writer_clock));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!("failed to listen for shutdown signal: {err}"),
    }
}
