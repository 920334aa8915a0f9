//! Ingestion adapters (§6): MQTT, SignalR, and the REST fallback poller.
//! Each one is a self-contained retry loop that normalizes upstream
//! messages into [`InternalEvent`]s and pushes them onto a shared channel
//! toward the writer task — none of them ever touches `Session` directly
//! (§5, §7: "the core never throws past the writer boundary").
pub mod mqtt_adapter;
pub mod rest_fallback;
pub mod signalr_adapter;

pub use mqtt_adapter::run_mqtt_adapter;
pub use rest_fallback::{run_rest_fallback_poller, MqttActivity};
pub use signalr_adapter::run_signalr_adapter;

use tokio::sync::mpsc;

use crate::events::InternalEvent;

/// Shared outbound edge every adapter normalizes onto.
pub type EventSink = mpsc::Sender<InternalEvent>;
