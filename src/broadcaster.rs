//! Broadcaster interface (§4.6, §6): the external pub/sub transport this
//! core pushes events to. `broadcast` is non-blocking and may drop to slow
//! subscribers; order within a `(room, event)` pair is preserved. The actual
//! HTTP/WebSocket server is out of scope (§1) — this module only defines
//! the boundary and a couple of lightweight implementations for wiring and
//! tests.
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Room-scoped pub/sub boundary. Implementations must preserve emission
/// order within a `(room, event)` pair but may drop messages to a slow
/// subscriber rather than block the writer (§4.6).
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, room: &str, event: &str, payload: serde_json::Value);
}

/// Serializes `payload` and forwards to `Broadcaster::broadcast`, logging
/// (rather than propagating) serialization failures — a malformed outbound
/// payload is a programming error in this core, not a transient failure
/// worth retrying (§7).
pub async fn emit<B: Broadcaster + ?Sized, T: Serialize>(broadcaster: &B, room: &str, event: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => broadcaster.broadcast(room, event, value).await,
        Err(err) => log::error!("failed to serialize {event} payload for room {room}: {err}"),
    }
}

/// An in-process channel-backed broadcaster: every `broadcast` call is
/// pushed onto a bounded `mpsc` channel, and a full channel drops the
/// message rather than waiting — matching the "non-blocking, may drop to
/// slow subscribers" contract (§4.6) without depending on an actual
/// transport. Suitable as the default wiring until an HTTP/WebSocket
/// frontend is attached.
pub struct ChannelBroadcaster {
    sender: mpsc::Sender<BroadcastMessage>,
}

#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub room: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BroadcastMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ChannelBroadcaster { sender }, receiver)
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn broadcast(&self, room: &str, event: &str, payload: serde_json::Value) {
        let message = BroadcastMessage { room: room.to_string(), event: event.to_string(), payload };
        if self.sender.try_send(message).is_err() {
            log::warn!("broadcaster channel full, dropping {event} for room {room}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_serialized_payload() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new(4);
        emit(&broadcaster, "live", "session", &serde_json::json!({"active": true})).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.room, "live");
        assert_eq!(msg.event, "session");
        assert_eq!(msg.payload, serde_json::json!({"active": true}));
    }

    #[tokio::test]
    async fn full_channel_drops_rather_than_blocks() {
        let (broadcaster, _rx) = ChannelBroadcaster::new(1);
        emit(&broadcaster, "live", "positions", &serde_json::json!([1])).await;
        // second send has no reader draining, channel capacity 1: should not hang
        emit(&broadcaster, "live", "positions", &serde_json::json!([2])).await;
    }

    /// Order within a (room, event) pair is preserved by the underlying
    /// mpsc channel's FIFO guarantee.
    #[tokio::test]
    async fn preserves_order_within_room_event() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new(8);
        for i in 0..5 {
            emit(&broadcaster, "live", "positions", &serde_json::json!(i)).await;
        }
        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload, serde_json::json!(i));
        }
    }
}
