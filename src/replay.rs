//! Replay Engine (§4.8): plays back a stored recording as if it were live.
//! A generation counter guards every call to `start` against a superseded
//! one — any in-flight fetch or tick from an older generation checks the
//! counter before acting and quietly drops itself instead of touching state
//! it no longer owns.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{REPLAY_DEFAULT_SPEED, REPLAY_FAST_FORWARD_DRIVER_THRESHOLD, REPLAY_TICK_INTERVAL};
use crate::errors::ReplayError;
use crate::events::{EventSource, EventType, InternalEvent};
use crate::geometry::path::build_centerline;
use crate::normalizer::{normalize_mqtt, SignalRAccumulator};
use crate::persistence::{ReplayDocument, ReplayMessage, Storage};
use crate::session::types::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPhase {
    Fetching,
    Ready,
    Stopped,
    Ended,
}

/// Parameters for a `start` call; `speed` and `session_key` are the only
/// start-time parameters (§4.8).
#[derive(Debug, Clone)]
pub struct ReplayStartParams {
    pub session_key: i64,
    pub speed: f64,
}

impl Default for ReplayStartParams {
    fn default() -> Self {
        ReplayStartParams { session_key: 0, speed: REPLAY_DEFAULT_SPEED }
    }
}

/// Rebuilds the GPS track from the replay's own lap+location subset when
/// `session_key` differs from the stored `latest_session_key` (§4.8 step 2):
/// different sessions of the same circuit can use different coordinate
/// systems, so the baseline path isn't portable across them.
fn rebuild_track_from_replay(messages: &[ReplayMessage]) -> Option<Vec<Point>> {
    let mut trace = Vec::new();
    for message in messages {
        if message.topic.rsplit('/').next() == Some("location") {
            if let (Some(x), Some(y)) = (message.data.get("x").and_then(|v| v.as_f64()), message.data.get("y").and_then(|v| v.as_f64())) {
                trace.push(Point { x, y });
            }
        }
    }
    if trace.len() < 8 {
        return None;
    }
    build_centerline(&[trace], 200, 5.0, 3)
}

/// Counts distinct driver numbers seen on `location`/`position` topics up to
/// (and including) `messages[..=idx]`, used to find the fast-forward point
/// (§4.8 step 4: "≥ 5 drivers have appeared on track").
fn drivers_on_track(messages: &[ReplayMessage], up_to: usize) -> usize {
    let mut seen = std::collections::HashSet::new();
    for message in &messages[..=up_to.min(messages.len().saturating_sub(1))] {
        let leaf = message.topic.rsplit('/').next();
        if matches!(leaf, Some("location") | Some("position")) {
            if let Some(driver) = message.data.get("driver_number").and_then(|v| v.as_u64()) {
                seen.insert(driver);
            }
        }
    }
    seen.len()
}

pub struct ReplayEngine<S: Storage> {
    storage: Arc<S>,
    generation: Arc<AtomicU64>,
}

impl<S: Storage + 'static> ReplayEngine<S> {
    pub fn new(storage: Arc<S>) -> Self {
        ReplayEngine { storage, generation: Arc::new(AtomicU64::new(0)) }
    }

    /// Starts (or restarts) playback. Increments the generation counter
    /// first, so any task still running from a previous `start` call
    /// observes a mismatch and stops itself (§4.8).
    pub fn start(
        &self,
        params: ReplayStartParams,
        events_out: mpsc::Sender<InternalEvent>,
        phase_out: mpsc::Sender<ReplayPhase>,
        clock_out: mpsc::Sender<crate::batcher::ClockPayload>,
    ) {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let storage = Arc::clone(&self.storage);
        let generation = Arc::clone(&self.generation);

        tokio::spawn(async move {
            let _ = phase_out.send(ReplayPhase::Fetching).await;
            let stale = || generation.load(Ordering::SeqCst) != my_generation;

            let doc = match storage.load_replay(params.session_key).await {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    info!("{}", ReplayError::ResourceMissing(params.session_key));
                    let _ = phase_out.send(ReplayPhase::Stopped).await;
                    return;
                }
                Err(err) => {
                    info!("replay load failed for session {}: {err:?}", params.session_key);
                    let _ = phase_out.send(ReplayPhase::Stopped).await;
                    return;
                }
            };
            if stale() {
                return;
            }

            let track = rebuild_track_from_replay(&doc.messages);
            if stale() {
                return;
            }
            if track.is_none() {
                log::warn!("{}", ReplayError::TrackBuild(format!("session {}", params.session_key)));
            }

            let start_index = fast_forward_index(&doc.messages);
            let _ = phase_out.send(ReplayPhase::Ready).await;

            run_playback(doc, start_index, params.speed, generation, my_generation, events_out, phase_out, clock_out).await;
        });
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Finds the index to fast-forward to: the first message after which at
/// least `REPLAY_FAST_FORWARD_DRIVER_THRESHOLD` drivers have appeared
/// (§4.8 step 4). Falls back to the start of the queue if the threshold is
/// never reached.
fn fast_forward_index(messages: &[ReplayMessage]) -> usize {
    for idx in 0..messages.len() {
        if drivers_on_track(messages, idx) >= REPLAY_FAST_FORWARD_DRIVER_THRESHOLD {
            return idx;
        }
    }
    0
}

async fn run_playback(
    doc: ReplayDocument,
    start_index: usize,
    speed: f64,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    events_out: mpsc::Sender<InternalEvent>,
    phase_out: mpsc::Sender<ReplayPhase>,
    clock_out: mpsc::Sender<crate::batcher::ClockPayload>,
) {
    let messages = &doc.messages[start_index..];
    if messages.is_empty() {
        let _ = phase_out.send(ReplayPhase::Ended).await;
        return;
    }

    let replay_base = messages[0].timestamp_millis;
    let start_real = Instant::now();
    let mut cursor = 0usize;
    let mut ticker = tokio::time::interval(REPLAY_TICK_INTERVAL);
    let mut signalr = SignalRAccumulator::default();

    loop {
        ticker.tick().await;
        if generation.load(Ordering::SeqCst) != my_generation {
            return;
        }

        let session_time = replay_base + (start_real.elapsed().as_secs_f64() * 1000.0 * speed) as i64;

        while cursor < messages.len() && messages[cursor].timestamp_millis <= session_time {
            let message = &messages[cursor];
            if message.topic.eq_ignore_ascii_case("clock") {
                if let Some(remaining_ms) = message.data.get("remaining_ms").and_then(|v| v.as_i64()) {
                    let running = message.data.get("running").and_then(|v| v.as_bool()).unwrap_or(true);
                    let _ = clock_out.send(crate::batcher::ClockPayload { remaining_ms, running }).await;
                }
            } else if message.topic.starts_with("signalr/") {
                let accumulated = signalr.apply(&message.topic, message.data.clone());
                for event in crate::normalizer::normalize_signalr(&message.topic, &accumulated, message.timestamp_millis) {
                    if events_out.send(event).await.is_err() {
                        return;
                    }
                }
            } else {
                for mut event in normalize_mqtt(&message.topic, &message.data, message.timestamp_millis) {
                    event.source = EventSource::Replay;
                    if events_out.send(event).await.is_err() {
                        return;
                    }
                }
            }
            cursor += 1;
        }

        if cursor >= messages.len() {
            let _ = phase_out.send(ReplayPhase::Ended).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStorage;
    use chrono::Utc;

    fn message(topic: &str, data: serde_json::Value, t: i64) -> ReplayMessage {
        ReplayMessage { topic: topic.to_string(), data, timestamp_millis: t }
    }

    #[test]
    fn fast_forward_finds_fifth_distinct_driver() {
        let messages: Vec<ReplayMessage> = (1..=6)
            .map(|d| message("f1/location", serde_json::json!({"driver_number": d, "x": 0.0, "y": 0.0}), d as i64 * 100))
            .collect();
        let idx = fast_forward_index(&messages);
        assert_eq!(idx, 4); // zero-indexed: 5th distinct driver arrives at index 4
    }

    #[test]
    fn fast_forward_falls_back_to_zero_when_threshold_never_reached() {
        let messages: Vec<ReplayMessage> = (1..=2)
            .map(|d| message("f1/location", serde_json::json!({"driver_number": d, "x": 0.0, "y": 0.0}), d as i64 * 100))
            .collect();
        assert_eq!(fast_forward_index(&messages), 0);
    }

    #[tokio::test]
    async fn start_on_missing_replay_emits_stopped() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = ReplayEngine::new(storage);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (phase_tx, mut phase_rx) = mpsc::channel(8);
        let (clock_tx, _clock_rx) = mpsc::channel(8);
        engine.start(ReplayStartParams { session_key: 999, speed: 4.0 }, events_tx, phase_tx, clock_tx);

        assert_eq!(phase_rx.recv().await, Some(ReplayPhase::Fetching));
        assert_eq!(phase_rx.recv().await, Some(ReplayPhase::Stopped));
    }

    #[tokio::test]
    async fn restarting_bumps_the_generation_counter() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .save_replay(ReplayDocument {
                session_key: 1,
                messages: vec![message("f1/location", serde_json::json!({"driver_number": 1, "x": 0.0, "y": 0.0}), 0)],
                track_name: "Monza".into(),
                session_name: "Race".into(),
                session_end_ts: Utc::now(),
                driver_count: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let engine = ReplayEngine::new(storage);
        let gen_before = engine.generation();
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (phase_tx, _phase_rx) = mpsc::channel(8);
        let (clock_tx, _clock_rx) = mpsc::channel(8);
        engine.start(ReplayStartParams { session_key: 1, speed: 4.0 }, events_tx, phase_tx, clock_tx);
        assert!(engine.generation() > gen_before);
    }
}
