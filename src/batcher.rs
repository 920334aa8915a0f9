//! Output Batcher (§4.6): three independent timer loops, each reading the
//! latest [`SessionSnapshot`] off a `watch` channel and pushing to the
//! [`Broadcaster`] on its own cadence. None of these ever touch `Session`
//! directly — they are downstream of the single writer task (§5).
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::broadcaster::{emit, Broadcaster};
use crate::config::{CLOCK_FALLBACK_INTERVAL, CLOCK_STALE_THRESHOLD, DRIVER_STATE_BATCH_INTERVAL, POSITION_BATCH_INTERVAL};
use crate::geometry::path::{point_at_progress, project, Projection};
use crate::session::snapshot::SessionSnapshot;
use crate::session::state::TrackFlag;

/// Projects each driver's current GPS point onto the high-fidelity display
/// path (`multiviewer_path`) when one is available, using the driver's prior
/// progress as the projection hint (§4.6); falls back to raw GPS otherwise.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PositionEntry {
    pub driver_number: u32,
    pub x: f64,
    pub y: f64,
    pub progress: Option<f64>,
}

fn project_positions(snapshot: &SessionSnapshot, hints: &mut std::collections::HashMap<u32, f64>) -> Vec<PositionEntry> {
    let path = match (&snapshot.multiviewer_path, &snapshot.baseline_path) {
        (Some(path), _) if !path.is_empty() => path,
        (_, base) if !base.is_empty() => base,
        _ => {
            return snapshot
                .current_position
                .iter()
                .map(|(driver, point)| PositionEntry { driver_number: *driver, x: point.x, y: point.y, progress: None })
                .collect();
        }
    };
    let arc_table = crate::geometry::path::arc_length_table(path);

    snapshot
        .current_position
        .iter()
        .map(|(driver, point)| {
            let hint = hints.get(driver).copied();
            match project(path, &arc_table, *point, hint) {
                Some(Projection { progress, .. }) => {
                    hints.insert(*driver, progress);
                    let projected = point_at_progress(path, &arc_table, progress).unwrap_or(*point);
                    PositionEntry { driver_number: *driver, x: projected.x, y: projected.y, progress: Some(progress) }
                }
                None => PositionEntry { driver_number: *driver, x: point.x, y: point.y, progress: hint },
            }
        })
        .collect()
}

/// Runs the 100 ms positions batcher until the watch channel's sender is
/// dropped (§4.6). Emits `positions[]` to room `live`.
pub async fn run_positions_batcher<B: Broadcaster>(
    mut snapshots: watch::Receiver<Arc<SessionSnapshot>>,
    broadcaster: Arc<B>,
) {
    let mut ticker = tokio::time::interval(POSITION_BATCH_INTERVAL);
    let mut hints = std::collections::HashMap::new();
    loop {
        ticker.tick().await;
        // `has_changed` (rather than `changed().await`) only detects sender
        // drop — it never blocks, so the batch still emits on cadence even
        // when no new GPS has landed since the last tick (§8 property 5).
        if snapshots.has_changed().is_err() {
            break;
        }
        let snapshot = snapshots.borrow().clone();
        let positions = project_positions(&snapshot, &mut hints);
        emit(broadcaster.as_ref(), "live", "positions", &positions).await;
    }
}

/// Runs the 1000 ms driver-states batcher (§4.6). Emits `driver_states[]` to
/// room `live`. The caller supplies a `compute` closure so this module never
/// needs to depend on `aggregator` internals directly (kept pure: given a
/// snapshot, produce the payload).
pub async fn run_driver_state_batcher<B, F, T>(
    mut snapshots: watch::Receiver<Arc<SessionSnapshot>>,
    broadcaster: Arc<B>,
    compute: F,
) where
    B: Broadcaster,
    F: Fn(&SessionSnapshot) -> T + Send + 'static,
    T: serde::Serialize + Send + 'static,
{
    let mut ticker = tokio::time::interval(DRIVER_STATE_BATCH_INTERVAL);
    loop {
        ticker.tick().await;
        if snapshots.has_changed().is_err() {
            break;
        }
        let snapshot = snapshots.borrow().clone();
        let payload = compute(&snapshot);
        emit(broadcaster.as_ref(), "live", "driver_states", &payload).await;
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ClockPayload {
    pub remaining_ms: i64,
    pub running: bool,
}

/// Runs the 5 s clock-fallback checker (§4.6): if the upstream clock has
/// been silent for more than 15 s, synthesizes `{remainingMs, running}` from
/// `dateEndTs` and the latest track flag.
pub async fn run_clock_fallback<B: Broadcaster>(
    mut snapshots: watch::Receiver<Arc<SessionSnapshot>>,
    broadcaster: Arc<B>,
    last_upstream_clock_at: Arc<std::sync::Mutex<chrono::DateTime<Utc>>>,
) {
    let mut ticker = tokio::time::interval(CLOCK_FALLBACK_INTERVAL);
    loop {
        ticker.tick().await;
        let snapshot = snapshots.borrow().clone();
        let last_seen = *last_upstream_clock_at.lock().expect("clock timestamp mutex poisoned");
        let silent_for = Utc::now().signed_duration_since(last_seen);
        if silent_for > chrono::Duration::from_std(CLOCK_STALE_THRESHOLD).expect("stale threshold fits chrono::Duration") {
            let remaining_ms = (snapshot.date_end_ts - Utc::now()).num_milliseconds().max(0);
            let running = snapshot.active_track_flag != Some(TrackFlag::Red);
            emit(broadcaster.as_ref(), "live", "clock", &ClockPayload { remaining_ms, running }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{BroadcastMessage, ChannelBroadcaster};
    use crate::session::types::{Point, SessionType};
    use chrono::TimeZone;

    fn base_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            session_key: 1,
            meeting_key: None,
            track_name: "Spa".into(),
            session_type: SessionType::Race,
            session_name: "Race".into(),
            date_end_ts: Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 0).unwrap(),
            active_track_flag: None,
            drivers: vec![],
            current_position: vec![(44, Point { x: 1.0, y: 1.0 })],
            current_lap: vec![],
            current_lap_partial: vec![],
            race_position: vec![],
            weather: None,
            race_control: vec![],
            overtakes: vec![],
            completed_laps: vec![],
            stints: vec![],
            pits: vec![],
            car_telemetry: vec![],
            baseline_path: vec![],
            baseline_arc: vec![],
            multiviewer_path: None,
            corners: vec![],
            sector_boundaries: None,
            pit_lane_profile: None,
            dnfs: vec![],
            total_laps: None,
            lifecycle_token: 0,
        }
    }

    #[test]
    fn project_positions_falls_back_to_raw_gps_without_a_path() {
        let snapshot = base_snapshot();
        let mut hints = std::collections::HashMap::new();
        let positions = project_positions(&snapshot, &mut hints);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].x, 1.0);
        assert!(positions[0].progress.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn positions_batcher_emits_on_cadence() {
        let (tx, rx) = watch::channel(Arc::new(base_snapshot()));
        let (broadcaster, mut out) = ChannelBroadcaster::new(8);
        let broadcaster = Arc::new(broadcaster);
        let handle = tokio::spawn(run_positions_batcher(rx, broadcaster));

        tokio::time::advance(POSITION_BATCH_INTERVAL).await;
        tx.send_modify(|s| *s = Arc::new(base_snapshot()));
        let msg: BroadcastMessage = out.recv().await.unwrap();
        assert_eq!(msg.event, "positions");
        handle.abort();
    }

    /// §8 property 5: consecutive batches keep emitting on cadence with
    /// unchanged payloads when no new GPS update has landed.
    #[tokio::test(start_paused = true)]
    async fn positions_batcher_emits_repeatedly_without_any_change() {
        let (_tx, rx) = watch::channel(Arc::new(base_snapshot()));
        let (broadcaster, mut out) = ChannelBroadcaster::new(8);
        let broadcaster = Arc::new(broadcaster);
        let handle = tokio::spawn(run_positions_batcher(rx, broadcaster));

        tokio::time::advance(POSITION_BATCH_INTERVAL).await;
        tokio::task::yield_now().await;
        out.recv().await.unwrap();

        tokio::time::advance(POSITION_BATCH_INTERVAL).await;
        tokio::task::yield_now().await;
        out.recv().await.unwrap();

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn clock_fallback_stays_silent_while_upstream_is_fresh() {
        let (_tx, rx) = watch::channel(Arc::new(base_snapshot()));
        let (broadcaster, mut out) = ChannelBroadcaster::new(8);
        let broadcaster = Arc::new(broadcaster);
        let last_seen = Arc::new(std::sync::Mutex::new(Utc::now()));
        let handle = tokio::spawn(run_clock_fallback(rx, broadcaster, last_seen));

        tokio::time::advance(CLOCK_FALLBACK_INTERVAL).await;
        tokio::task::yield_now().await;
        assert!(out.try_recv().is_err());
        handle.abort();
    }
}
