//! The single writer task (§5): the only place `Session` is mutated. Owns
//! the `Controller` state machine, the `SourceArbiter`, and every downstream
//! side effect (geometry rebuilds, DNF inference, persistence, snapshot
//! publication). Everything else in this core — adapters, batchers, the
//! replay engine — only ever talks to this task through channels or reads
//! its published `watch` snapshot.
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::apply::{apply_event, ApplyWorkspace, Effect};
use crate::arbiter::SourceArbiter;
use crate::batcher::ClockPayload;
use crate::broadcaster::{emit, Broadcaster};
use crate::config::{ENDING_CHECK_INTERVAL, PROGRESSIVE_SAVE_INTERVAL};
use crate::controller::{capability_report_delay, Controller, ControllerEvent, SessionCandidate};
use crate::events::{EventPayload, EventType, InternalEvent};
use crate::persistence::{ReplayDocument, ReplayMessage, SessionDocument, Storage, TrackmapUpsert};
use crate::session::geometry_sync;
use crate::session::snapshot::SessionSnapshot;
use crate::session::state::Session;
use crate::session::types::PitLaneSample;
use crate::{aggregator, config};

/// Everything the writer needs handed in at startup; mirrors `CoreConfig`'s
/// explicit-builder style (§6 ambient-stack conventions) rather than
/// threading individual strings through every function.
pub struct WriterContext<S: Storage, B: Broadcaster> {
    pub storage: Arc<S>,
    pub broadcaster: Arc<B>,
    pub multiviewer_base_url: String,
    pub snapshot_tx: watch::Sender<Arc<SessionSnapshot>>,
    pub session_key_tx: watch::Sender<Option<i64>>,
    pub last_upstream_clock_at: Arc<Mutex<chrono::DateTime<Utc>>>,
}

/// Reconstructs a replay-compatible message from a normalized event, in the
/// same field shape `normalize_mqtt` expects, so a stored replay can be
/// re-normalized on playback (§4.7, §4.8) without every adapter also having
/// to thread a second raw-capture channel through the writer boundary.
fn event_to_replay_message(event: &InternalEvent) -> Option<ReplayMessage> {
    let (topic, data): (&str, Value) = match &event.payload {
        EventPayload::Location(p) => ("location", serde_json::json!({"driver_number": event.driver_number, "x": p.x, "y": p.y})),
        EventPayload::Position(p) => ("position", serde_json::json!({"driver_number": event.driver_number, "x": p.x, "y": p.y})),
        EventPayload::Lap(p) => (
            "laps",
            serde_json::json!({
                "driver_number": event.driver_number,
                "lap_number": p.lap_number,
                "lap_duration": p.duration,
                "duration_sector_1": p.sector_1,
                "duration_sector_2": p.sector_2,
                "duration_sector_3": p.sector_3,
                "segments_sector_1": p.segments_1,
                "segments_sector_2": p.segments_2,
                "segments_sector_3": p.segments_3,
                "i1_speed": p.i1_speed,
                "i2_speed": p.i2_speed,
                "st_speed": p.st_speed,
                "is_pit_out_lap": p.is_pit_out_lap,
                "date_start": p.date_start,
            }),
        ),
        EventPayload::CarData(p) => (
            "car_data",
            serde_json::json!({"driver_number": event.driver_number, "speed": p.speed, "drs": p.drs.map(|b| if b { 1 } else { 0 }), "n_gear": p.gear}),
        ),
        EventPayload::Pit(p) => (
            "pit",
            serde_json::json!({"driver_number": event.driver_number, "pit_duration": p.pit_duration, "lap_number": p.leader_lap_at_entry}),
        ),
        EventPayload::Stint(p) => (
            "stints",
            serde_json::json!({
                "driver_number": event.driver_number,
                "compound": p.compound,
                "stint_number": p.stint_number,
                "lap_start": p.lap_start,
                "tyre_age_at_start": p.tyre_age_at_start,
                "total_laps": p.total_laps,
            }),
        ),
        EventPayload::RaceControl(p) => (
            "race_control",
            serde_json::json!({"driver_number": p.driver_number, "message": p.message, "flag": p.flag, "scope": p.scope}),
        ),
        EventPayload::Weather(p) => (
            "weather",
            serde_json::json!({
                "air_temperature": p.air_temp,
                "track_temperature": p.track_temp,
                "humidity": p.humidity,
                "rainfall": if p.rainfall { 1.0 } else { 0.0 },
                "wind_speed": p.wind_speed,
                "wind_direction": p.wind_dir,
                "pressure": p.pressure,
            }),
        ),
        EventPayload::Overtake(p) => (
            "overtakes",
            serde_json::json!({"overtaking_driver_number": p.overtaking_driver, "overtaken_driver_number": p.overtaken_driver}),
        ),
        EventPayload::Clock(p) => ("clock", serde_json::json!({"remaining_ms": p.remaining_ms, "running": p.running})),
        _ => return None,
    };
    Some(ReplayMessage { topic: topic.to_string(), data, timestamp_millis: event.timestamp_millis })
}

fn session_candidate_from_payload(event: &InternalEvent) -> Option<SessionCandidate> {
    let EventPayload::Session(p) = &event.payload else { return None };
    Some(SessionCandidate {
        session_key: p.session_key,
        meeting_key: p.meeting_key,
        track_name: p.track_name.clone(),
        session_type: p.session_type,
        session_name: p.session_name.clone(),
        date_end_ts: p.date_end_ts,
    })
}

/// Builds the trackmap upsert from the session's current geometry state
/// (§4.4, §4.7). Called after every successful geometry rebuild and once
/// more on session end, so storage always reflects the latest baseline.
fn trackmap_upsert(session: &Session) -> TrackmapUpsert {
    TrackmapUpsert {
        track_name: session.track_name.clone(),
        path: session.baseline_path.clone(),
        multiviewer_path: session.multiviewer_path.clone(),
        corners: Some(session.corners.clone()),
        sector_boundaries: session.sector_boundaries,
        pit_lane_profile: session.pit_lane_profile,
        meeting_key: session.meeting_key,
        latest_session_key: session.session_key,
        total_laps_processed: session.total_laps_processed,
    }
}

struct ActiveState {
    replay_buffer: Vec<ReplayMessage>,
    pit_lane_samples: Vec<PitLaneSample>,
}

impl ActiveState {
    fn new() -> Self {
        ActiveState { replay_buffer: Vec::new(), pit_lane_samples: Vec::new() }
    }
}

/// Runs the writer until `events` closes. This is meant to be spawned once
/// as its own task; everything it touches (`Controller`, `SourceArbiter`,
/// the replay buffer) lives on its stack, which is what makes "single
/// writer" a property of the code rather than a convention callers have to
/// honor (§5).
pub async fn run_writer<S: Storage + 'static, B: Broadcaster + 'static>(
    mut events: mpsc::Receiver<InternalEvent>,
    ctx: WriterContext<S, B>,
) {
    let mut controller = Controller::new();
    let mut arbiter = SourceArbiter::new();
    let mut workspace = ApplyWorkspace::default();
    let mut active = ActiveState::new();

    let mut progressive_save_ticker = tokio::time::interval(PROGRESSIVE_SAVE_INTERVAL);
    let mut ending_check_ticker = tokio::time::interval(ENDING_CHECK_INTERVAL);
    let (capability_tx, mut capability_rx) = mpsc::channel::<i64>(1);

    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(event) => {
                        handle_event(&mut controller, &mut arbiter, &mut workspace, &mut active, &ctx, &capability_tx, event).await;
                    }
                    None => {
                        info!("writer event channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = progressive_save_ticker.tick() => {
                if let Some(session) = &controller.session {
                    progressive_save(session, &ctx).await;
                }
            }
            _ = ending_check_ticker.tick() => {
                if let Some(event) = controller.maybe_end(Utc::now(), false) {
                    handle_controller_event(&mut controller, &mut active, &ctx, &capability_tx, event).await;
                }
            }
            Some(session_key) = capability_rx.recv() => {
                if controller.session.as_ref().map(|s| s.session_key) == Some(session_key) {
                    emit_capability_report(&controller, &ctx).await;
                }
            }
        }
    }
}

async fn handle_event<S: Storage + 'static, B: Broadcaster + 'static>(
    controller: &mut Controller,
    arbiter: &mut SourceArbiter,
    workspace: &mut ApplyWorkspace,
    active: &mut ActiveState,
    ctx: &WriterContext<S, B>,
    capability_tx: &mpsc::Sender<i64>,
    event: InternalEvent,
) {
    if event.event_type == EventType::Session {
        if let Some(candidate) = session_candidate_from_payload(&event) {
            if let Some(controller_event) = controller.on_session_candidate(candidate, Utc::now()) {
                handle_controller_event(controller, active, ctx, capability_tx, controller_event).await;
            }
        }
        return;
    }

    let Some(session) = &mut controller.session else { return };
    if !arbiter.admit(&event) {
        return;
    }

    if let Some(message) = event_to_replay_message(&event) {
        active.replay_buffer.push(message);
        if active.replay_buffer.len() % 64 == 0 {
            active.replay_buffer = crate::persistence::trim_replay_window(
                std::mem::take(&mut active.replay_buffer),
                config::REPLAY_MAX_BYTES,
            );
        }
    }

    let effects = apply_event(session, workspace, &event);
    let mut geometry_changed = false;

    for effect in effects {
        match effect {
            Effect::LapCompleted { driver_number } => {
                aggregator::on_lap_completed(session, driver_number);
                geometry_changed |= geometry_sync::rebuild_track(session);
                geometry_changed |= geometry_sync::rebuild_sector_boundaries(session);
            }
            Effect::PitStopCompleted { driver_number: _, positions, speeds } => {
                geometry_changed |= geometry_sync::record_pit_stop(session, &mut active.pit_lane_samples, &positions, &speeds);
            }
            Effect::TelemetryUpdated { driver_number, speed } => {
                aggregator::on_telemetry_update(session, driver_number, speed);
            }
            Effect::RaceControlMessage { .. } => {}
            Effect::ClockUpdate { remaining_ms, running } => {
                *ctx.last_upstream_clock_at.lock().expect("clock timestamp mutex poisoned") = Utc::now();
                emit(ctx.broadcaster.as_ref(), "live", "clock", &ClockPayload { remaining_ms, running }).await;
            }
        }
    }

    if geometry_changed {
        if let Err(err) = ctx.storage.upsert_trackmap(trackmap_upsert(session)).await {
            warn!("trackmap upsert failed for {}: {err:?}", session.track_name);
        }
    }

    publish_snapshot(session, ctx);
}

async fn handle_controller_event<S: Storage + 'static, B: Broadcaster + 'static>(
    controller: &mut Controller,
    active: &mut ActiveState,
    ctx: &WriterContext<S, B>,
    capability_tx: &mpsc::Sender<i64>,
    event: ControllerEvent,
) {
    match event {
        ControllerEvent::EnteredActive { session_key, snapshot } => {
            info!("session {session_key} entered active");
            *active = ActiveState::new();
            let _ = ctx.snapshot_tx.send(snapshot);
            let _ = ctx.session_key_tx.send(Some(session_key));

            let track_name = controller.session.as_ref().map(|s| s.track_name.clone());
            if let Some(track_name) = &track_name {
                controller.load_existing_trackmap(ctx.storage.as_ref(), track_name).await;
            }

            let needs_multiviewer = controller.session.as_ref().map(|s| s.multiviewer_path.is_none()).unwrap_or(false);
            if needs_multiviewer {
                if let Some(track_name) = &track_name {
                    if let Some(path) = controller.fetch_multiviewer_path(track_name, &ctx.multiviewer_base_url).await {
                        if let Some(session) = &mut controller.session {
                            session.set_multiviewer_path(path);
                        }
                    }
                }
            }
            if let Some(session) = &controller.session {
                publish_snapshot(session, ctx);
            }

            let tx = capability_tx.clone();
            tokio::spawn(async move {
                capability_report_delay().await;
                let _ = tx.send(session_key).await;
            });
        }
        ControllerEvent::EnteredEnding { session_key } => {
            info!("session {session_key} entered ending");
            if let Some(session) = &controller.session {
                progressive_save(session, ctx).await;
                if let Err(err) = ctx.storage.upsert_trackmap(trackmap_upsert(session)).await {
                    warn!("final trackmap upsert failed for {}: {err:?}", session.track_name);
                }
                let doc = ReplayDocument {
                    session_key: session.session_key,
                    messages: std::mem::take(&mut active.replay_buffer),
                    track_name: session.track_name.clone(),
                    session_name: session.session_name.clone(),
                    session_end_ts: session.date_end_ts,
                    driver_count: session.drivers.len() as u32,
                    created_at: Utc::now(),
                };
                if let Err(err) = ctx.storage.save_replay(doc).await {
                    warn!("failed to save replay for session {session_key}: {err:?}");
                }
            }
            // `finish_ending` always yields `EnteredIdle`; applied inline
            // rather than recursing (an async fn cannot call itself without
            // boxing the resulting future).
            controller.finish_ending();
            info!("writer idle, awaiting next session");
            let _ = ctx.session_key_tx.send(None);
        }
        ControllerEvent::EnteredIdle => {
            info!("writer idle, awaiting next session");
            let _ = ctx.session_key_tx.send(None);
        }
        ControllerEvent::CapabilityReportDue { session_key } => {
            if controller.session.as_ref().map(|s| s.session_key) == Some(session_key) {
                emit_capability_report(controller, ctx).await;
            }
        }
    }
}

fn publish_snapshot<S: Storage, B: Broadcaster>(session: &Session, ctx: &WriterContext<S, B>) {
    let _ = ctx.snapshot_tx.send(Arc::new(SessionSnapshot::from(session)));
}

async fn progressive_save<S: Storage, B: Broadcaster>(session: &Session, ctx: &WriterContext<S, B>) {
    let snapshot = SessionSnapshot::from(session);
    let Ok(value) = serde_json::to_value(&snapshot) else {
        warn!("failed to serialize session {} for progressive save", session.session_key);
        return;
    };
    let doc = SessionDocument {
        session_key: session.session_key,
        snapshot: value,
        expires_at: Utc::now() + chrono::Duration::from_std(config::SESSION_TTL).expect("ttl fits chrono::Duration"),
    };
    if let Err(err) = ctx.storage.progressive_save(doc).await {
        warn!("progressive save failed for session {}: {err:?}", session.session_key);
    }
}

/// Reports which geometry/feature data this core currently has available for
/// the active session (§4.3's one-shot capability report, 17 s after entry).
async fn emit_capability_report<S: Storage, B: Broadcaster>(controller: &Controller, ctx: &WriterContext<S, B>) {
    let Some(session) = &controller.session else { return };
    let payload = serde_json::json!({
        "session_key": session.session_key,
        "has_baseline_path": !session.baseline_path.is_empty(),
        "has_multiviewer_path": session.multiviewer_path.is_some(),
        "has_sector_boundaries": session.sector_boundaries.is_some(),
        "has_pit_lane_profile": session.pit_lane_profile.is_some(),
    });
    emit(ctx.broadcaster.as_ref(), "live", "capability_report", &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::ChannelBroadcaster;
    use crate::events::{EventSource, LocationPayload, SessionInfoPayload};
    use crate::persistence::InMemoryStorage;
    use crate::session::types::SessionType;
    use chrono::TimeZone;

    fn test_ctx() -> (WriterContext<InMemoryStorage, ChannelBroadcaster>, watch::Receiver<Arc<SessionSnapshot>>, watch::Receiver<Option<i64>>, tokio::sync::mpsc::Receiver<crate::broadcaster::BroadcastMessage>) {
        let (broadcaster, out) = ChannelBroadcaster::new(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SessionSnapshot::from(&Session::new(
            0,
            None,
            String::new(),
            SessionType::Race,
            String::new(),
            Utc::now(),
        ))));
        let (session_key_tx, session_key_rx) = watch::channel(None);
        let ctx = WriterContext {
            storage: Arc::new(InMemoryStorage::new()),
            broadcaster: Arc::new(broadcaster),
            multiviewer_base_url: "https://example.invalid".to_string(),
            snapshot_tx,
            session_key_tx,
            last_upstream_clock_at: Arc::new(Mutex::new(Utc::now())),
        };
        (ctx, snapshot_rx, session_key_rx, out)
    }

    fn session_event() -> InternalEvent {
        InternalEvent::new(
            EventType::Session,
            None,
            EventPayload::Session(SessionInfoPayload {
                session_key: 42,
                meeting_key: None,
                track_name: "Spa".into(),
                session_type: SessionType::Race,
                session_name: "Race".into(),
                date_end_ts: Utc.with_ymd_and_hms(2026, 7, 27, 18, 0, 0).unwrap(),
            }),
            0,
            EventSource::Signalr,
        )
    }

    #[tokio::test]
    async fn session_event_transitions_writer_to_active_and_publishes_snapshot() {
        let (tx, rx) = mpsc::channel(8);
        let (ctx, mut snapshot_rx, mut session_key_rx, _out) = test_ctx();
        tx.send(session_event()).await.unwrap();
        drop(tx);

        run_writer(rx, ctx).await;

        snapshot_rx.changed().await.ok();
        assert_eq!(snapshot_rx.borrow().session_key, 42);
        assert_eq!(*session_key_rx.borrow_and_update(), Some(42));
    }

    #[tokio::test]
    async fn location_event_before_any_session_is_dropped_without_panic() {
        let (tx, rx) = mpsc::channel(8);
        let (ctx, _snapshot_rx, _session_key_rx, _out) = test_ctx();
        tx.send(InternalEvent::new(
            EventType::Location,
            Some(44),
            EventPayload::Location(LocationPayload { x: 1.0, y: 2.0 }),
            0,
            EventSource::Mqtt,
        ))
        .await
        .unwrap();
        drop(tx);

        run_writer(rx, ctx).await;
    }
}
