//! Session Controller (§4.3): the `Idle -> Active -> Ending -> Idle` state
//! machine. Lives inside the single writer task (§5) — every transition is
//! just a `Session` swap plus a set of one-shot/periodic jobs to start or
//! stop, so there's never a question of who else might be mutating state
//! concurrently.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use reqwest::Client;
use tokio::sync::watch;

use crate::adapters::EventSink;
use crate::config::{CAPABILITY_REPORT_DELAY, MULTIVIEWER_FETCH_TIMEOUT, SESSION_POLL_INTERVAL};
use crate::events::{EventPayload, EventSource, EventType, InternalEvent, SessionInfoPayload};
use crate::persistence::Storage;
use crate::session::snapshot::SessionSnapshot;
use crate::session::state::Session;
use crate::session::types::{Point, SessionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Active,
    Ending,
}

/// A candidate session event: whatever upstream source (SignalR SessionInfo,
/// MQTT sessions topic, periodic poll) discovered a session in its time
/// window now contains (§4.3).
#[derive(Debug, Clone)]
pub struct SessionCandidate {
    pub session_key: i64,
    pub meeting_key: Option<i64>,
    pub track_name: String,
    pub session_type: SessionType,
    pub session_name: String,
    pub date_end_ts: DateTime<Utc>,
}

/// Emitted on every transition so the caller can start/stop the right set of
/// timers/adapters around the writer task (§4.3, §5): starting all of them
/// inside the controller itself would entangle timer lifecycle with state
/// mutation, which the single-writer model is explicitly trying to avoid.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    EnteredActive { session_key: i64, snapshot: Arc<SessionSnapshot> },
    EnteredEnding { session_key: i64 },
    EnteredIdle,
    CapabilityReportDue { session_key: i64 },
}

pub struct Controller {
    pub state: ControllerState,
    pub session: Option<Session>,
    http: Client,
}

impl Controller {
    pub fn new() -> Self {
        Controller {
            state: ControllerState::Idle,
            session: None,
            http: Client::new(),
        }
    }

    /// §4.3: `Idle -> Active` on a fresh candidate whose time window still
    /// contains `now`; `Active -> Active` is a no-op for a duplicate key, and
    /// synchronously drops through `Idle -> Active` again for a new key. A
    /// candidate whose `date_end_ts` has already passed is ignored outright
    /// — a stale or re-delivered candidate must never reopen a session that
    /// has already ended.
    pub fn on_session_candidate(&mut self, candidate: SessionCandidate, now: DateTime<Utc>) -> Option<ControllerEvent> {
        if candidate.date_end_ts <= now {
            return None;
        }
        if let Some(existing) = &self.session {
            if existing.session_key == candidate.session_key {
                return None;
            }
        }
        let session = Session::new(
            candidate.session_key,
            candidate.meeting_key,
            candidate.track_name,
            candidate.session_type,
            candidate.session_name,
            candidate.date_end_ts,
        );
        let snapshot = Arc::new(SessionSnapshot::from(&session));
        self.session = Some(session);
        self.state = ControllerState::Active;
        Some(ControllerEvent::EnteredActive { session_key: candidate.session_key, snapshot })
    }

    /// §4.3: `Active -> Ending` once `dateEndTs` has passed or upstream
    /// declares the session over.
    pub fn maybe_end(&mut self, now: DateTime<Utc>, upstream_declared_end: bool) -> Option<ControllerEvent> {
        let Some(session) = &self.session else { return None };
        if self.state != ControllerState::Active {
            return None;
        }
        if now >= session.date_end_ts || upstream_declared_end {
            self.state = ControllerState::Ending;
            return Some(ControllerEvent::EnteredEnding { session_key: session.session_key });
        }
        None
    }

    /// Finalizes `Ending -> Idle` once flush/persistence has run (§4.3).
    pub fn finish_ending(&mut self) -> ControllerEvent {
        self.state = ControllerState::Idle;
        self.session = None;
        ControllerEvent::EnteredIdle
    }

    /// Best-effort MultiViewer fetch on entry to `Active` (§4.3): a 5 s
    /// timeout, and failure never blocks the transition — the baseline path
    /// remains whatever the track geometry engine builds from GPS traces.
    pub async fn fetch_multiviewer_path(&self, track_name: &str, multiviewer_base_url: &str) -> Option<Vec<Point>> {
        let url = format!("{multiviewer_base_url}/circuits/{track_name}");
        let fetch = self.http.get(&url).send();
        match tokio::time::timeout(MULTIVIEWER_FETCH_TIMEOUT, fetch).await {
            Ok(Ok(response)) => match response.json::<Vec<Point>>().await {
                Ok(path) if path.len() >= 2 => Some(path),
                Ok(_) => None,
                Err(err) => {
                    log::warn!("multiviewer response for {track_name} was malformed: {err}");
                    None
                }
            },
            Ok(Err(err)) => {
                log::warn!("multiviewer fetch for {track_name} failed: {err}");
                None
            }
            Err(_) => {
                log::warn!("multiviewer fetch for {track_name} timed out");
                None
            }
        }
    }

    /// Loads a prior track map on entry to `Active` (§4.3), populating
    /// `baseline_path`/corners/sector boundaries/pit-lane profile from
    /// storage if a record for `track_name` already exists.
    pub async fn load_existing_trackmap<S: Storage + ?Sized>(&mut self, storage: &S, track_name: &str) {
        let Some(session) = &mut self.session else { return };
        match storage.load_trackmap(track_name).await {
            Ok(Some(doc)) => {
                session.set_baseline_path(doc.path);
                session.multiviewer_path = doc.multiviewer_path;
                session.corners = doc.corners;
                session.sector_boundaries = doc.sector_boundaries;
                session.pit_lane_profile = doc.pit_lane_profile;
                info!("loaded existing track map for {track_name}");
            }
            Ok(None) => {}
            Err(err) => log::warn!("failed to load track map for {track_name}: {err:?}"),
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Controller::new()
    }
}

/// Schedules the one-shot capability report due `CAPABILITY_REPORT_DELAY`
/// after entering `Active` (§4.3). Returns a future the caller should spawn;
/// kept separate from `Controller` so it has no borrow on controller state.
pub async fn capability_report_delay() {
    tokio::time::sleep(CAPABILITY_REPORT_DELAY).await;
}

/// Runs the `Idle`-state periodic session poller (§4.3): every 60 s, asks
/// `discover` whether a live session now exists upstream. `discover` is
/// supplied by the wiring layer since discovery depends on the REST
/// fallback poller's upstream client. A discovered candidate is pushed onto
/// `sink` as an ordinary `EventType::Session` event, so it reaches the
/// writer through the same channel every other adapter uses rather than
/// needing a side door into the controller (§5).
pub async fn run_session_poller<F, Fut>(mut should_stop: watch::Receiver<bool>, discover: F, sink: EventSink)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Option<SessionCandidate>>,
{
    let mut ticker = tokio::time::interval(SESSION_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(candidate) = discover().await {
                    info!("session poller discovered session {}", candidate.session_key);
                    let event = InternalEvent::new(
                        EventType::Session,
                        None,
                        EventPayload::Session(SessionInfoPayload {
                            session_key: candidate.session_key,
                            meeting_key: candidate.meeting_key,
                            track_name: candidate.track_name,
                            session_type: candidate.session_type,
                            session_name: candidate.session_name,
                            date_end_ts: candidate.date_end_ts,
                        }),
                        Utc::now().timestamp_millis(),
                        EventSource::Mqtt,
                    );
                    if sink.send(event).await.is_err() {
                        break;
                    }
                }
            }
            _ = should_stop.changed() => {
                if *should_stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(key: i64) -> SessionCandidate {
        SessionCandidate {
            session_key: key,
            meeting_key: None,
            track_name: "Spa".into(),
            session_type: SessionType::Race,
            session_name: "Race".into(),
            date_end_ts: Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 0).unwrap(),
        }
    }

    fn before_end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, 15, 0, 0).unwrap()
    }

    #[test]
    fn idle_to_active_on_fresh_candidate() {
        let mut controller = Controller::new();
        let event = controller.on_session_candidate(candidate(1), before_end());
        assert!(matches!(event, Some(ControllerEvent::EnteredActive { session_key: 1, .. })));
        assert_eq!(controller.state, ControllerState::Active);
    }

    #[test]
    fn duplicate_session_key_is_a_no_op() {
        let mut controller = Controller::new();
        controller.on_session_candidate(candidate(1), before_end());
        let event = controller.on_session_candidate(candidate(1), before_end());
        assert!(event.is_none());
    }

    #[test]
    fn new_key_transitions_through_idle_to_active_again() {
        let mut controller = Controller::new();
        controller.on_session_candidate(candidate(1), before_end());
        let event = controller.on_session_candidate(candidate(2), before_end());
        assert!(matches!(event, Some(ControllerEvent::EnteredActive { session_key: 2, .. })));
        assert_eq!(controller.session.as_ref().unwrap().session_key, 2);
    }

    #[test]
    fn candidate_whose_date_end_ts_has_already_passed_is_rejected() {
        let mut controller = Controller::new();
        let stale_now = Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 1).unwrap();
        let event = controller.on_session_candidate(candidate(1), stale_now);
        assert!(event.is_none());
        assert_eq!(controller.state, ControllerState::Idle);
        assert!(controller.session.is_none());
    }

    #[test]
    fn candidate_whose_date_end_ts_exactly_equals_now_is_rejected() {
        let mut controller = Controller::new();
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 0).unwrap();
        let event = controller.on_session_candidate(candidate(1), now);
        assert!(event.is_none());
    }

    #[test]
    fn active_ends_once_date_end_ts_has_passed() {
        let mut controller = Controller::new();
        controller.on_session_candidate(candidate(1), before_end());
        let past_end = Utc.with_ymd_and_hms(2026, 7, 27, 17, 0, 0).unwrap();
        let event = controller.maybe_end(past_end, false);
        assert!(matches!(event, Some(ControllerEvent::EnteredEnding { session_key: 1 })));
        assert_eq!(controller.state, ControllerState::Ending);
    }

    #[test]
    fn ending_finishes_back_to_idle_with_no_session() {
        let mut controller = Controller::new();
        controller.on_session_candidate(candidate(1), before_end());
        controller.maybe_end(Utc.with_ymd_and_hms(2026, 7, 27, 17, 0, 0).unwrap(), false);
        let event = controller.finish_ending();
        assert!(matches!(event, ControllerEvent::EnteredIdle));
        assert_eq!(controller.state, ControllerState::Idle);
        assert!(controller.session.is_none());
    }
}
