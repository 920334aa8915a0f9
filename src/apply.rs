//! Applies a normalized, arbitration-admitted [`InternalEvent`] to the
//! active [`Session`] (§3, §4.1, §4.5). This is the only place outside
//! `session::state` that mutates `Session` fields directly; it exists
//! because the normalizer's typed [`EventPayload`] needs a single dispatch
//! site, and because several event types (pit, race control) carry
//! side-effects (DNF inference triggers, pit-lane sample collection) the
//! writer needs to act on afterward.
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::events::{EventPayload, EventSource, EventType, InternalEvent};
use crate::session::state::Session;
use crate::session::types::*;

/// Ephemeral, per-writer working state `apply_event` needs that doesn't
/// belong in the persisted `Session` document: a parallel speed buffer for
/// each driver's in-progress pit-lane GPS trace (§4.4 needs `positions` and
/// `speeds` parallel arrays to pick the tight entry/exit window; `Session`'s
/// own `Pit.accumulated_pit_lane_positions` only models the positions half
/// per the spec's data model in §3).
#[derive(Debug, Default)]
pub struct ApplyWorkspace {
    pub pit_lane_speeds: HashMap<u32, Vec<f64>>,
}

/// Notable transitions the writer reacts to after applying an event: DNF
/// inference, geometry rebuilds, and direct-to-client passthroughs that
/// don't need a round trip through `Session` (clock).
#[derive(Debug, Clone)]
pub enum Effect {
    LapCompleted { driver_number: u32 },
    PitStopCompleted { driver_number: u32, positions: Vec<Point>, speeds: Vec<f64> },
    TelemetryUpdated { driver_number: u32, speed: Option<f64> },
    RaceControlMessage { driver_number: Option<u32>, message: String },
    ClockUpdate { remaining_ms: i64, running: bool },
}

fn timestamp(event: &InternalEvent) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(event.timestamp_millis).unwrap_or_else(Utc::now)
}

/// Applies one admitted event to `session`, returning the effects the
/// writer should react to. Assumes the caller has already run this through
/// the [`crate::arbiter::SourceArbiter`] and has an active session — session
/// detection/creation is the writer's job, not this function's (an
/// `EventType::Session` event never reaches here).
pub fn apply_event(session: &mut Session, workspace: &mut ApplyWorkspace, event: &InternalEvent) -> Vec<Effect> {
    let ts = timestamp(event);
    let mut effects = Vec::new();

    match &event.payload {
        EventPayload::Drivers(list) => {
            for driver in list {
                session.drivers.insert(driver.driver_number, driver.info.clone());
            }
        }
        EventPayload::Location(p) | EventPayload::Position(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            let point = Point { x: p.x, y: p.y };
            session.set_position(driver_number, point, ts);
            if session.pits.get(&driver_number).map(|pit| pit.in_pit).unwrap_or(false) {
                let speed = session.car_telemetry.get(&driver_number).and_then(|t| t.speed).unwrap_or(0.0);
                session.pits.get_mut(&driver_number).unwrap().accumulated_pit_lane_positions.push(point);
                workspace.pit_lane_speeds.entry(driver_number).or_default().push(speed);
            }
        }
        EventPayload::Lap(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            session.set_current_lap(driver_number, p.lap_number);
            session.merge_current_lap_partial(driver_number, p.lap_number, |partial| {
                if let Some(sector_1) = p.sector_1 {
                    partial.sector_1 = Some(sector_1);
                }
                if let Some(sector_2) = p.sector_2 {
                    partial.sector_2 = Some(sector_2);
                }
                if let Some(sector_3) = p.sector_3 {
                    partial.sector_3 = Some(sector_3);
                }
                if let Some(segments_1) = &p.segments_1 {
                    partial.segments_1 = segments_1.clone();
                }
                if let Some(segments_2) = &p.segments_2 {
                    partial.segments_2 = segments_2.clone();
                }
                if let Some(segments_3) = &p.segments_3 {
                    partial.segments_3 = segments_3.clone();
                }
                if let Some(i1_speed) = p.i1_speed {
                    partial.i1_speed = Some(i1_speed);
                }
                if let Some(i2_speed) = p.i2_speed {
                    partial.i2_speed = Some(i2_speed);
                }
                if let Some(st_speed) = p.st_speed {
                    partial.st_speed = Some(st_speed);
                }
                partial.is_pit_out_lap = partial.is_pit_out_lap || p.is_pit_out_lap;
                if partial.date_start.is_none() {
                    partial.date_start = p.date_start;
                }
            });
            if let Some(duration) = p.duration {
                let lap = Lap {
                    duration,
                    sector_1: p.sector_1,
                    sector_2: p.sector_2,
                    sector_3: p.sector_3,
                    segments_1: p.segments_1.clone().unwrap_or_default(),
                    segments_2: p.segments_2.clone().unwrap_or_default(),
                    segments_3: p.segments_3.clone().unwrap_or_default(),
                    i1_speed: p.i1_speed,
                    i2_speed: p.i2_speed,
                    st_speed: p.st_speed,
                    is_pit_out_lap: p.is_pit_out_lap,
                    date_start: p.date_start,
                };
                session.upsert_completed_lap(driver_number, p.lap_number, lap);
                effects.push(Effect::LapCompleted { driver_number });
            }
        }
        EventPayload::CarData(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            let entry = session.car_telemetry.entry(driver_number).or_default();
            if p.speed.is_some() {
                entry.speed = p.speed;
            }
            if p.drs.is_some() {
                entry.drs = p.drs;
            }
            if p.gear.is_some() {
                entry.gear = p.gear;
            }
            effects.push(Effect::TelemetryUpdated { driver_number, speed: p.speed });
        }
        EventPayload::Interval(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            let entry = session.intervals.entry(driver_number).or_default();
            if p.gap_to_leader.is_some() {
                entry.gap_to_leader = p.gap_to_leader;
            }
            if p.interval_to_ahead.is_some() {
                entry.interval_to_ahead = p.interval_to_ahead;
            }
        }
        EventPayload::Pit(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            let was_in_pit = session.pits.get(&driver_number).map(|pit| pit.in_pit).unwrap_or(false);
            let entry = session.pits.entry(driver_number).or_default();
            if !was_in_pit && p.in_pit {
                entry.entry_position = session.race_position.get(&driver_number).copied();
                entry.pit_entry_leader_lap = p.leader_lap_at_entry.or_else(|| Some(session.leader_lap() as i64));
                entry.accumulated_pit_lane_positions.clear();
                workspace.pit_lane_speeds.insert(driver_number, Vec::new());
            }
            if was_in_pit && !p.in_pit {
                entry.count += 1;
                if p.pit_duration.is_some() {
                    entry.last_duration = p.pit_duration;
                }
                let positions = std::mem::take(&mut session.pits.get_mut(&driver_number).unwrap().accumulated_pit_lane_positions);
                let speeds = workspace.pit_lane_speeds.remove(&driver_number).unwrap_or_default();
                effects.push(Effect::PitStopCompleted { driver_number, positions, speeds });
            }
            session.pits.get_mut(&driver_number).unwrap().in_pit = p.in_pit;
        }
        EventPayload::Stint(p) => {
            let Some(driver_number) = event.driver_number else { return effects };
            let source = match event.source {
                EventSource::Mqtt => StintSource::Mqtt,
                EventSource::Signalr => StintSource::Signalr,
                EventSource::Replay => StintSource::Replay,
            };
            session.set_stint(
                driver_number,
                Stint {
                    compound: p.compound.clone(),
                    stint_number: p.stint_number,
                    lap_start: p.lap_start,
                    tyre_age_at_start: p.tyre_age_at_start,
                    total_laps: p.total_laps,
                    source,
                },
            );
        }
        EventPayload::RaceControl(p) => {
            session.race_control.push(RaceControlEvent {
                message: p.message.clone(),
                flag: p.flag.clone(),
                scope: p.scope.clone(),
                driver_number: p.driver_number,
                timestamp: ts,
            });
            apply_flag_transition(session, p.flag.as_deref());
            if let Some(driver_number) = p.driver_number {
                crate::aggregator::apply_race_control_retirement(session, driver_number, &p.message);
            }
            effects.push(Effect::RaceControlMessage { driver_number: p.driver_number, message: p.message.clone() });
        }
        EventPayload::Weather(p) => {
            session.record_weather(
                Weather {
                    air_temp: p.air_temp,
                    track_temp: p.track_temp,
                    humidity: p.humidity,
                    rainfall: p.rainfall,
                    wind_speed: p.wind_speed,
                    wind_dir: p.wind_dir,
                    pressure: p.pressure,
                },
                ts,
            );
        }
        EventPayload::Overtake(p) => {
            session.overtakes.push(Overtake {
                overtaking_driver: p.overtaking_driver,
                overtaken_driver: p.overtaken_driver,
                timestamp: ts,
            });
        }
        EventPayload::Clock(p) => {
            effects.push(Effect::ClockUpdate { remaining_ms: p.remaining_ms, running: p.running });
        }
        EventPayload::Lapcount(p) => {
            if let Some(driver_number) = event.driver_number {
                session.set_current_lap(driver_number, p.current_lap);
            } else if p.total_laps > 0 {
                session.total_laps = Some(p.total_laps);
            }
        }
        EventPayload::TeamRadio(p) => {
            session.team_radio.push(TeamRadio { driver_number: p.driver_number, path: p.path.clone(), timestamp: ts });
        }
        EventPayload::SessionData(value) => {
            session.session_data.push(value.clone());
        }
        EventPayload::Session(_) | EventPayload::Unknown(_) => {
            // Session-candidate events are intercepted by the writer before
            // reaching here (§4.3); unknown payloads are forward-compat
            // placeholders with nothing to apply yet (§4.1).
        }
    }

    effects
}

/// Race-control/track-status flags that carry a safety-car or red-flag
/// state transition (§3 `activeSafetyCar`/`activeRedFlag`). Conservative
/// text match against the upstream's free-form flag string.
fn apply_flag_transition(session: &mut Session, flag: Option<&str>) {
    let Some(flag) = flag else { return };
    let upper = flag.to_uppercase();
    if upper.contains("RED") {
        session.active_red_flag = Some(true);
        session.active_safety_car = Some(false);
    } else if upper.contains("SAFETY CAR") || upper.contains("VSC") {
        session.active_safety_car = Some(true);
        session.active_red_flag = Some(false);
    } else if upper.contains("GREEN") || upper.contains("CLEAR") || upper.contains("ALLCLEAR") {
        session.active_safety_car = Some(false);
        session.active_red_flag = Some(false);
    }
}

/// Whether `event_type` can ever require an active session before it can be
/// applied. `Session` itself is handled by the writer directly.
pub fn requires_active_session(event_type: EventType) -> bool {
    event_type != EventType::Session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::*;
    use chrono::TimeZone;

    fn session() -> Session {
        Session::new(1, None, "Spa".into(), SessionType::Race, "Race".into(), Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 0).unwrap())
    }

    fn event(driver: Option<u32>, payload: EventPayload, source: EventSource) -> InternalEvent {
        InternalEvent::new(EventType::Pit, driver, payload, 0, source)
    }

    #[test]
    fn pit_entry_and_exit_round_trips_accumulated_positions() {
        let mut s = session();
        let mut ws = ApplyWorkspace::default();

        let entry = event(Some(44), EventPayload::Pit(PitPayload { in_pit: true, pit_duration: None, leader_lap_at_entry: Some(10) }), EventSource::Mqtt);
        apply_event(&mut s, &mut ws, &entry);
        assert!(s.pits.get(&44).unwrap().in_pit);
        assert_eq!(s.pits.get(&44).unwrap().pit_entry_leader_lap, Some(10));

        let location = InternalEvent::new(
            EventType::Location,
            Some(44),
            EventPayload::Location(LocationPayload { x: 5.0, y: 5.0 }),
            0,
            EventSource::Mqtt,
        );
        apply_event(&mut s, &mut ws, &location);
        assert_eq!(s.pits.get(&44).unwrap().accumulated_pit_lane_positions.len(), 1);

        let exit = event(Some(44), EventPayload::Pit(PitPayload { in_pit: false, pit_duration: Some(22.4), leader_lap_at_entry: None }), EventSource::Mqtt);
        let effects = apply_event(&mut s, &mut ws, &exit);
        assert!(!s.pits.get(&44).unwrap().in_pit);
        assert_eq!(s.pits.get(&44).unwrap().count, 1);
        assert!(matches!(effects.as_slice(), [Effect::PitStopCompleted { positions, .. }] if positions.len() == 1));
    }

    #[test]
    fn lap_event_without_duration_advances_current_lap_only() {
        let mut s = session();
        let mut ws = ApplyWorkspace::default();
        let e = InternalEvent::new(
            EventType::Lap,
            Some(44),
            EventPayload::Lap(LapPayload {
                lap_number: 3,
                duration: None,
                sector_1: Some(30.0),
                sector_2: None,
                sector_3: None,
                segments_1: None,
                segments_2: None,
                segments_3: None,
                i1_speed: None,
                i2_speed: None,
                st_speed: None,
                is_pit_out_lap: false,
                date_start: None,
            }),
            0,
            EventSource::Mqtt,
        );
        let effects = apply_event(&mut s, &mut ws, &e);
        assert_eq!(s.current_lap_of(44), 3);
        assert!(s.completed_laps.is_empty());
        assert!(effects.is_empty());
        let (lap_number, partial) = s.current_lap_partial.get(&44).unwrap();
        assert_eq!(*lap_number, 3);
        assert_eq!(partial.sector_1, Some(30.0));
    }

    #[test]
    fn lap_partial_resets_when_lap_number_advances() {
        let mut s = session();
        let mut ws = ApplyWorkspace::default();
        let progressive = |lap_number: u32, sector_1: Option<f64>| {
            InternalEvent::new(
                EventType::Lap,
                Some(44),
                EventPayload::Lap(LapPayload {
                    lap_number,
                    duration: None,
                    sector_1,
                    sector_2: None,
                    sector_3: None,
                    segments_1: Some(vec![2048, 2048]),
                    segments_2: None,
                    segments_3: None,
                    i1_speed: None,
                    i2_speed: None,
                    st_speed: None,
                    is_pit_out_lap: false,
                    date_start: None,
                }),
                0,
                EventSource::Mqtt,
            )
        };
        apply_event(&mut s, &mut ws, &progressive(3, Some(30.0)));
        apply_event(&mut s, &mut ws, &progressive(4, None));
        let (lap_number, partial) = s.current_lap_partial.get(&44).unwrap();
        assert_eq!(*lap_number, 4);
        assert_eq!(partial.sector_1, None);
        assert_eq!(partial.segments_1, vec![2048, 2048]);
    }

    #[test]
    fn red_flag_message_sets_active_red_flag() {
        let mut s = session();
        let mut ws = ApplyWorkspace::default();
        let e = InternalEvent::new(
            EventType::RaceControl,
            None,
            EventPayload::RaceControl(RaceControlPayload { message: "RED FLAG".into(), flag: Some("RED".into()), scope: None, driver_number: None }),
            0,
            EventSource::Signalr,
        );
        apply_event(&mut s, &mut ws, &e);
        assert_eq!(s.active_red_flag, Some(true));
    }

    #[test]
    fn race_control_retired_message_marks_permanent_dnf() {
        let mut s = session();
        let mut ws = ApplyWorkspace::default();
        let e = InternalEvent::new(
            EventType::RaceControl,
            Some(44),
            EventPayload::RaceControl(RaceControlPayload { message: "CAR 44 RETIRED".into(), flag: None, scope: None, driver_number: Some(44) }),
            0,
            EventSource::Mqtt,
        );
        apply_event(&mut s, &mut ws, &e);
        assert!(s.is_retired(44));
    }
}
