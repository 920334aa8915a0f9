//! SignalR topic normalization (§4.1, §6).
//!
//! SignalR hands down incremental objects per topic (`Heartbeat`,
//! `ExtrapolatedClock`, `TimingData`, `TimingAppData`, `TimingStats`,
//! `DriverList`, `SessionInfo`, `SessionStatus`, `TrackStatus`,
//! `RaceControlMessages`, `WeatherData`, `LapCount`, `TeamRadio`,
//! `SessionData`) that must be deep-merged into a per-topic accumulated
//! shape before per-entity fan-out (§4.1). [`SignalRAccumulator`] owns that
//! merge step — the only stateful part of the Normalizer; everything below
//! it is pure translation from an already-accumulated [`serde_json::Value`].
use std::collections::HashMap;

use serde_json::Value;

use crate::events::*;
use crate::session::types::{DriverInfo, IntervalValue, LapDifference, SessionType};

use super::merge::deep_merge;

#[derive(Debug, Default)]
pub struct SignalRAccumulator {
    state: HashMap<String, Value>,
}

impl SignalRAccumulator {
    pub fn new() -> Self {
        SignalRAccumulator { state: HashMap::new() }
    }

    /// Applies an incremental (`M`) or initial (`R`) update for `topic` and
    /// returns the fully accumulated shape for that topic.
    pub fn apply(&mut self, topic: &str, update: Value) -> Value {
        let entry = self.state.entry(topic.to_string()).or_insert(Value::Object(Default::default()));
        deep_merge(entry, update);
        entry.clone()
    }
}

fn driver_lines(accumulated: &Value) -> impl Iterator<Item = (u32, &Value)> {
    accumulated
        .get("Lines")
        .or(Some(accumulated))
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| k.parse::<u32>().ok().map(|num| (num, v)))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Pure translation of one already-merged SignalR topic into zero or more
/// [`InternalEvent`]s (§4.1). Unknown/unmodeled topics are ignored.
pub fn normalize_signalr(topic: &str, accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    match topic {
        "TimingData" => normalize_timing_data(accumulated, timestamp_millis),
        "TimingAppData" => normalize_timing_app_data(accumulated, timestamp_millis),
        "TimingStats" => normalize_timing_stats(accumulated, timestamp_millis),
        "DriverList" => normalize_driver_list(accumulated, timestamp_millis),
        "WeatherData" => normalize_weather(accumulated, timestamp_millis),
        "TrackStatus" => normalize_track_status(accumulated, timestamp_millis),
        "RaceControlMessages" => normalize_race_control(accumulated, timestamp_millis),
        "SessionInfo" => normalize_session_info(accumulated, timestamp_millis),
        "ExtrapolatedClock" => normalize_clock(accumulated, timestamp_millis),
        "LapCount" => normalize_lap_count(accumulated, timestamp_millis),
        "TeamRadio" => normalize_team_radio(accumulated, timestamp_millis),
        "SessionData" => vec![InternalEvent::new(
            EventType::SessionData,
            None,
            EventPayload::SessionData(accumulated.clone()),
            timestamp_millis,
            EventSource::Signalr,
        )],
        _ => Vec::new(),
    }
}

fn normalize_timing_data(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let mut events = Vec::new();
    for (driver_number, line) in driver_lines(accumulated) {
        if let Some(lap) = line.get("NumberOfLaps").and_then(Value::as_u64) {
            events.push(InternalEvent::new(
                EventType::Lapcount,
                Some(driver_number),
                EventPayload::Lapcount(LapcountPayload { current_lap: lap as u32, total_laps: 0 }),
                timestamp_millis,
                EventSource::Signalr,
            ));
        }
        let gap = line.get("GapToLeader").and_then(parse_interval);
        let interval = line.get("IntervalToPositionAhead").and_then(|v| v.get("Value")).and_then(parse_interval);
        if gap.is_some() || interval.is_some() {
            events.push(InternalEvent::new(
                EventType::Interval,
                Some(driver_number),
                EventPayload::Interval(IntervalPayload { gap_to_leader: gap, interval_to_ahead: interval }),
                timestamp_millis,
                EventSource::Signalr,
            ));
        }
        if let Some(in_pit) = line.get("InPit").and_then(Value::as_bool) {
            events.push(InternalEvent::new(
                EventType::Pit,
                Some(driver_number),
                EventPayload::Pit(PitPayload {
                    in_pit,
                    pit_duration: line.get("PitOut").and_then(as_f64),
                    leader_lap_at_entry: None,
                }),
                timestamp_millis,
                EventSource::Signalr,
            ));
        }
    }
    events
}

fn parse_interval(v: &Value) -> Option<IntervalValue> {
    let text = v.as_str()?;
    if let Some(rest) = text.strip_prefix('+').and_then(|r| r.strip_suffix(" LAP")) {
        return rest.parse::<i32>().ok().map(|n| IntervalValue::Lap(LapDifference(n)));
    }
    text.trim_start_matches('+').parse::<f64>().ok().map(IntervalValue::Seconds)
}

fn normalize_timing_app_data(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let mut events = Vec::new();
    for (driver_number, line) in driver_lines(accumulated) {
        let Some(stints) = line.get("Stints").and_then(Value::as_object) else { continue };
        let Some((_, stint)) = stints.iter().max_by_key(|(k, _)| k.parse::<u32>().unwrap_or(0)) else { continue };
        let Some(compound) = stint.get("Compound").and_then(Value::as_str) else { continue };
        events.push(InternalEvent::new(
            EventType::Stint,
            Some(driver_number),
            EventPayload::Stint(StintPayload {
                compound: compound.to_string(),
                stint_number: stints.len() as u32,
                lap_start: stint.get("StartLaps").and_then(Value::as_u64).unwrap_or(0) as u32,
                tyre_age_at_start: stint.get("TyreAgeAtStart").and_then(Value::as_u64).unwrap_or(0) as u32,
                total_laps: stint.get("TotalLaps").and_then(Value::as_u64).map(|v| v as u32),
            }),
            timestamp_millis,
            EventSource::Signalr,
        ));
    }
    events
}

fn normalize_timing_stats(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let mut events = Vec::new();
    for (driver_number, line) in driver_lines(accumulated) {
        let st_speed = line
            .get("BestSpeeds")
            .and_then(|b| b.get("ST"))
            .and_then(|s| s.get("Value"))
            .and_then(as_f64);
        if let Some(speed) = st_speed {
            events.push(InternalEvent::new(
                EventType::CarData,
                Some(driver_number),
                EventPayload::CarData(CarDataPayload { speed: Some(speed), drs: None, gear: None }),
                timestamp_millis,
                EventSource::Signalr,
            ));
        }
    }
    events
}

fn normalize_driver_list(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let mut drivers = Vec::new();
    for (driver_number, line) in driver_lines(accumulated) {
        let acronym = line.get("Tla").and_then(Value::as_str).unwrap_or_default().to_string();
        let full_name = line.get("FullName").and_then(Value::as_str).unwrap_or_default().to_string();
        let team = line.get("TeamName").and_then(Value::as_str).unwrap_or_default().to_string();
        let team_colour = line.get("TeamColour").and_then(Value::as_str).unwrap_or_default().to_string();
        let headshot_url = line.get("HeadshotUrl").and_then(Value::as_str).map(str::to_string);
        drivers.push(DriverPayload {
            driver_number,
            info: DriverInfo { acronym, full_name, team, team_colour, headshot_url },
        });
    }
    if drivers.is_empty() {
        return Vec::new();
    }
    vec![InternalEvent::new(
        EventType::Drivers,
        None,
        EventPayload::Drivers(drivers),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_weather(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let get = |k: &str| accumulated.get(k).and_then(as_f64).unwrap_or(0.0);
    let rainfall = accumulated.get("Rainfall").and_then(as_f64).map(|v| v > 0.0).unwrap_or(false);
    vec![InternalEvent::new(
        EventType::Weather,
        None,
        EventPayload::Weather(WeatherPayload {
            air_temp: get("AirTemp"),
            track_temp: get("TrackTemp"),
            humidity: get("Humidity"),
            rainfall,
            wind_speed: get("WindSpeed"),
            wind_dir: get("WindDirection"),
            pressure: get("Pressure"),
        }),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_track_status(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(message) = accumulated.get("Message").and_then(Value::as_str) else { return Vec::new() };
    vec![InternalEvent::new(
        EventType::RaceControl,
        None,
        EventPayload::RaceControl(RaceControlPayload {
            message: message.to_string(),
            flag: accumulated.get("Status").and_then(Value::as_str).map(str::to_string),
            scope: Some("Track".to_string()),
            driver_number: None,
        }),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_race_control(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(messages) = accumulated.get("Messages").and_then(Value::as_object) else { return Vec::new() };
    messages
        .values()
        .filter_map(|m| {
            let message = m.get("Message").and_then(Value::as_str)?.to_string();
            Some(InternalEvent::new(
                EventType::RaceControl,
                m.get("RacingNumber").and_then(Value::as_str).and_then(|s| s.parse().ok()),
                EventPayload::RaceControl(RaceControlPayload {
                    message,
                    flag: m.get("Flag").and_then(Value::as_str).map(str::to_string),
                    scope: m.get("Scope").and_then(Value::as_str).map(str::to_string),
                    driver_number: m.get("RacingNumber").and_then(Value::as_str).and_then(|s| s.parse().ok()),
                }),
                timestamp_millis,
                EventSource::Signalr,
            ))
        })
        .collect()
}

fn normalize_session_info(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(session_key) = accumulated.get("Key").and_then(Value::as_i64) else { return Vec::new() };
    let Some(track_name) = accumulated.get("Meeting").and_then(|m| m.get("Circuit")).and_then(|c| c.get("ShortName")).and_then(Value::as_str) else {
        return Vec::new();
    };
    let Some(date_end_ts) = accumulated.get("EndDate").and_then(Value::as_str).and_then(|s| s.parse().ok()) else {
        return Vec::new();
    };
    let session_type = match accumulated.get("Type").and_then(Value::as_str).unwrap_or_default() {
        "Race" => SessionType::Race,
        "Sprint" => SessionType::Sprint,
        "Qualifying" => SessionType::Qualifying,
        _ => SessionType::Practice,
    };
    vec![InternalEvent::new(
        EventType::Session,
        None,
        EventPayload::Session(SessionInfoPayload {
            session_key,
            meeting_key: accumulated.get("Meeting").and_then(|m| m.get("Key")).and_then(Value::as_i64),
            track_name: track_name.to_string(),
            session_type,
            session_name: accumulated.get("Name").and_then(Value::as_str).unwrap_or_default().to_string(),
            date_end_ts,
        }),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_clock(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(remaining) = accumulated.get("Remaining").and_then(Value::as_str) else { return Vec::new() };
    let parts: Vec<&str> = remaining.split(':').collect();
    let remaining_ms = if parts.len() == 3 {
        let h: i64 = parts[0].parse().unwrap_or(0);
        let m: i64 = parts[1].parse().unwrap_or(0);
        let s: f64 = parts[2].parse().unwrap_or(0.0);
        ((h * 3600 + m * 60) as f64 + s) as i64 * 1000
    } else {
        0
    };
    vec![InternalEvent::new(
        EventType::Clock,
        None,
        EventPayload::Clock(ClockPayload {
            remaining_ms,
            running: !accumulated.get("Paused").and_then(Value::as_bool).unwrap_or(false),
        }),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_lap_count(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let current = accumulated.get("CurrentLap").and_then(Value::as_u64).unwrap_or(0) as u32;
    let total = accumulated.get("TotalLaps").and_then(Value::as_u64).unwrap_or(0) as u32;
    vec![InternalEvent::new(
        EventType::Lapcount,
        None,
        EventPayload::Lapcount(LapcountPayload { current_lap: current, total_laps: total }),
        timestamp_millis,
        EventSource::Signalr,
    )]
}

fn normalize_team_radio(accumulated: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(captures) = accumulated.get("Captures").and_then(Value::as_object) else { return Vec::new() };
    captures
        .values()
        .filter_map(|c| {
            let driver_number = c.get("RacingNumber").and_then(Value::as_str)?.parse().ok()?;
            Some(InternalEvent::new(
                EventType::TeamRadio,
                Some(driver_number),
                EventPayload::TeamRadio(TeamRadioPayload {
                    driver_number,
                    path: c.get("Path").and_then(Value::as_str).map(str::to_string),
                }),
                timestamp_millis,
                EventSource::Signalr,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accumulator_deep_merges_across_updates() {
        let mut acc = SignalRAccumulator::new();
        acc.apply("TimingData", json!({"Lines": {"44": {"NumberOfLaps": 1}}}));
        let merged = acc.apply("TimingData", json!({"Lines": {"44": {"GapToLeader": "+1.234"}}}));
        assert_eq!(merged["Lines"]["44"]["NumberOfLaps"], json!(1));
        assert_eq!(merged["Lines"]["44"]["GapToLeader"], json!("+1.234"));
    }

    #[test]
    fn timing_data_produces_interval_event() {
        let data = json!({"Lines": {"44": {"GapToLeader": "+1.234"}}});
        let events = normalize_timing_data(&data, 0);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Interval(p) => {
                assert!(matches!(p.gap_to_leader, Some(IntervalValue::Seconds(s)) if (s - 1.234).abs() < 1e-9));
            }
            _ => panic!("expected interval payload"),
        }
    }

    #[test]
    fn lap_difference_interval_parses() {
        assert!(matches!(
            parse_interval(&json!("+1 LAP")),
            Some(IntervalValue::Lap(LapDifference(1)))
        ));
    }

    #[test]
    fn weather_topic_normalizes_all_fields() {
        let data = json!({"AirTemp": "21.4", "TrackTemp": "32.1", "Humidity": "45", "Rainfall": "0", "WindSpeed": "1.2", "WindDirection": "180", "Pressure": "1009.1"});
        let events = normalize_weather(&data, 100);
        match &events[0].payload {
            EventPayload::Weather(w) => assert!((w.air_temp - 21.4).abs() < 1e-9),
            _ => panic!("expected weather payload"),
        }
    }
}
