//! OpenF1-topic (MQTT) normalization (§4.1, §6).
//!
//! Each `v1/{...}` topic carries a JSON object matching the OpenF1 schema.
//! Pure translation: no state mutation, and missing fields produce `None`
//! rather than a zero value so absent and zero-valued numerics stay
//! distinguishable (§4.1).
use serde_json::Value;

use crate::events::*;
use crate::session::types::{DriverInfo, IntervalValue};

fn as_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

fn as_u32(v: &Value, key: &str) -> Option<u32> {
    v.get(key).and_then(Value::as_u64).map(|n| n as u32)
}

fn as_bool(v: &Value, key: &str) -> Option<bool> {
    v.get(key).and_then(Value::as_bool)
}

fn as_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn driver_number(v: &Value) -> Option<u32> {
    as_u32(v, "driver_number")
}

/// Pure translation of one OpenF1 MQTT payload, tagged by `topic`, into zero
/// or more [`InternalEvent`]s (§4.1). Unrecognized topics produce nothing.
pub fn normalize_mqtt(topic: &str, payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let leaf = topic.rsplit('/').next().unwrap_or(topic);
    match leaf {
        "location" => normalize_location(payload, timestamp_millis),
        "position" => normalize_position(payload, timestamp_millis),
        "laps" => normalize_lap(payload, timestamp_millis),
        "car_data" => normalize_car_data(payload, timestamp_millis),
        "intervals" => normalize_interval(payload, timestamp_millis),
        "pit" => normalize_pit(payload, timestamp_millis),
        "stints" => normalize_stint(payload, timestamp_millis),
        "race_control" => normalize_race_control(payload, timestamp_millis),
        "weather" => normalize_weather(payload, timestamp_millis),
        "overtakes" => normalize_overtake(payload, timestamp_millis),
        "drivers" => normalize_drivers(payload, timestamp_millis),
        "sessions" => normalize_session(payload, timestamp_millis),
        _ => Vec::new(),
    }
}

fn normalize_location(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let (Some(x), Some(y)) = (as_f64(payload, "x"), as_f64(payload, "y")) else { return Vec::new() };
    vec![InternalEvent::new(
        EventType::Location,
        driver_number(payload),
        EventPayload::Location(LocationPayload { x, y }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_position(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let (Some(x), Some(y)) = (as_f64(payload, "x"), as_f64(payload, "y")) else { return Vec::new() };
    vec![InternalEvent::new(
        EventType::Position,
        driver_number(payload),
        EventPayload::Position(LocationPayload { x, y }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_lap(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(lap_number) = as_u32(payload, "lap_number") else { return Vec::new() };
    let segments = |key: &str| payload.get(key).and_then(Value::as_array).map(|a| {
        a.iter().filter_map(|v| v.as_i64().map(|n| n as i32)).collect::<Vec<_>>()
    });
    vec![InternalEvent::new(
        EventType::Lap,
        driver_number(payload),
        EventPayload::Lap(LapPayload {
            lap_number,
            duration: as_f64(payload, "lap_duration"),
            sector_1: as_f64(payload, "duration_sector_1"),
            sector_2: as_f64(payload, "duration_sector_2"),
            sector_3: as_f64(payload, "duration_sector_3"),
            segments_1: segments("segments_sector_1"),
            segments_2: segments("segments_sector_2"),
            segments_3: segments("segments_sector_3"),
            i1_speed: as_f64(payload, "i1_speed"),
            i2_speed: as_f64(payload, "i2_speed"),
            st_speed: as_f64(payload, "st_speed"),
            is_pit_out_lap: as_bool(payload, "is_pit_out_lap").unwrap_or(false),
            date_start: payload.get("date_start").and_then(Value::as_str).and_then(|s| s.parse().ok()),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_car_data(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    vec![InternalEvent::new(
        EventType::CarData,
        driver_number(payload),
        EventPayload::CarData(CarDataPayload {
            speed: as_f64(payload, "speed"),
            drs: as_f64(payload, "drs").map(|d| d > 0.0),
            gear: payload.get("n_gear").and_then(Value::as_i64).map(|g| g as i32),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn parse_interval_value(v: &Value) -> Option<IntervalValue> {
    if let Some(n) = v.as_f64() {
        return Some(IntervalValue::Seconds(n));
    }
    let text = v.as_str()?;
    if let Some(rest) = text.strip_prefix('+').and_then(|r| r.strip_suffix(" LAP").or_else(|| r.strip_suffix(" LAPS"))) {
        return rest.parse::<i32>().ok().map(|n| IntervalValue::Lap(crate::session::types::LapDifference(n)));
    }
    text.trim_start_matches('+').parse::<f64>().ok().map(IntervalValue::Seconds)
}

fn normalize_interval(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    vec![InternalEvent::new(
        EventType::Interval,
        driver_number(payload),
        EventPayload::Interval(IntervalPayload {
            gap_to_leader: payload.get("gap_to_leader").and_then(parse_interval_value),
            interval_to_ahead: payload.get("interval").and_then(parse_interval_value),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_pit(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    vec![InternalEvent::new(
        EventType::Pit,
        driver_number(payload),
        EventPayload::Pit(PitPayload {
            in_pit: true,
            pit_duration: as_f64(payload, "pit_duration"),
            leader_lap_at_entry: payload.get("lap_number").and_then(Value::as_i64),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_stint(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(compound) = as_str(payload, "compound") else { return Vec::new() };
    vec![InternalEvent::new(
        EventType::Stint,
        driver_number(payload),
        EventPayload::Stint(StintPayload {
            compound,
            stint_number: as_u32(payload, "stint_number").unwrap_or(0),
            lap_start: as_u32(payload, "lap_start").unwrap_or(0),
            tyre_age_at_start: as_u32(payload, "tyre_age_at_start").unwrap_or(0),
            total_laps: as_u32(payload, "total_laps"),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_race_control(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(message) = as_str(payload, "message") else { return Vec::new() };
    vec![InternalEvent::new(
        EventType::RaceControl,
        driver_number(payload),
        EventPayload::RaceControl(RaceControlPayload {
            message,
            flag: as_str(payload, "flag"),
            scope: as_str(payload, "scope"),
            driver_number: driver_number(payload),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_weather(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    vec![InternalEvent::new(
        EventType::Weather,
        None,
        EventPayload::Weather(WeatherPayload {
            air_temp: as_f64(payload, "air_temperature").unwrap_or(0.0),
            track_temp: as_f64(payload, "track_temperature").unwrap_or(0.0),
            humidity: as_f64(payload, "humidity").unwrap_or(0.0),
            rainfall: as_f64(payload, "rainfall").map(|v| v > 0.0).unwrap_or(false),
            wind_speed: as_f64(payload, "wind_speed").unwrap_or(0.0),
            wind_dir: as_f64(payload, "wind_direction").unwrap_or(0.0),
            pressure: as_f64(payload, "pressure").unwrap_or(0.0),
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_overtake(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let (Some(overtaking), Some(overtaken)) = (
        as_u32(payload, "overtaking_driver_number"),
        as_u32(payload, "overtaken_driver_number"),
    ) else {
        return Vec::new();
    };
    vec![InternalEvent::new(
        EventType::Overtake,
        Some(overtaking),
        EventPayload::Overtake(OvertakePayload { overtaking_driver: overtaking, overtaken_driver: overtaken }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_drivers(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(num) = driver_number(payload) else { return Vec::new() };
    let info = DriverInfo {
        acronym: as_str(payload, "name_acronym").unwrap_or_default(),
        full_name: as_str(payload, "full_name").unwrap_or_default(),
        team: as_str(payload, "team_name").unwrap_or_default(),
        team_colour: as_str(payload, "team_colour").unwrap_or_default(),
        headshot_url: as_str(payload, "headshot_url"),
    };
    vec![InternalEvent::new(
        EventType::Drivers,
        Some(num),
        EventPayload::Drivers(vec![DriverPayload { driver_number: num, info }]),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

fn normalize_session(payload: &Value, timestamp_millis: i64) -> Vec<InternalEvent> {
    let Some(session_key) = payload.get("session_key").and_then(Value::as_i64) else { return Vec::new() };
    let Some(track_name) = as_str(payload, "circuit_short_name") else { return Vec::new() };
    let Some(date_end_ts) = payload.get("date_end").and_then(Value::as_str).and_then(|s| s.parse().ok()) else {
        return Vec::new();
    };
    let session_type = match as_str(payload, "session_type").as_deref() {
        Some("Race") => crate::session::types::SessionType::Race,
        Some("Sprint") => crate::session::types::SessionType::Sprint,
        Some("Qualifying") => crate::session::types::SessionType::Qualifying,
        _ => crate::session::types::SessionType::Practice,
    };
    vec![InternalEvent::new(
        EventType::Session,
        None,
        EventPayload::Session(SessionInfoPayload {
            session_key,
            meeting_key: payload.get("meeting_key").and_then(Value::as_i64),
            track_name,
            session_type,
            session_name: as_str(payload, "session_name").unwrap_or_default(),
            date_end_ts,
        }),
        timestamp_millis,
        EventSource::Mqtt,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn location_round_trips_coordinates() {
        let payload = json!({"driver_number": 44, "x": 120.5, "y": -340.2});
        let events = normalize_mqtt("v1/location", &payload, 0);
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            EventPayload::Location(p) => {
                assert_eq!(p.x, 120.5);
                assert_eq!(p.y, -340.2);
            }
            _ => panic!("expected location payload"),
        }
        assert_eq!(events[0].driver_number, Some(44));
    }

    /// Missing fields produce `None`, not a zero value (§4.1).
    #[test]
    fn lap_missing_sector_is_none_not_zero() {
        let payload = json!({"driver_number": 44, "lap_number": 3, "lap_duration": 91.2});
        let events = normalize_mqtt("v1/laps", &payload, 0);
        match &events[0].payload {
            EventPayload::Lap(p) => {
                assert_eq!(p.sector_1, None);
                assert_eq!(p.duration, Some(91.2));
            }
            _ => panic!("expected lap payload"),
        }
    }

    #[test]
    fn pit_event_sets_in_pit() {
        let payload = json!({"driver_number": 77, "lap_number": 10});
        let events = normalize_mqtt("v1/pit", &payload, 1234);
        match &events[0].payload {
            EventPayload::Pit(p) => assert!(p.in_pit),
            _ => panic!("expected pit payload"),
        }
    }

    #[test]
    fn unknown_topic_yields_no_events() {
        let events = normalize_mqtt("v1/unknown_topic", &json!({}), 0);
        assert!(events.is_empty());
    }
}
