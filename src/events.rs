//! The source-agnostic event schema the Normalizer produces (§4.1).
//!
//! `spec.md` describes the normalizer's output as a keyed map with optional
//! fields; per DESIGN NOTES §9 ("Heterogeneous event payloads... use a sum
//! type of event variants with typed payloads") that's modeled here as
//! [`EventPayload`], one variant per closed event type, plus `Unknown` for
//! forward compatibility. The Normalizer is the only module that constructs
//! these.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::types::*;

/// Where a normalized event originated. SignalR never suppresses SignalR;
/// only OpenF1 (MQTT) events are ever dropped by the arbiter (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Mqtt,
    Signalr,
    Replay,
}

/// The closed set of event types the Normalizer emits (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Session,
    Drivers,
    Location,
    Lap,
    CarData,
    Interval,
    Pit,
    Stint,
    Position,
    RaceControl,
    Weather,
    Overtake,
    Clock,
    Lapcount,
    TeamRadio,
    SessionData,
}

impl EventType {
    /// OpenF1-exclusive topics are never suppressed by the arbiter (§4.2):
    /// location, car_data, pit, lap, overtakes have no SignalR equivalent
    /// the arbiter compares against.
    pub fn is_arbitrated(self) -> bool {
        matches!(
            self,
            EventType::Stint | EventType::Interval | EventType::Weather | EventType::RaceControl
        )
    }
}

/// One GPS fix for a driver at an instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationPayload {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LapPayload {
    pub lap_number: u32,
    pub duration: Option<f64>,
    pub sector_1: Option<f64>,
    pub sector_2: Option<f64>,
    pub sector_3: Option<f64>,
    pub segments_1: Option<Vec<i32>>,
    pub segments_2: Option<Vec<i32>>,
    pub segments_3: Option<Vec<i32>>,
    pub i1_speed: Option<f64>,
    pub i2_speed: Option<f64>,
    pub st_speed: Option<f64>,
    pub is_pit_out_lap: bool,
    pub date_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CarDataPayload {
    pub speed: Option<f64>,
    pub drs: Option<bool>,
    pub gear: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalPayload {
    pub gap_to_leader: Option<IntervalValue>,
    pub interval_to_ahead: Option<IntervalValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitPayload {
    pub in_pit: bool,
    pub pit_duration: Option<f64>,
    pub leader_lap_at_entry: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StintPayload {
    pub compound: String,
    pub stint_number: u32,
    pub lap_start: u32,
    pub tyre_age_at_start: u32,
    pub total_laps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceControlPayload {
    pub message: String,
    pub flag: Option<String>,
    pub scope: Option<String>,
    pub driver_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherPayload {
    pub air_temp: f64,
    pub track_temp: f64,
    pub humidity: f64,
    pub rainfall: bool,
    pub wind_speed: f64,
    pub wind_dir: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvertakePayload {
    pub overtaking_driver: u32,
    pub overtaken_driver: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClockPayload {
    pub remaining_ms: i64,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LapcountPayload {
    pub current_lap: u32,
    pub total_laps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRadioPayload {
    pub driver_number: u32,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfoPayload {
    pub session_key: i64,
    pub meeting_key: Option<i64>,
    pub track_name: String,
    pub session_type: SessionType,
    pub session_name: String,
    pub date_end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverPayload {
    pub driver_number: u32,
    pub info: DriverInfo,
}

/// Typed union of all normalized event bodies. `Unknown` preserves forward
/// compatibility with upstream fields the normalizer doesn't yet model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventPayload {
    Session(SessionInfoPayload),
    Drivers(Vec<DriverPayload>),
    Location(LocationPayload),
    Lap(LapPayload),
    CarData(CarDataPayload),
    Interval(IntervalPayload),
    Pit(PitPayload),
    Stint(StintPayload),
    Position(LocationPayload),
    RaceControl(RaceControlPayload),
    Weather(WeatherPayload),
    Overtake(OvertakePayload),
    Clock(ClockPayload),
    Lapcount(LapcountPayload),
    TeamRadio(TeamRadioPayload),
    SessionData(Value),
    Unknown(Value),
}

/// A normalized, source-tagged event ready for arbitration and state
/// mutation (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalEvent {
    pub event_type: EventType,
    pub driver_number: Option<u32>,
    pub payload: EventPayload,
    pub timestamp_millis: i64,
    pub source: EventSource,
}

impl InternalEvent {
    pub fn new(
        event_type: EventType,
        driver_number: Option<u32>,
        payload: EventPayload,
        timestamp_millis: i64,
        source: EventSource,
    ) -> Self {
        InternalEvent {
            event_type,
            driver_number,
            payload,
            timestamp_millis,
            source,
        }
    }
}
