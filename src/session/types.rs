//! Plain data types making up the Session aggregate (§3).
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Race,
    Sprint,
    Qualifying,
    Practice,
    Demo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub acronym: String,
    pub full_name: String,
    pub team: String,
    pub team_colour: String,
    pub headshot_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
}

impl PositionSample {
    pub fn point(&self) -> Point {
        Point { x: self.x, y: self.y }
    }
}

/// Key into `Session::completed_laps`. Renders as `"<driver>-<lap>"` to match
/// the wire-level key described in §3, but is stored as a typed tuple so it
/// sorts and hashes without string parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LapKey {
    pub driver_number: u32,
    pub lap_number: u32,
}

impl fmt::Display for LapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.driver_number, self.lap_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    pub duration: f64,
    pub sector_1: Option<f64>,
    pub sector_2: Option<f64>,
    pub sector_3: Option<f64>,
    pub segments_1: Vec<i32>,
    pub segments_2: Vec<i32>,
    pub segments_3: Vec<i32>,
    pub i1_speed: Option<f64>,
    pub i2_speed: Option<f64>,
    pub st_speed: Option<f64>,
    pub is_pit_out_lap: bool,
    pub date_start: Option<DateTime<Utc>>,
}

impl Lap {
    /// A rough completeness score used to decide whether an update upserts
    /// or is discarded for carrying strictly less data (§3 invariant).
    pub fn completeness(&self) -> usize {
        let mut score = 0;
        if self.sector_1.is_some() {
            score += 1;
        }
        if self.sector_2.is_some() {
            score += 1;
        }
        if self.sector_3.is_some() {
            score += 1;
        }
        score += self.segments_1.iter().filter(|v| **v != 0).count();
        score += self.segments_2.iter().filter(|v| **v != 0).count();
        score += self.segments_3.iter().filter(|v| **v != 0).count();
        if self.i1_speed.is_some() {
            score += 1;
        }
        if self.i2_speed.is_some() {
            score += 1;
        }
        if self.st_speed.is_some() {
            score += 1;
        }
        score
    }

    /// Whether this lap qualifies for the track-centerline build (§4.4):
    /// within 107% of `session_best`, not a pit-out lap, and carries at
    /// least one GPS sample (checked by the caller against position history).
    pub fn is_fast(&self, session_best: f64) -> bool {
        !self.is_pit_out_lap && self.duration <= session_best * 1.07
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit")]
pub enum IntervalValue {
    Seconds(f64),
    Lap(LapDifference),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LapDifference(pub i32);

impl fmt::Display for LapDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{} LAP", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Intervals {
    pub gap_to_leader: Option<IntervalValue>,
    pub interval_to_ahead: Option<IntervalValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StintSource {
    Mqtt,
    Signalr,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stint {
    pub compound: String,
    pub stint_number: u32,
    pub lap_start: u32,
    pub tyre_age_at_start: u32,
    pub total_laps: Option<u32>,
    pub source: StintSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pit {
    pub count: u32,
    pub last_duration: Option<f64>,
    pub in_pit: bool,
    pub entry_position: Option<u32>,
    pub pit_entry_leader_lap: Option<i64>,
    pub accumulated_pit_lane_positions: Vec<Point>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CarTelemetry {
    pub speed: Option<f64>,
    pub drs: Option<bool>,
    pub gear: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub air_temp: f64,
    pub track_temp: f64,
    pub humidity: f64,
    pub rainfall: bool,
    pub wind_speed: f64,
    pub wind_dir: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeatherSample {
    pub weather: Weather,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceControlEvent {
    pub message: String,
    pub flag: Option<String>,
    pub scope: Option<String>,
    pub driver_number: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Overtake {
    pub overtaking_driver: u32,
    pub overtaken_driver: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRadio {
    pub driver_number: u32,
    pub path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub type Path = Vec<Point>;
pub type ArcLengthTable = Vec<f64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Corner {
    pub number: u32,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorBoundaries {
    pub start_finish: f64,
    pub sector_1_2: f64,
    pub sector_2_3: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PitLaneProfile {
    pub entry_progress: f64,
    pub exit_progress: f64,
    pub pit_side: PitSide,
    pub pit_lane_speed_limit: f64,
    pub samples_collected: u32,
}

/// One observed pit-lane sample feeding the pit-lane profile aggregator
/// (§4.4). Collected once per completed pit stop.
#[derive(Debug, Clone)]
pub struct PitLaneSample {
    pub entry_point: Point,
    pub exit_point: Point,
    pub side_vote: f64,
    pub positions: Vec<Point>,
}

/// Per-driver state recomputed every driver-state batcher tick (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLiveState {
    pub driver_number: u32,
    pub position: Option<Point>,
    pub lap: u32,
    pub last_lap: Option<Lap>,
    pub segments_1: Vec<i32>,
    pub segments_2: Vec<i32>,
    pub segments_3: Vec<i32>,
    pub tyre_compound: Option<String>,
    pub tyre_age: u32,
    pub in_pit: bool,
    pub pit_count: u32,
    pub telemetry: CarTelemetry,
    pub retired: bool,
}

/// Positions batch payload (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarPositionPayload {
    pub driver_number: u32,
    pub x: f64,
    pub y: f64,
}

pub type PositionHistory = HashMap<u32, HashMap<u32, Vec<PositionSample>>>;
