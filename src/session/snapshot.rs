//! Immutable, cheaply-cloneable read-side projection of [`Session`] (§5,
//! SPEC_FULL §3 supplement). The writer task clones one of these after each
//! mutation batch and publishes it on a `watch` channel; the broadcaster
//! pipeline and persistence layer only ever see this type, never the live
//! `Session`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Session, TrackFlag};
use super::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_key: i64,
    pub meeting_key: Option<i64>,
    pub track_name: String,
    pub session_type: SessionType,
    pub session_name: String,
    pub date_end_ts: DateTime<Utc>,
    pub active_track_flag: Option<TrackFlag>,
    pub drivers: Vec<(u32, DriverInfo)>,
    pub current_position: Vec<(u32, Point)>,
    pub current_lap: Vec<(u32, u32)>,
    pub current_lap_partial: Vec<(u32, Lap)>,
    pub race_position: Vec<(u32, u32)>,
    pub weather: Option<Weather>,
    pub race_control: Vec<RaceControlEvent>,
    pub overtakes: Vec<Overtake>,
    pub completed_laps: Vec<(LapKey, Lap)>,
    pub stints: Vec<(u32, Stint)>,
    pub pits: Vec<(u32, Pit)>,
    pub car_telemetry: Vec<(u32, CarTelemetry)>,
    pub baseline_path: Path,
    pub baseline_arc: ArcLengthTable,
    pub multiviewer_path: Option<Path>,
    pub corners: Vec<Corner>,
    pub sector_boundaries: Option<SectorBoundaries>,
    pub pit_lane_profile: Option<PitLaneProfile>,
    pub dnfs: Vec<u32>,
    pub total_laps: Option<u32>,
    pub lifecycle_token: u64,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        SessionSnapshot {
            session_key: s.session_key,
            meeting_key: s.meeting_key,
            track_name: s.track_name.clone(),
            session_type: s.session_type,
            session_name: s.session_name.clone(),
            date_end_ts: s.date_end_ts,
            active_track_flag: track_flag(s),
            drivers: s.drivers.iter().map(|(k, v)| (*k, v.clone())).collect(),
            current_position: s.current_position.iter().map(|(k, v)| (*k, *v)).collect(),
            current_lap: s.current_lap.iter().map(|(k, v)| (*k, *v)).collect(),
            current_lap_partial: s.current_lap_partial.iter().map(|(k, (_, lap))| (*k, lap.clone())).collect(),
            race_position: s.race_position.iter().map(|(k, v)| (*k, *v)).collect(),
            weather: s.weather,
            race_control: s.race_control.clone(),
            overtakes: s.overtakes.clone(),
            completed_laps: s.completed_laps.iter().map(|(k, v)| (*k, v.clone())).collect(),
            stints: s.stints.iter().map(|(k, v)| (*k, v.clone())).collect(),
            pits: s.pits.iter().map(|(k, v)| (*k, v.clone())).collect(),
            car_telemetry: s.car_telemetry.iter().map(|(k, v)| (*k, *v)).collect(),
            baseline_path: s.baseline_path.clone(),
            baseline_arc: s.baseline_arc.clone(),
            multiviewer_path: s.multiviewer_path.clone(),
            corners: s.corners.clone(),
            sector_boundaries: s.sector_boundaries,
            pit_lane_profile: s.pit_lane_profile,
            dnfs: s.dnfs.iter().copied().collect(),
            total_laps: s.total_laps,
            lifecycle_token: s.lifecycle_token,
        }
    }
}

/// Collapses the session's independent safety-car/red-flag bits into a
/// single displayed flag, red taking precedence (§4.6's clock-fallback
/// `running` computation only cares whether the flag is red).
fn track_flag(s: &Session) -> Option<TrackFlag> {
    if s.active_red_flag == Some(true) {
        Some(TrackFlag::Red)
    } else if s.active_safety_car == Some(true) {
        Some(TrackFlag::SafetyCar)
    } else if s.active_red_flag.is_some() || s.active_safety_car.is_some() {
        Some(TrackFlag::Green)
    } else {
        None
    }
}
