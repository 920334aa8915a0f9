//! The authoritative in-memory Session model (§3) and the invariants its
//! mutation methods enforce. Every write path the rest of the core uses goes
//! through here; nothing outside this module is allowed to construct a
//! `Session` field update directly, which is what makes the invariants in
//! §8 checkable by unit test alone.
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::types::*;

/// Minimum spacing between retained weather history samples (§3).
const WEATHER_HISTORY_MIN_SPACING: i64 = 5 * 60; // seconds

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackFlag {
    Green,
    Yellow,
    SafetyCar,
    VirtualSafetyCar,
    Red,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_key: i64,
    pub meeting_key: Option<i64>,
    pub track_name: String,
    pub session_type: SessionType,
    pub session_name: String,
    pub date_end_ts: DateTime<Utc>,

    pub drivers: HashMap<u32, DriverInfo>,
    pub position_history: PositionHistory,
    pub current_position: HashMap<u32, Point>,
    pub current_lap: HashMap<u32, u32>,
    pub completed_laps: HashMap<LapKey, Lap>,
    /// Progressively-delivered segment/sector data for each driver's
    /// in-progress lap, keyed by driver with the lap number it belongs to
    /// (§4.5): upstream sends several `duration: None` updates per lap
    /// before the final one carrying `duration`, and live-mode driver state
    /// reads the in-progress segments from here rather than from the
    /// previous completed lap.
    pub current_lap_partial: HashMap<u32, (u32, Lap)>,

    pub session_best_lap: Option<f64>,
    pub driver_best_lap: HashMap<u32, f64>,
    pub race_position: HashMap<u32, u32>,
    pub intervals: HashMap<u32, Intervals>,

    pub stints: HashMap<u32, Stint>,
    pub stint_history: HashMap<u32, Vec<Stint>>,
    pub pits: HashMap<u32, Pit>,
    pub car_telemetry: HashMap<u32, CarTelemetry>,

    pub weather: Option<Weather>,
    pub weather_history: Vec<WeatherSample>,

    pub race_control: Vec<RaceControlEvent>,
    pub overtakes: Vec<Overtake>,
    pub team_radio: Vec<TeamRadio>,
    pub session_data: Vec<serde_json::Value>,

    pub baseline_path: Path,
    pub multiviewer_path: Option<Path>,
    pub corners: Vec<Corner>,
    pub sector_boundaries: Option<SectorBoundaries>,
    pub pit_lane_profile: Option<PitLaneProfile>,
    pub baseline_arc: ArcLengthTable,
    pub multiviewer_arc: Option<ArcLengthTable>,
    pub baseline_path_version: u64,

    pub dnfs: HashSet<u32>,
    pub race_control_dnfs: HashSet<u32>,
    pub timeout_dnf_drivers: HashSet<u32>,
    pub track_stalls: HashMap<u32, i64>,
    pub active_safety_car: Option<bool>,
    pub active_red_flag: Option<bool>,
    pub total_laps: Option<u32>,
    pub total_laps_processed: u64,

    /// Generation / lifecycle token: bumped whenever this session is
    /// superseded, so in-flight async work tagged with a stale value can
    /// detect it the same way the replay engine's generation counter does
    /// (§5, §9).
    pub lifecycle_token: u64,
}

impl Session {
    pub fn new(
        session_key: i64,
        meeting_key: Option<i64>,
        track_name: String,
        session_type: SessionType,
        session_name: String,
        date_end_ts: DateTime<Utc>,
    ) -> Self {
        Session {
            session_key,
            meeting_key,
            track_name,
            session_type,
            session_name,
            date_end_ts,
            drivers: HashMap::new(),
            position_history: HashMap::new(),
            current_position: HashMap::new(),
            current_lap: HashMap::new(),
            completed_laps: HashMap::new(),
            current_lap_partial: HashMap::new(),
            session_best_lap: None,
            driver_best_lap: HashMap::new(),
            race_position: HashMap::new(),
            intervals: HashMap::new(),
            stints: HashMap::new(),
            stint_history: HashMap::new(),
            pits: HashMap::new(),
            car_telemetry: HashMap::new(),
            weather: None,
            weather_history: Vec::new(),
            race_control: Vec::new(),
            overtakes: Vec::new(),
            team_radio: Vec::new(),
            session_data: Vec::new(),
            baseline_path: Vec::new(),
            multiviewer_path: None,
            corners: Vec::new(),
            sector_boundaries: None,
            pit_lane_profile: None,
            baseline_arc: Vec::new(),
            multiviewer_arc: None,
            baseline_path_version: 0,
            dnfs: HashSet::new(),
            race_control_dnfs: HashSet::new(),
            timeout_dnf_drivers: HashSet::new(),
            track_stalls: HashMap::new(),
            active_safety_car: None,
            active_red_flag: None,
            total_laps: None,
            total_laps_processed: 0,
            lifecycle_token: 0,
        }
    }

    /// §3 invariant: current lap is monotone non-decreasing per driver.
    /// Out-of-order lower-numbered lap messages are still accepted for
    /// `completed_laps` upserts (§5) but never move this value backwards.
    pub fn set_current_lap(&mut self, driver_number: u32, lap_number: u32) {
        let entry = self.current_lap.entry(driver_number).or_insert(0);
        if lap_number > *entry {
            *entry = lap_number;
        }
    }

    pub fn current_lap_of(&self, driver_number: u32) -> u32 {
        self.current_lap.get(&driver_number).copied().unwrap_or(0)
    }

    /// §3 invariant: never overwritten with an older version if the newer
    /// carries strictly less data; otherwise upserted progressively.
    pub fn upsert_completed_lap(&mut self, driver_number: u32, lap_number: u32, lap: Lap) {
        let key = LapKey { driver_number, lap_number };
        let replace = match self.completed_laps.get(&key) {
            Some(existing) => lap.completeness() >= existing.completeness(),
            None => true,
        };
        if replace {
            if let Some(duration) = Some(lap.duration).filter(|d| *d > 0.0) {
                let best = self.driver_best_lap.entry(driver_number).or_insert(f64::MAX);
                if duration < *best {
                    *best = duration;
                }
                self.session_best_lap = Some(
                    self.session_best_lap
                        .map_or(duration, |b| b.min(duration)),
                );
            }
            self.completed_laps.insert(key, lap);
        }
    }

    /// §4.5: merges one driver's progressive lap update into
    /// `current_lap_partial`, resetting to a fresh `Lap` whenever
    /// `lap_number` advances past what's stored so segments from a
    /// completed lap never leak into the next one's partial state.
    pub fn merge_current_lap_partial(&mut self, driver_number: u32, lap_number: u32, merge: impl FnOnce(&mut Lap)) {
        let entry = self.current_lap_partial.entry(driver_number).or_insert_with(|| (lap_number, Lap::default()));
        if entry.0 != lap_number {
            *entry = (lap_number, Lap::default());
        }
        merge(&mut entry.1);
    }

    pub fn leader_lap(&self) -> u32 {
        self.current_lap.values().copied().max().unwrap_or(0)
    }

    pub fn set_position(&mut self, driver_number: u32, point: Point, timestamp: DateTime<Utc>) {
        self.current_position.insert(driver_number, point);
        let lap = self.current_lap_of(driver_number);
        self.position_history
            .entry(driver_number)
            .or_default()
            .entry(lap)
            .or_default()
            .push(PositionSample {
                x: point.x,
                y: point.y,
                timestamp,
            });
    }

    /// §3 invariant: `baseline_path[0] == baseline_path[last]` exactly, and
    /// the arc-length cache is recomputed on every mutation.
    pub fn set_baseline_path(&mut self, mut path: Path) {
        if path.len() >= 2 {
            let first = path[0];
            let last_idx = path.len() - 1;
            path[last_idx] = first;
        }
        self.baseline_arc = crate::geometry::path::arc_length_table(&path);
        self.baseline_path = path;
        self.baseline_path_version += 1;
    }

    pub fn set_multiviewer_path(&mut self, path: Path) {
        self.multiviewer_arc = Some(crate::geometry::path::arc_length_table(&path));
        self.multiviewer_path = Some(path);
    }

    pub fn record_weather(&mut self, weather: Weather, timestamp: DateTime<Utc>) {
        self.weather = Some(weather);
        let keep = match self.weather_history.last() {
            Some(last) => (timestamp - last.timestamp) >= ChronoDuration::seconds(WEATHER_HISTORY_MIN_SPACING),
            None => true,
        };
        if keep {
            self.weather_history.push(WeatherSample { weather, timestamp });
        }
    }

    /// A new stint closes out the previous one into history (§3).
    pub fn set_stint(&mut self, driver_number: u32, stint: Stint) {
        if let Some(previous) = self.stints.insert(driver_number, stint) {
            self.stint_history.entry(driver_number).or_default().push(previous);
        }
    }

    pub fn tyre_age(&self, driver_number: u32) -> u32 {
        let Some(stint) = self.stints.get(&driver_number) else {
            return 0;
        };
        if let Some(total) = stint.total_laps {
            return total;
        }
        let current = self.current_lap_of(driver_number);
        current.saturating_sub(stint.lap_start) + stint.tyre_age_at_start
    }

    /// A race-control DNF is permanent (§3, §8 property 6): once in
    /// `race_control_dnfs`, no timeout-reversal path may remove it from
    /// `dnfs`.
    pub fn mark_race_control_dnf(&mut self, driver_number: u32) {
        self.race_control_dnfs.insert(driver_number);
        self.dnfs.insert(driver_number);
        self.timeout_dnf_drivers.remove(&driver_number);
    }

    pub fn mark_timeout_dnf(&mut self, driver_number: u32) {
        if !self.race_control_dnfs.contains(&driver_number) {
            self.dnfs.insert(driver_number);
            self.timeout_dnf_drivers.insert(driver_number);
        }
    }

    /// Reverses a timeout-based DNF. No-op if the driver's DNF is
    /// race-control-permanent.
    pub fn reverse_timeout_dnf(&mut self, driver_number: u32) {
        if self.race_control_dnfs.contains(&driver_number) {
            return;
        }
        if self.timeout_dnf_drivers.remove(&driver_number) {
            self.dnfs.remove(&driver_number);
        }
        self.track_stalls.remove(&driver_number);
    }

    pub fn is_retired(&self, driver_number: u32) -> bool {
        self.dnfs.contains(&driver_number)
    }

    /// Bumps the lifecycle token, invalidating any in-flight work tagged
    /// with the prior value (§5, §9).
    pub fn bump_lifecycle(&mut self) {
        self.lifecycle_token += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> Session {
        Session::new(
            9001,
            None,
            "Monza".to_string(),
            SessionType::Race,
            "Race".to_string(),
            Utc.with_ymd_and_hms(2026, 7, 27, 14, 0, 0).unwrap(),
        )
    }

    /// §8 property 1: current lap is non-decreasing across any sequence.
    #[test]
    fn current_lap_is_monotone() {
        let mut s = session();
        s.set_current_lap(44, 3);
        s.set_current_lap(44, 2); // stale, lower lap arrives late
        assert_eq!(s.current_lap_of(44), 3);
        s.set_current_lap(44, 5);
        assert_eq!(s.current_lap_of(44), 5);
    }

    /// S2: out-of-order lap messages both land in `completed_laps`, and the
    /// current lap never regresses.
    #[test]
    fn scenario_s2_monotone_lap_with_out_of_order_completion() {
        let mut s = session();
        s.set_current_lap(44, 3);
        s.upsert_completed_lap(
            44,
            3,
            Lap {
                duration: 91.2,
                sector_1: Some(30.0),
                sector_2: Some(30.0),
                sector_3: Some(31.2),
                segments_1: vec![],
                segments_2: vec![],
                segments_3: vec![],
                i1_speed: None,
                i2_speed: None,
                st_speed: None,
                is_pit_out_lap: false,
                date_start: None,
            },
        );
        assert_eq!(s.current_lap_of(44), 3);
        s.upsert_completed_lap(
            44,
            2,
            Lap {
                duration: 90.9,
                sector_1: Some(30.0),
                sector_2: Some(30.0),
                sector_3: Some(30.9),
                segments_1: vec![],
                segments_2: vec![],
                segments_3: vec![],
                i1_speed: None,
                i2_speed: None,
                st_speed: None,
                is_pit_out_lap: false,
                date_start: None,
            },
        );
        assert_eq!(s.current_lap_of(44), 3);
        assert_eq!(s.driver_best_lap.get(&44), Some(&90.9));
        assert_eq!(s.completed_laps.len(), 2);
    }

    /// §8 property 6: race-control DNF is permanent.
    #[test]
    fn race_control_dnf_is_never_reversed() {
        let mut s = session();
        s.mark_race_control_dnf(77);
        s.reverse_timeout_dnf(77);
        assert!(s.is_retired(77));
    }

    #[test]
    fn timeout_dnf_reverses_when_driver_moves() {
        let mut s = session();
        s.mark_timeout_dnf(77);
        assert!(s.is_retired(77));
        s.reverse_timeout_dnf(77);
        assert!(!s.is_retired(77));
    }

    /// §3 invariant: baseline path closure is snapped exactly.
    #[test]
    fn baseline_path_closes_exactly() {
        let mut s = session();
        s.set_baseline_path(vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 1.0 },
            Point { x: 2.0, y: 0.0001 },
        ]);
        assert_eq!(s.baseline_path.first(), s.baseline_path.last());
        assert_eq!(s.baseline_arc.len(), s.baseline_path.len());
    }

    #[test]
    fn stint_change_closes_out_history() {
        let mut s = session();
        s.set_stint(
            44,
            Stint {
                compound: "SOFT".into(),
                stint_number: 1,
                lap_start: 0,
                tyre_age_at_start: 0,
                total_laps: None,
                source: StintSource::Signalr,
            },
        );
        s.set_stint(
            44,
            Stint {
                compound: "HARD".into(),
                stint_number: 2,
                lap_start: 20,
                tyre_age_at_start: 0,
                total_laps: None,
                source: StintSource::Signalr,
            },
        );
        assert_eq!(s.stint_history.get(&44).unwrap().len(), 1);
        assert_eq!(s.stints.get(&44).unwrap().stint_number, 2);
    }

    #[test]
    fn tyre_age_uses_total_laps_when_present() {
        let mut s = session();
        s.set_stint(
            44,
            Stint {
                compound: "SOFT".into(),
                stint_number: 1,
                lap_start: 0,
                tyre_age_at_start: 2,
                total_laps: Some(9),
                source: StintSource::Signalr,
            },
        );
        assert_eq!(s.tyre_age(44), 9);
    }

    #[test]
    fn tyre_age_falls_back_to_lap_arithmetic() {
        let mut s = session();
        s.set_stint(
            44,
            Stint {
                compound: "SOFT".into(),
                stint_number: 1,
                lap_start: 5,
                tyre_age_at_start: 1,
                total_laps: None,
                source: StintSource::Mqtt,
            },
        );
        s.set_current_lap(44, 10);
        assert_eq!(s.tyre_age(44), (10 - 5) + 1);
    }

    #[test]
    fn weather_history_respects_minimum_spacing() {
        let mut s = session();
        let w = Weather {
            air_temp: 20.0,
            track_temp: 30.0,
            humidity: 50.0,
            rainfall: false,
            wind_speed: 1.0,
            wind_dir: 180.0,
            pressure: 1000.0,
        };
        let t0 = Utc.with_ymd_and_hms(2026, 7, 27, 14, 0, 0).unwrap();
        s.record_weather(w, t0);
        s.record_weather(w, t0 + ChronoDuration::seconds(30));
        assert_eq!(s.weather_history.len(), 1);
        s.record_weather(w, t0 + ChronoDuration::seconds(301));
        assert_eq!(s.weather_history.len(), 2);
    }
}
