//! Driver State Aggregator (§4.5): computes the per-driver live state array
//! emitted every driver-state batcher tick, and runs DNF inference
//! (pit-timeout and track-stall) on lap-completion events.
use std::time::Duration;

use crate::config::PIT_TIMEOUT_LAPS;
use crate::geometry::sectors::sector_fraction;
use crate::session::snapshot::SessionSnapshot;
use crate::session::state::Session;
use crate::session::types::*;

/// Speed below which a car is considered stalled on track (§4.5).
const TRACK_STALL_SPEED_KMH: f64 = 5.0;
/// Speed above which a stationary-in-pit driver is considered to have moved
/// again, reversing a pit-timeout DNF (§4.5).
const PIT_EXIT_SPEED_KMH: f64 = 10.0;
/// Lap-counter transition window during which segments are zeroed entirely
/// because GPS progress hasn't settled yet (§4.5).
const LAP_TRANSITION_WINDOW: Duration = Duration::from_millis(1500);
/// Progress-within-lap threshold ("high lap-relative progress") above which
/// a just-started lap is still considered mid-transition.
const LAP_TRANSITION_PROGRESS_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnfKind {
    PitTimeout,
    TrackStall,
}

#[derive(Debug, Clone, Copy)]
pub struct DnfTransition {
    pub driver_number: u32,
    pub kind: DnfKind,
    pub retired: bool,
}

/// Runs DNF inference appropriate to a lap-completion event for `driver`
/// (§4.5): pit-timeout (driver stationary in the pit lane for >= 2 leader
/// laps) and track-stall elapsed-time checks.
pub fn on_lap_completed(session: &mut Session, driver_number: u32) -> Vec<DnfTransition> {
    let mut transitions = Vec::new();
    let leader_lap = session.leader_lap() as i64;

    if let Some(pit) = session.pits.get(&driver_number) {
        if pit.in_pit {
            if let Some(entry_lap) = pit.pit_entry_leader_lap {
                if leader_lap - entry_lap >= PIT_TIMEOUT_LAPS && !session.is_retired(driver_number) {
                    session.mark_timeout_dnf(driver_number);
                    transitions.push(DnfTransition { driver_number, kind: DnfKind::PitTimeout, retired: true });
                }
            }
        }
    }

    if let Some(&stall_lap) = session.track_stalls.get(&driver_number) {
        let in_pit = session.pits.get(&driver_number).map(|p| p.in_pit).unwrap_or(false);
        let red_flag = session.active_red_flag.unwrap_or(false);
        if !in_pit && !red_flag && leader_lap - stall_lap >= 1 && !session.is_retired(driver_number) {
            session.mark_timeout_dnf(driver_number);
            transitions.push(DnfTransition { driver_number, kind: DnfKind::TrackStall, retired: true });
        }
    }

    transitions
}

/// Runs on every car-telemetry/pit update for `driver` (§4.5): records
/// track-stall onset, and reverses timeout DNFs once the driver is moving
/// again.
pub fn on_telemetry_update(session: &mut Session, driver_number: u32, speed: Option<f64>) -> Option<DnfTransition> {
    let Some(speed) = speed else { return None };
    let in_pit = session.pits.get(&driver_number).map(|p| p.in_pit).unwrap_or(false);
    let red_flag = session.active_red_flag.unwrap_or(false);

    if !in_pit && !red_flag && speed <= TRACK_STALL_SPEED_KMH {
        session.track_stalls.entry(driver_number).or_insert_with(|| session_leader_lap_snapshot(session));
        return None;
    }

    let mut transitioned = None;
    if speed > TRACK_STALL_SPEED_KMH {
        session.track_stalls.remove(&driver_number);
    }
    if in_pit && speed > PIT_EXIT_SPEED_KMH && session.timeout_dnf_drivers.contains(&driver_number) {
        session.reverse_timeout_dnf(driver_number);
        transitioned = Some(DnfTransition { driver_number, kind: DnfKind::PitTimeout, retired: false });
    } else if !in_pit && speed > TRACK_STALL_SPEED_KMH && session.timeout_dnf_drivers.contains(&driver_number) {
        session.reverse_timeout_dnf(driver_number);
        transitioned = Some(DnfTransition { driver_number, kind: DnfKind::TrackStall, retired: false });
    }
    transitioned
}

fn session_leader_lap_snapshot(session: &Session) -> i64 {
    session.leader_lap() as i64
}

/// A race-control message that upgrades a reversible timeout DNF to a
/// permanent one, or declares a fresh DNF outright (§4.5).
pub fn apply_race_control_retirement(session: &mut Session, driver_number: u32, message: &str) {
    let lower = message.to_lowercase();
    if lower.contains("retired") || lower.contains("stopped") {
        session.mark_race_control_dnf(driver_number);
    }
}

/// Truncates a lap's in-progress segment arrays for replay mode (§4.5, §8
/// property 4): segments in sectors not yet reached are zeroed; the current
/// sector's segments are lit up to `ceil(fractionInSector * len)`.
pub fn truncate_segments(
    progress: f64,
    boundaries: &SectorBoundaries,
    segments_1: &[i32],
    segments_2: &[i32],
    segments_3: &[i32],
) -> (Vec<i32>, Vec<i32>, Vec<i32>) {
    let (current_sector, fraction) = sector_fraction(progress, boundaries);

    let apply = |sector: u8, segments: &[i32]| -> Vec<i32> {
        if sector < current_sector {
            segments.to_vec()
        } else if sector > current_sector {
            vec![0; segments.len()]
        } else {
            let lit = (fraction * segments.len() as f64).ceil() as usize;
            segments
                .iter()
                .enumerate()
                .map(|(i, v)| if i < lit { *v } else { 0 })
                .collect()
        }
    };

    (apply(1, segments_1), apply(2, segments_2), apply(3, segments_3))
}

/// Detects the lap-counter transition window (§4.5): `Δt < 1500ms` since the
/// current lap started, with high lap-relative progress, means GPS hasn't
/// settled yet and all segments should be zeroed instead of truncated.
pub fn is_mid_lap_transition(time_since_lap_start: Duration, progress_within_lap: f64) -> bool {
    time_since_lap_start < LAP_TRANSITION_WINDOW && progress_within_lap > LAP_TRANSITION_PROGRESS_THRESHOLD
}

fn tyre_age_from(stint: Option<&Stint>, current_lap: u32) -> u32 {
    let Some(stint) = stint else { return 0 };
    if let Some(total) = stint.total_laps {
        return total;
    }
    current_lap.saturating_sub(stint.lap_start) + stint.tyre_age_at_start
}

/// Computes the full `DriverLiveState` array for the driver-state batcher
/// tick (§4.5), reading only from the published [`SessionSnapshot`] — the
/// batcher never touches the live `Session` (§5). `replay_mode` gates
/// segment truncation; live mode passes upstream-delivered segment arrays
/// straight through.
pub fn compute_driver_states(
    snapshot: &SessionSnapshot,
    replay_mode: bool,
    lap_transitioning: &std::collections::HashSet<u32>,
) -> Vec<DriverLiveState> {
    let current_lap: std::collections::HashMap<u32, u32> = snapshot.current_lap.iter().copied().collect();
    let current_position: std::collections::HashMap<u32, Point> = snapshot.current_position.iter().copied().collect();
    let stints: std::collections::HashMap<u32, &Stint> = snapshot.stints.iter().map(|(k, v)| (*k, v)).collect();
    let pits: std::collections::HashMap<u32, &Pit> = snapshot.pits.iter().map(|(k, v)| (*k, v)).collect();
    let car_telemetry: std::collections::HashMap<u32, CarTelemetry> = snapshot.car_telemetry.iter().copied().collect();
    let completed_laps: std::collections::HashMap<LapKey, &Lap> = snapshot.completed_laps.iter().map(|(k, v)| (*k, v)).collect();
    let current_lap_partial: std::collections::HashMap<u32, &Lap> = snapshot.current_lap_partial.iter().map(|(k, v)| (*k, v)).collect();
    let dnfs: std::collections::HashSet<u32> = snapshot.dnfs.iter().copied().collect();

    let mut states: Vec<DriverLiveState> = Vec::with_capacity(snapshot.drivers.len());

    for &(driver_number, _) in &snapshot.drivers {
        let lap = current_lap.get(&driver_number).copied().unwrap_or(0);
        let last_lap = completed_laps
            .get(&LapKey { driver_number, lap_number: lap.saturating_sub(1) })
            .or_else(|| completed_laps.get(&LapKey { driver_number, lap_number: lap }))
            .map(|l| (*l).clone());

        // §4.5: live mode reads the in-progress lap's own segments (delivered
        // progressively ahead of `duration`); only replay mode falls back to
        // the previous completed lap, since the replay queue carries no
        // separate partial-lap channel and reconstructs position instead.
        let (mut segments_1, mut segments_2, mut segments_3) = if replay_mode {
            last_lap
                .as_ref()
                .map(|l| (l.segments_1.clone(), l.segments_2.clone(), l.segments_3.clone()))
                .unwrap_or_default()
        } else {
            current_lap_partial
                .get(&driver_number)
                .map(|l| (l.segments_1.clone(), l.segments_2.clone(), l.segments_3.clone()))
                .unwrap_or_default()
        };

        if replay_mode {
            if lap_transitioning.contains(&driver_number) {
                segments_1.iter_mut().for_each(|v| *v = 0);
                segments_2.iter_mut().for_each(|v| *v = 0);
                segments_3.iter_mut().for_each(|v| *v = 0);
            } else if let (Some(boundaries), Some(position)) =
                (snapshot.sector_boundaries, current_position.get(&driver_number))
            {
                if let Some(crate::geometry::path::Projection { progress, .. }) =
                    crate::geometry::path::project(&snapshot.baseline_path, &snapshot.baseline_arc, *position, None)
                {
                    let (s1, s2, s3) = truncate_segments(progress, &boundaries, &segments_1, &segments_2, &segments_3);
                    segments_1 = s1;
                    segments_2 = s2;
                    segments_3 = s3;
                }
            }
        }

        let stint = stints.get(&driver_number).copied();
        states.push(DriverLiveState {
            driver_number,
            position: current_position.get(&driver_number).copied(),
            lap,
            last_lap,
            segments_1,
            segments_2,
            segments_3,
            tyre_compound: stint.map(|s| s.compound.clone()),
            tyre_age: tyre_age_from(stint, lap),
            in_pit: pits.get(&driver_number).map(|p| p.in_pit).unwrap_or(false),
            pit_count: pits.get(&driver_number).map(|p| p.count).unwrap_or(0),
            telemetry: car_telemetry.get(&driver_number).copied().unwrap_or_default(),
            retired: dnfs.contains(&driver_number),
        });
    }

    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn session() -> Session {
        Session::new(1, None, "Spa".into(), SessionType::Race, "Race".into(), Utc.with_ymd_and_hms(2026, 7, 27, 14, 0, 0).unwrap())
    }

    /// S4: sectorBoundaries={0.00,0.33,0.66}, progress 0.50, 8 segments per
    /// sector: sector1 untouched, sector2 lit to ceil((0.50-0.33)/0.33*8)=5,
    /// sector3 all zero.
    #[test]
    fn scenario_s4_segment_truncation_in_replay() {
        let boundaries = SectorBoundaries { start_finish: 0.0, sector_1_2: 0.33, sector_2_3: 0.66 };
        let seg = vec![1; 8];
        let (s1, s2, s3) = truncate_segments(0.50, &boundaries, &seg, &seg, &seg);
        assert_eq!(s1, vec![1; 8]);
        let lit = s2.iter().filter(|v| **v != 0).count();
        assert_eq!(lit, 5);
        assert_eq!(s3, vec![0; 8]);
    }

    /// §8 property 4: segments in sectors not yet entered are all zero.
    #[test]
    fn property_segments_ahead_of_progress_are_zero() {
        let boundaries = SectorBoundaries { start_finish: 0.0, sector_1_2: 0.33, sector_2_3: 0.66 };
        let seg = vec![7; 4];
        let (_, _, s3) = truncate_segments(0.10, &boundaries, &seg, &seg, &seg);
        assert!(s3.iter().all(|v| *v == 0));
    }

    /// §4.5: live mode shows the in-progress lap's own progressively
    /// delivered segments, not the previous completed lap's.
    #[test]
    fn live_mode_sources_segments_from_current_lap_partial_not_last_lap() {
        let mut s = session();
        s.drivers.insert(44, DriverInfo { acronym: "HAM".into(), full_name: "".into(), team: "".into(), team_colour: "".into(), headshot_url: None });
        s.set_current_lap(44, 2);
        s.upsert_completed_lap(
            44,
            1,
            Lap { duration: 90.0, segments_1: vec![9; 4], ..Default::default() },
        );
        s.merge_current_lap_partial(44, 2, |partial| partial.segments_1 = vec![1; 4]);

        let snapshot = SessionSnapshot::from(&s);
        let states = compute_driver_states(&snapshot, false, &std::collections::HashSet::new());
        let hamilton = states.iter().find(|d| d.driver_number == 44).unwrap();
        assert_eq!(hamilton.segments_1, vec![1; 4]);
        assert_eq!(hamilton.last_lap.as_ref().unwrap().segments_1, vec![9; 4]);
    }

    /// S5: pit timeout at leaderLap=10 entry, leader advances to 12 -> DNF;
    /// then speed rises above pit-exit threshold -> reversed.
    #[test]
    fn scenario_s5_pit_timeout_and_reversal() {
        let mut s = session();
        s.drivers.insert(77, DriverInfo { acronym: "BOT".into(), full_name: "".into(), team: "".into(), team_colour: "".into(), headshot_url: None });
        s.pits.insert(77, Pit { count: 1, last_duration: None, in_pit: true, entry_position: None, pit_entry_leader_lap: Some(10), accumulated_pit_lane_positions: vec![] });
        s.set_current_lap(1, 12); // some other driver is the leader
        let transitions = on_lap_completed(&mut s, 77);
        assert_eq!(transitions.len(), 1);
        assert!(s.is_retired(77));

        let transition = on_telemetry_update(&mut s, 77, Some(15.0));
        assert!(transition.is_some());
        assert!(!s.is_retired(77));
    }

    /// §8 boundary: pit-timeout exactly at `leaderLap - entryLeaderLap == 2`
    /// triggers DNF; at 1 does not.
    #[test]
    fn boundary_pit_timeout_exact_threshold() {
        let mut s = session();
        s.pits.insert(77, Pit { count: 0, last_duration: None, in_pit: true, entry_position: None, pit_entry_leader_lap: Some(10), accumulated_pit_lane_positions: vec![] });
        s.set_current_lap(1, 11);
        assert!(on_lap_completed(&mut s, 77).is_empty());
        s.set_current_lap(1, 12);
        assert!(!on_lap_completed(&mut s, 77).is_empty());
    }

    #[test]
    fn track_stall_triggers_after_one_leader_lap_and_reverses_on_move() {
        let mut s = session();
        s.pits.insert(44, Pit::default());
        s.set_current_lap(1, 5);
        on_telemetry_update(&mut s, 44, Some(2.0)); // stalls at leader lap 5
        assert!(!s.is_retired(44));
        s.set_current_lap(1, 6);
        let transitions = on_lap_completed(&mut s, 44);
        assert_eq!(transitions.len(), 1);
        assert!(s.is_retired(44));

        let reversal = on_telemetry_update(&mut s, 44, Some(50.0));
        assert!(reversal.is_some());
        assert!(!s.is_retired(44));
    }

    /// §8 property 6: race-control retirements are never reversed by a
    /// subsequent timeout path.
    #[test]
    fn race_control_retirement_upgrades_to_permanent() {
        let mut s = session();
        s.mark_timeout_dnf(44);
        apply_race_control_retirement(&mut s, 44, "CAR 44 RETIRED");
        on_telemetry_update(&mut s, 44, Some(200.0));
        assert!(s.is_retired(44));
    }
}
