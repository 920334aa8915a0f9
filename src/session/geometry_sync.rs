//! Wires the pure geometry algorithms (`crate::geometry::*`) to the
//! authoritative `Session` (§4.4). Invoked by the writer after every
//! lap-completion event: recomputes the baseline centerline, sector
//! boundaries, and pit-lane profile from the laps/positions collected so
//! far. Each step follows the failure policy in §4.4 — a step that can't
//! produce a valid output leaves the prior result untouched.
use crate::config::{
    CENTERLINE_OUTLIER_THRESHOLD, CENTERLINE_SMOOTHING_RADIUS, CENTERLINE_TARGET_POINTS,
    LAYOUT_CHANGE_BBOX_THRESHOLD, LAYOUT_CHANGE_RESIDUAL_THRESHOLD,
};
use crate::geometry::path::{build_centerline, layout_changed};
use crate::geometry::pitlane::{aggregate_profile, default_speed_limit};
use crate::geometry::sectors::{estimate_sector_boundaries, FastLapObservation};

use super::state::Session;
use super::types::{Point, PitLaneSample};

/// Recomputes the baseline centerline from every fast lap's GPS trace (§4.4:
/// "invoked incrementally on each completed lap that is a fast lap"). A
/// trace qualifies when its lap is fast (`Lap::is_fast`) and position
/// history for that (driver, lap) is non-empty. Regenerates rather than
/// refines once `layout_changed` trips past the conservative threshold;
/// otherwise always takes the freshly built candidate, since a fast lap
/// completing is itself the trigger for "more/better data is now available".
pub fn rebuild_track(session: &mut Session) -> bool {
    let Some(best) = session.session_best_lap else { return false };

    let mut traces: Vec<Vec<Point>> = Vec::new();
    for (key, lap) in &session.completed_laps {
        if !lap.is_fast(best) {
            continue;
        }
        let Some(by_lap) = session.position_history.get(&key.driver_number) else { continue };
        let Some(samples) = by_lap.get(&key.lap_number) else { continue };
        if samples.len() < 2 {
            continue;
        }
        traces.push(samples.iter().map(|s| s.point()).collect());
    }
    if traces.is_empty() {
        return false;
    }

    let Some(candidate) = build_centerline(
        &traces,
        CENTERLINE_TARGET_POINTS,
        CENTERLINE_OUTLIER_THRESHOLD,
        CENTERLINE_SMOOTHING_RADIUS,
    ) else {
        return false;
    };

    if !session.baseline_path.is_empty()
        && !layout_changed(
            &session.baseline_path,
            &candidate,
            LAYOUT_CHANGE_BBOX_THRESHOLD,
            LAYOUT_CHANGE_RESIDUAL_THRESHOLD,
        )
    {
        // No meaningful change; still counts as processed for reporting.
        session.total_laps_processed += 1;
        return false;
    }

    session.set_baseline_path(candidate);
    session.total_laps_processed += 1;
    true
}

/// Recomputes `{startFinish, sector1_2, sector2_3}` from every fast lap that
/// carries all three sector times, using lap-relative GPS traces derived
/// from `position_history` and `Lap::date_start` (§4.4). Requires a
/// non-empty baseline to project against.
pub fn rebuild_sector_boundaries(session: &mut Session) -> bool {
    if session.baseline_path.is_empty() {
        return false;
    }
    let Some(best) = session.session_best_lap else { return false };

    let mut traces: Vec<(f64, f64, f64, Vec<(f64, Point)>)> = Vec::new();
    for (key, lap) in &session.completed_laps {
        if !lap.is_fast(best) {
            continue;
        }
        let (Some(s1), Some(s2)) = (lap.sector_1, lap.sector_2) else { continue };
        let Some(start) = lap.date_start else { continue };
        let Some(by_lap) = session.position_history.get(&key.driver_number) else { continue };
        let Some(samples) = by_lap.get(&key.lap_number) else { continue };
        if samples.is_empty() {
            continue;
        }
        let trace: Vec<(f64, Point)> = samples
            .iter()
            .map(|s| ((s.timestamp - start).num_milliseconds() as f64 / 1000.0, s.point()))
            .collect();
        traces.push((lap.duration, s1, s2, trace));
    }
    if traces.is_empty() {
        return false;
    }

    let observations: Vec<FastLapObservation> = traces
        .iter()
        .map(|(duration, s1, s2, trace)| FastLapObservation {
            lap_duration: *duration,
            sector_1: *s1,
            sector_2: *s2,
            trace: trace.as_slice(),
        })
        .collect();

    match estimate_sector_boundaries(&observations, &session.baseline_path, &session.baseline_arc) {
        Some(boundaries) => {
            session.sector_boundaries = Some(boundaries);
            true
        }
        None => false,
    }
}

/// Folds one completed pit stop's recorded positions/speeds into the
/// pit-lane profile aggregator (§4.4). `samples` accumulates across the
/// session; the profile is only assigned once at least three samples have
/// been collected (`aggregate_profile`'s own threshold).
pub fn record_pit_stop(
    session: &mut Session,
    samples: &mut Vec<PitLaneSample>,
    positions: &[Point],
    speeds: &[f64],
) -> bool {
    if session.baseline_path.is_empty() {
        return false;
    }
    let limit = session
        .pit_lane_profile
        .map(|p| p.pit_lane_speed_limit)
        .unwrap_or_else(default_speed_limit);
    let margin = crate::geometry::pitlane::default_margin();

    let Some(sample) = crate::geometry::pitlane::sample_from_stop(
        positions,
        speeds,
        &session.baseline_path,
        &session.baseline_arc,
        limit,
        margin,
    ) else {
        return false;
    };
    samples.push(sample);

    match aggregate_profile(samples, &session.baseline_path, &session.baseline_arc, Some(limit)) {
        Some(profile) => {
            session.pit_lane_profile = Some(profile);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{Lap, SessionType};
    use chrono::{TimeZone, Utc};

    fn session_with_square_traces() -> Session {
        let mut s = Session::new(1, None, "Spa".into(), SessionType::Race, "Race".into(), Utc.with_ymd_and_hms(2026, 7, 27, 16, 0, 0).unwrap());
        s.session_best_lap = Some(80.0);
        let start = Utc.with_ymd_and_hms(2026, 7, 27, 14, 0, 0).unwrap();
        let corners = [
            Point { x: 0.0, y: 0.0 },
            Point { x: 100.0, y: 0.0 },
            Point { x: 100.0, y: 100.0 },
            Point { x: 0.0, y: 100.0 },
            Point { x: 0.0, y: 0.0 },
        ];
        for driver in [1u32, 2u32] {
            s.upsert_completed_lap(
                driver,
                1,
                Lap {
                    duration: 80.0,
                    sector_1: Some(26.0),
                    sector_2: Some(27.0),
                    sector_3: Some(27.0),
                    segments_1: vec![],
                    segments_2: vec![],
                    segments_3: vec![],
                    i1_speed: None,
                    i2_speed: None,
                    st_speed: None,
                    is_pit_out_lap: false,
                    date_start: Some(start),
                },
            );
            let by_lap = s.position_history.entry(driver).or_default().entry(1).or_default();
            for (i, p) in corners.iter().enumerate() {
                by_lap.push(crate::session::types::PositionSample {
                    x: p.x,
                    y: p.y,
                    timestamp: start + chrono::Duration::seconds(i as i64 * 20),
                });
            }
        }
        s
    }

    #[test]
    fn rebuild_track_populates_baseline_from_fast_laps() {
        let mut s = session_with_square_traces();
        assert!(rebuild_track(&mut s));
        assert!(!s.baseline_path.is_empty());
        assert_eq!(s.baseline_path.first(), s.baseline_path.last());
    }

    #[test]
    fn rebuild_track_no_op_without_fast_laps() {
        let mut s = Session::new(1, None, "Spa".into(), SessionType::Race, "Race".into(), Utc::now());
        assert!(!rebuild_track(&mut s));
    }

    #[test]
    fn rebuild_sector_boundaries_requires_existing_baseline() {
        let mut s = session_with_square_traces();
        assert!(!rebuild_sector_boundaries(&mut s)); // no baseline yet
        rebuild_track(&mut s);
        assert!(rebuild_sector_boundaries(&mut s));
        assert!(s.sector_boundaries.is_some());
    }
}
