//! Sector-boundary estimation from completed fast laps with GPS traces
//! (§4.4).
use crate::session::types::{Point, SectorBoundaries};

use super::path::{self, Projection};

/// One driver's fast-lap sector-time fractions plus their GPS trace, used to
/// estimate where sector 1→2 and 2→3 crossings happen on the reference path.
pub struct FastLapObservation<'a> {
    pub lap_duration: f64,
    pub sector_1: f64,
    pub sector_2: f64,
    pub trace: &'a [(f64, Point)], // (seconds into lap, position)
}

fn position_at_fraction(trace: &[(f64, Point)], lap_duration: f64, fraction: f64) -> Option<Point> {
    if trace.is_empty() || lap_duration <= 0.0 {
        return None;
    }
    let target_t = fraction * lap_duration;
    let mut best: Option<(f64, Point)> = None;
    for &(t, p) in trace {
        let d = (t - target_t).abs();
        if best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, p));
        }
    }
    best.map(|(_, p)| p)
}

/// Estimates `{startFinish, sector1_2, sector2_3}` by projecting each
/// driver's sector-crossing GPS fix onto the reference path and averaging
/// the resulting progress values (§4.4). Returns `None` if no observation
/// could be projected, per the "leave prior result unchanged" failure policy.
pub fn estimate_sector_boundaries(
    observations: &[FastLapObservation],
    reference_path: &[Point],
    reference_arc: &[f64],
) -> Option<SectorBoundaries> {
    let mut s1_2_progress = Vec::new();
    let mut s2_3_progress = Vec::new();

    for obs in observations {
        let frac_1_2 = obs.sector_1 / obs.lap_duration;
        let frac_2_3 = (obs.sector_1 + obs.sector_2) / obs.lap_duration;

        if let Some(p) = position_at_fraction(obs.trace, obs.lap_duration, frac_1_2) {
            if let Some(Projection { progress, .. }) = path::project(reference_path, reference_arc, p, None) {
                s1_2_progress.push(progress);
            }
        }
        if let Some(p) = position_at_fraction(obs.trace, obs.lap_duration, frac_2_3) {
            if let Some(Projection { progress, .. }) = path::project(reference_path, reference_arc, p, None) {
                s2_3_progress.push(progress);
            }
        }
    }

    if s1_2_progress.is_empty() || s2_3_progress.is_empty() {
        return None;
    }

    Some(SectorBoundaries {
        start_finish: 0.0,
        sector_1_2: circular_mean(&s1_2_progress),
        sector_2_3: circular_mean(&s2_3_progress),
    })
}

/// Which sector (1, 2, or 3) `progress` falls in given `boundaries`, and how
/// far through that sector the car is, as a fraction in `[0, 1)`. Used by
/// the segment-truncation logic (§4.5, §8 property 4).
pub fn sector_fraction(progress: f64, boundaries: &SectorBoundaries) -> (u8, f64) {
    let d1 = path::forward_distance(boundaries.start_finish, boundaries.sector_1_2);
    let d2 = path::forward_distance(boundaries.sector_1_2, boundaries.sector_2_3);
    let d3 = path::forward_distance(boundaries.sector_2_3, boundaries.start_finish);

    let from_sf = path::forward_distance(boundaries.start_finish, progress);
    if from_sf < d1 {
        (1, if d1 > 0.0 { from_sf / d1 } else { 0.0 })
    } else if from_sf < d1 + d2 {
        let into = from_sf - d1;
        (2, if d2 > 0.0 { into / d2 } else { 0.0 })
    } else {
        let into = from_sf - d1 - d2;
        (3, if d3 > 0.0 { into / d3 } else { 0.0 })
    }
}

/// Mean of progress values in `[0,1)`, treating the range as circular so
/// crossings near the start/finish line (wrapping from ~0.99 to ~0.01) don't
/// average to ~0.5.
fn circular_mean(values: &[f64]) -> f64 {
    let (sum_sin, sum_cos) = values.iter().fold((0.0, 0.0), |(s, c), v| {
        let theta = v * std::f64::consts::TAU;
        (s + theta.sin(), c + theta.cos())
    });
    let mean_theta = sum_sin.atan2(sum_cos);
    (mean_theta / std::f64::consts::TAU).rem_euclid(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_mean_handles_wraparound() {
        let mean = circular_mean(&[0.98, 0.01, 0.02]);
        assert!(mean < 0.05 || mean > 0.95);
    }

    #[test]
    fn no_observations_returns_none() {
        let path = vec![Point { x: 0.0, y: 0.0 }, Point { x: 1.0, y: 0.0 }];
        let arc = super::path::arc_length_table(&path);
        assert!(estimate_sector_boundaries(&[], &path, &arc).is_none());
    }
}
