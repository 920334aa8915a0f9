//! Pit-lane profile derivation from observed pit stops (§4.4).
use crate::session::types::{PitLaneProfile, PitLaneSample, PitSide, Point};

use super::path::{self, Projection};

const DEFAULT_SPEED_LIMIT: f64 = 80.0;
const DEFAULT_MARGIN: f64 = 5.0;
const MIN_SAMPLES_TO_AGGREGATE: usize = 3;
const SIDE_DOMINANCE_THRESHOLD: f64 = 0.6;

/// Builds a [`PitLaneSample`] from one completed pit stop's recorded
/// positions. `speeds` is parallel to `positions`. Tight entry/exit GPS is
/// the first/last position with `10 < speed <= limit + margin` (§4.4).
pub fn sample_from_stop(
    positions: &[Point],
    speeds: &[f64],
    centerline: &[Point],
    centerline_arc: &[f64],
    limit: f64,
    margin: f64,
) -> Option<PitLaneSample> {
    if positions.len() != speeds.len() || positions.is_empty() {
        return None;
    }
    let in_window: Vec<usize> = (0..positions.len())
        .filter(|&i| speeds[i] > 10.0 && speeds[i] <= limit + margin)
        .collect();
    let &first = in_window.first()?;
    let &last = in_window.last()?;

    let side_vote = vote_side(positions, centerline, centerline_arc)?;

    Some(PitLaneSample {
        entry_point: positions[first],
        exit_point: positions[last],
        side_vote,
        positions: positions.to_vec(),
    })
}

/// Distance-weighted sign of the cross-product between the centerline
/// tangent and the vector from the centerline to the car, summed across the
/// stop's positions, to vote which side of the track the pit lane is on
/// (§4.4). Positive votes right, negative votes left.
fn vote_side(positions: &[Point], centerline: &[Point], centerline_arc: &[f64]) -> Option<f64> {
    if positions.is_empty() || centerline.len() < 2 {
        return None;
    }
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for p in positions {
        let Projection { progress, residual } = path::project(centerline, centerline_arc, *p, None)?;
        let idx = ((progress * centerline.len() as f64) as usize).min(centerline.len() - 2);
        let a = centerline[idx];
        let b = centerline[(idx + 1) % centerline.len()];
        let tangent = Point { x: b.x - a.x, y: b.y - a.y };
        let to_car = Point { x: p.x - a.x, y: p.y - a.y };
        let cross = tangent.x * to_car.y - tangent.y * to_car.x;
        let weight = 1.0 / (1.0 + residual);
        weighted_sum += cross.signum() * weight;
        weight_total += weight;
    }
    if weight_total <= 0.0 {
        None
    } else {
        Some(weighted_sum / weight_total)
    }
}

/// Aggregates accumulated pit-lane samples into a profile once at least
/// three have been collected (§4.4): entry/exit progress as medians, side by
/// weighted majority (accepted only if dominance >= 60%).
pub fn aggregate_profile(
    samples: &[PitLaneSample],
    centerline: &[Point],
    centerline_arc: &[f64],
    detected_speed_limit: Option<f64>,
) -> Option<PitLaneProfile> {
    if samples.len() < MIN_SAMPLES_TO_AGGREGATE {
        return None;
    }

    let mut entry_progress = Vec::new();
    let mut exit_progress = Vec::new();
    let mut positive_votes = 0.0;
    let mut negative_votes = 0.0;

    for s in samples {
        if let Some(Projection { progress, .. }) = path::project(centerline, centerline_arc, s.entry_point, None) {
            entry_progress.push(progress);
        }
        if let Some(Projection { progress, .. }) = path::project(centerline, centerline_arc, s.exit_point, None) {
            exit_progress.push(progress);
        }
        if s.side_vote >= 0.0 {
            positive_votes += s.side_vote.abs();
        } else {
            negative_votes += s.side_vote.abs();
        }
    }

    if entry_progress.is_empty() || exit_progress.is_empty() {
        return None;
    }

    let total_votes = positive_votes + negative_votes;
    if total_votes <= 0.0 {
        return None;
    }
    let (side, dominance) = if positive_votes >= negative_votes {
        (PitSide::Right, positive_votes / total_votes)
    } else {
        (PitSide::Left, negative_votes / total_votes)
    };
    if dominance < SIDE_DOMINANCE_THRESHOLD {
        return None;
    }

    Some(PitLaneProfile {
        entry_progress: median(&mut entry_progress),
        exit_progress: median(&mut exit_progress),
        pit_side: side,
        pit_lane_speed_limit: detected_speed_limit.unwrap_or(DEFAULT_SPEED_LIMIT),
        samples_collected: samples.len() as u32,
    })
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

pub fn default_margin() -> f64 {
    DEFAULT_MARGIN
}

pub fn default_speed_limit() -> f64 {
    DEFAULT_SPEED_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_path() -> (Vec<Point>, Vec<f64>) {
        let path = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 10.0, y: 0.0 },
            Point { x: 10.0, y: 10.0 },
            Point { x: 0.0, y: 10.0 },
            Point { x: 0.0, y: 0.0 },
        ];
        let arc = path::arc_length_table(&path);
        (path, arc)
    }

    #[test]
    fn sample_from_stop_picks_tight_speed_window() {
        let (path, arc) = square_path();
        let positions = vec![
            Point { x: 1.0, y: 0.5 },
            Point { x: 3.0, y: 0.5 },
            Point { x: 5.0, y: 0.5 },
            Point { x: 7.0, y: 0.5 },
        ];
        let speeds = vec![5.0, 40.0, 50.0, 5.0];
        let sample = sample_from_stop(&positions, &speeds, &path, &arc, 80.0, 5.0).unwrap();
        assert_eq!(sample.entry_point.x, 3.0);
        assert_eq!(sample.exit_point.x, 5.0);
    }

    #[test]
    fn fewer_than_three_samples_yields_none() {
        let (path, arc) = square_path();
        let samples = vec![PitLaneSample {
            entry_point: Point { x: 1.0, y: 0.5 },
            exit_point: Point { x: 5.0, y: 0.5 },
            side_vote: 1.0,
            positions: vec![],
        }];
        assert!(aggregate_profile(&samples, &path, &arc, None).is_none());
    }
}
