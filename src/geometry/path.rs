//! Pure geometry over `(positions, path) -> path'` and `(path) -> arcLength[]`
//! (DESIGN NOTES §9): track centerline construction, arc-length tables, and
//! track-progress projection. Unit-testable without any session scaffolding.
use crate::session::types::{Path, Point};

/// §3 invariant / §8 property 8: arc-length table length equals path length
/// and is strictly non-decreasing (distance between distinct points is > 0;
/// coincident points contribute 0, which is only non-decreasing, not
/// strictly increasing — callers that need strict monotonicity dedupe first).
pub fn arc_length_table(path: &[Point]) -> Vec<f64> {
    if path.is_empty() {
        return Vec::new();
    }
    let mut arc = Vec::with_capacity(path.len());
    arc.push(0.0);
    for i in 1..path.len() {
        let d = path[i - 1].distance(&path[i]);
        arc.push(arc[i - 1] + d);
    }
    arc
}

/// Total perimeter of a closed path (last arc-length entry).
pub fn perimeter(arc: &[f64]) -> f64 {
    arc.last().copied().unwrap_or(0.0)
}

/// Removes GPS points that sit far from the trace's local trend: any point
/// whose distance to the midpoint of its neighbours exceeds `threshold` is
/// dropped. Operates per-trace prior to seed selection (§4.4).
pub fn remove_outliers(trace: &[Point], threshold: f64) -> Vec<Point> {
    if trace.len() < 3 {
        return trace.to_vec();
    }
    let mut out = Vec::with_capacity(trace.len());
    out.push(trace[0]);
    for i in 1..trace.len() - 1 {
        let mid = Point {
            x: (trace[i - 1].x + trace[i + 1].x) / 2.0,
            y: (trace[i - 1].y + trace[i + 1].y) / 2.0,
        };
        if trace[i].distance(&mid) <= threshold {
            out.push(trace[i]);
        }
    }
    out.push(trace[trace.len() - 1]);
    out
}

/// Picks the trace with the most points after outlier removal as the seed
/// for the centerline build (§4.4: "pick the single best trace as seed").
pub fn pick_best_trace(traces: &[Vec<Point>], outlier_threshold: f64) -> Option<Vec<Point>> {
    traces
        .iter()
        .map(|t| remove_outliers(t, outlier_threshold))
        .max_by_key(|t| t.len())
        .filter(|t| t.len() >= 2)
}

/// Downsamples a trace to approximately `target` evenly arc-spaced points.
fn downsample(trace: &[Point], target: usize) -> Vec<Point> {
    if trace.len() <= target || target < 2 {
        return trace.to_vec();
    }
    let arc = arc_length_table(trace);
    let total = perimeter(&arc);
    if total <= 0.0 {
        return trace.to_vec();
    }
    let mut out = Vec::with_capacity(target);
    for i in 0..target {
        let d = total * (i as f64) / (target as f64);
        out.push(point_at_distance(trace, &arc, d));
    }
    out
}

/// Simple moving-average smoothing over a closed path, window `radius` on
/// each side, wrapping around the loop.
fn smooth(path: &[Point], radius: usize) -> Vec<Point> {
    if path.len() < 3 || radius == 0 {
        return path.to_vec();
    }
    let n = path.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut count = 0.0;
        for k in -(radius as isize)..=(radius as isize) {
            let idx = ((i as isize + k).rem_euclid(n as isize)) as usize;
            sx += path[idx].x;
            sy += path[idx].y;
            count += 1.0;
        }
        out.push(Point { x: sx / count, y: sy / count });
    }
    out
}

fn point_at_distance(path: &[Point], arc: &[f64], distance: f64) -> Point {
    if path.is_empty() {
        return Point { x: 0.0, y: 0.0 };
    }
    if path.len() == 1 {
        return path[0];
    }
    let total = perimeter(arc);
    let d = distance.rem_euclid(total.max(f64::MIN_POSITIVE));
    for i in 1..arc.len() {
        if d <= arc[i] {
            let seg_len = (arc[i] - arc[i - 1]).max(f64::MIN_POSITIVE);
            let t = (d - arc[i - 1]) / seg_len;
            return Point {
                x: path[i - 1].x + (path[i].x - path[i - 1].x) * t,
                y: path[i - 1].y + (path[i].y - path[i - 1].y) * t,
            };
        }
    }
    *path.last().unwrap()
}

/// Builds a closed baseline centerline from a collection of fast-lap traces
/// (§4.4): outlier removal, seed selection, downsampling, smoothing, and an
/// exact closure snap. Returns `None` (leaving the prior result unchanged
/// per the failure policy in §4.4) when no trace is usable.
pub fn build_centerline(traces: &[Vec<Point>], target_points: usize, outlier_threshold: f64, smoothing_radius: usize) -> Option<Path> {
    let seed = pick_best_trace(traces, outlier_threshold)?;
    let downsampled = downsample(&seed, target_points);
    if downsampled.len() < 3 {
        return None;
    }
    let mut smoothed = smooth(&downsampled, smoothing_radius);
    let first = smoothed[0];
    let last = smoothed.len() - 1;
    smoothed[last] = first;
    Some(smoothed)
}

/// Result of projecting a point onto a closed path: the fractional track
/// progress in `[0, 1)` and the perpendicular distance to the path (used by
/// callers that want a projection-quality signal).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub progress: f64,
    pub residual: f64,
}

const HINT_WINDOW_FRACTION: f64 = 0.15;

/// Projects `(x, y)` onto the closed path and returns track progress (§4.4).
/// `hint` narrows the search window to ±15% of the perimeter around a
/// previous progress to avoid ambiguity on parallel sections (e.g. pit
/// straight next to the main straight).
pub fn project(path: &[Point], arc: &[f64], target: Point, hint: Option<f64>) -> Option<Projection> {
    if path.len() < 2 || arc.len() != path.len() {
        return None;
    }
    let total = perimeter(arc);
    if total <= 0.0 {
        return None;
    }

    let segment_range: Box<dyn Iterator<Item = usize>> = match hint {
        Some(h) => {
            let n = path.len();
            let window = (HINT_WINDOW_FRACTION * n as f64).ceil() as isize;
            let center_idx = progress_to_index(arc, total, h);
            Box::new((-(window)..=window).map(move |k| {
                ((center_idx as isize + k).rem_euclid(n as isize)) as usize
            }))
        }
        None => Box::new(0..path.len() - 1),
    };

    let mut best: Option<(f64, f64)> = None; // (progress, residual)
    for i in segment_range {
        if i + 1 >= path.len() {
            continue;
        }
        let a = path[i];
        let b = path[i + 1];
        let seg = Point { x: b.x - a.x, y: b.y - a.y };
        let seg_len_sq = seg.x * seg.x + seg.y * seg.y;
        let t = if seg_len_sq > f64::MIN_POSITIVE {
            (((target.x - a.x) * seg.x + (target.y - a.y) * seg.y) / seg_len_sq).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let proj = Point { x: a.x + seg.x * t, y: a.y + seg.y * t };
        let residual = target.distance(&proj);
        let seg_len = arc[i + 1] - arc[i];
        let progress = (arc[i] + seg_len * t) / total;
        if best.map_or(true, |(_, r)| residual < r) {
            best = Some((progress, residual));
        }
    }
    best.map(|(progress, residual)| Projection { progress, residual })
}

/// Maps a track-progress fraction back to a point on `path` by interpolating
/// along the nearest arc-length segment (§4.6: "project track-progress →
/// point on display path").
pub fn point_at_progress(path: &[Point], arc: &[f64], progress: f64) -> Option<Point> {
    if path.len() < 2 || arc.len() != path.len() {
        return None;
    }
    let total = perimeter(arc);
    if total <= 0.0 {
        return None;
    }
    let target_arc = progress.rem_euclid(1.0) * total;
    let idx = match arc.binary_search_by(|probe| probe.partial_cmp(&target_arc).unwrap()) {
        Ok(i) => i.min(path.len() - 2),
        Err(i) => i.saturating_sub(1).min(path.len() - 2),
    };
    let seg_len = arc[idx + 1] - arc[idx];
    let t = if seg_len > f64::MIN_POSITIVE { (target_arc - arc[idx]) / seg_len } else { 0.0 };
    let a = path[idx];
    let b = path[idx + 1];
    Some(Point { x: a.x + (b.x - a.x) * t, y: a.y + (b.y - a.y) * t })
}

fn progress_to_index(arc: &[f64], total: f64, progress: f64) -> usize {
    let target_arc = progress.rem_euclid(1.0) * total;
    match arc.binary_search_by(|probe| probe.partial_cmp(&target_arc).unwrap()) {
        Ok(i) => i,
        Err(i) => i.min(arc.len() - 1),
    }
}

/// Forward (wrap-around) progress-space distance from `from` to `to`, both
/// in `[0, 1)`. Used by the segment-truncation logic (§4.5) to determine how
/// far a driver has progressed past the start/finish line.
pub fn forward_distance(from: f64, to: f64) -> f64 {
    (to - from).rem_euclid(1.0)
}

/// Layout-change heuristic (§4.4): compares bounding boxes and a mean
/// nearest-point residual between the candidate and the existing baseline.
/// Returns `true` ("changed") only past a conservative threshold, since
/// false positives are cheaper than incorrectly refining a genuinely new
/// track (§9 Open Questions).
pub fn layout_changed(existing: &Path, candidate: &Path, bbox_threshold: f64, residual_threshold: f64) -> bool {
    if existing.is_empty() || candidate.is_empty() {
        return !existing.is_empty() != !candidate.is_empty();
    }
    let bbox = |p: &Path| -> (f64, f64, f64, f64) {
        let xs = p.iter().map(|pt| pt.x);
        let ys = p.iter().map(|pt| pt.y);
        (
            xs.clone().fold(f64::INFINITY, f64::min),
            xs.fold(f64::NEG_INFINITY, f64::max),
            ys.clone().fold(f64::INFINITY, f64::min),
            ys.fold(f64::NEG_INFINITY, f64::max),
        )
    };
    let (ex0, ex1, ey0, ey1) = bbox(existing);
    let (cx0, cx1, cy0, cy1) = bbox(candidate);
    let bbox_delta = (ex0 - cx0).abs() + (ex1 - cx1).abs() + (ey0 - cy0).abs() + (ey1 - cy1).abs();
    if bbox_delta > bbox_threshold {
        return true;
    }

    let arc = arc_length_table(existing);
    let mean_residual: f64 = candidate
        .iter()
        .map(|p| {
            project(existing, &arc, *p, None)
                .map(|proj| proj.residual)
                .unwrap_or(f64::INFINITY)
        })
        .sum::<f64>()
        / candidate.len() as f64;

    mean_residual > residual_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Path {
        vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 10.0, y: 0.0 },
            Point { x: 10.0, y: 10.0 },
            Point { x: 0.0, y: 10.0 },
            Point { x: 0.0, y: 0.0 },
        ]
    }

    /// §8 property 8: arc table length matches path length and is
    /// non-decreasing.
    #[test]
    fn arc_table_matches_path_length_and_is_non_decreasing() {
        let path = square();
        let arc = arc_length_table(&path);
        assert_eq!(arc.len(), path.len());
        for w in arc.windows(2) {
            assert!(w[1] >= w[0]);
        }
        assert_eq!(perimeter(&arc), 40.0);
    }

    #[test]
    fn project_midpoint_of_first_edge() {
        let path = square();
        let arc = arc_length_table(&path);
        let proj = project(&path, &arc, Point { x: 5.0, y: 0.0 }, None).unwrap();
        assert!((proj.progress - 0.125).abs() < 1e-9);
        assert!(proj.residual.abs() < 1e-9);
    }

    #[test]
    fn forward_distance_wraps() {
        assert!((forward_distance(0.9, 0.1) - 0.2).abs() < 1e-9);
        assert!((forward_distance(0.1, 0.9) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn build_centerline_closes_loop_exactly() {
        let traces = vec![square(), square()];
        let path = build_centerline(&traces, 8, 100.0, 1).unwrap();
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn layout_change_detects_large_bbox_shift() {
        let existing = square();
        let mut shifted = square();
        for p in shifted.iter_mut() {
            p.x += 500.0;
        }
        assert!(layout_changed(&existing, &shifted, 10.0, 5.0));
    }

    #[test]
    fn layout_change_conservative_for_minor_noise() {
        let existing = square();
        let mut noisy = square();
        for p in noisy.iter_mut() {
            p.x += 0.01;
        }
        assert!(!layout_changed(&existing, &noisy, 10.0, 5.0));
    }
}
