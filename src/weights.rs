//! # Weight-grid construction
//!
//! Builds the sparse [`WeightGrid`] of an observation from its retrieval geometry. This is
//! normally preprocessor territory, but it lives here because the geometry rules define
//! exactly what the adjoint scatter transposes.
//!
//! A raw pixel maps to model cells by one of three rules:
//!
//! 1. **Instant point** — a single `(layer, row, col)` cell.
//! 2. **Instant ray** — the segment top-of-atmosphere (solar) → surface pixel →
//!    top-of-atmosphere (sensor), intersected with the 3-D grid by an incremental
//!    line–box traversal; weights proportional to per-cell path length.
//! 3. **Multi-ray footprint** — a surface polygon extruded vertically; per-cell areas by
//!    scan-converting the polygon against the horizontal grid; weights proportional to
//!    area.
//!
//! Spatial weights are normalized over the in-grid portion, then multiplied by the
//! observation's **visibility profile** (pressure-weighting function × averaging kernel)
//! interpolated from the retrieval's native pressure levels onto the model's pressure
//! levels at that column (surface pressure plus the domain sigma vector). Finally the two
//! fine timesteps bracketing the observation time are weighted linearly by time fraction
//! (`interp_time = false` snaps to the nearest step instead).
//!
//! Geometry coordinates are expressed in grid units: `x` along columns, `y` along rows,
//! `z` along layers, cell `(row, col, lay)` spanning the unit cube at
//! `[col, col+1) × [row, row+1) × [lay, lay+1)`.

use std::collections::HashMap;

use ndarray::Array2;

use crate::data::domain::{Coord6, DomainRecord};
use crate::data::observation::WeightGrid;

/// Retrieval visibility profile on its native pressure levels (Pa).
///
/// The product of the pressure-weighting function and the averaging kernel; interpolated
/// linearly in pressure, clamped at the profile ends.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityProfile {
    /// Native pressure levels, strictly monotone (either direction), Pa.
    pub pressure: Vec<f64>,
    /// Visibility at each level.
    pub weight: Vec<f64>,
}

impl VisibilityProfile {
    /// Flat profile, for retrievals without column weighting.
    pub fn uniform() -> Self {
        VisibilityProfile { pressure: vec![0.0, 1.2e5], weight: vec![1.0, 1.0] }
    }

    /// Linear interpolation at pressure `p`, clamped at the ends.
    pub fn interp(&self, p: f64) -> f64 {
        let n = self.pressure.len();
        debug_assert!(n >= 2 && n == self.weight.len());
        let ascending = self.pressure[0] < self.pressure[n - 1];
        let key = |i: usize| if ascending { self.pressure[i] } else { self.pressure[n - 1 - i] };
        let val = |i: usize| if ascending { self.weight[i] } else { self.weight[n - 1 - i] };
        if p <= key(0) {
            return val(0);
        }
        if p >= key(n - 1) {
            return val(n - 1);
        }
        for i in 1..n {
            if p <= key(i) {
                let f = (p - key(i - 1)) / (key(i) - key(i - 1));
                return val(i - 1) + f * (val(i) - val(i - 1));
            }
        }
        val(n - 1)
    }
}

/// Geometric mapping of one raw pixel onto the grid.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsGeometry {
    /// A single cell at one fine timestep.
    Point { lay: usize, row: usize, col: usize },
    /// TOA-solar → surface pixel → TOA-sensor, in grid units.
    Ray { sun: [f64; 3], pixel: [f64; 3], sensor: [f64; 3] },
    /// Surface polygon corners `(x, y)` in grid units, extruded vertically.
    Footprint { corners: Vec<(f64, f64)> },
}

/// Observation timestamp within the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObsTime {
    pub day: usize,
    /// Seconds past the zero hour of `day`.
    pub second_of_day: f64,
}

/// Precomputed offset term for averaging-kernel retrievals:
/// `offset = prior_xgas − Σ_l pweight_l · kernel_l · prior_profile_l`.
pub fn retrieval_offset(
    prior_xgas: f64,
    pweight: &[f64],
    kernel: &[f64],
    prior_profile: &[f64],
) -> f64 {
    let embedded: f64 = pweight
        .iter()
        .zip(kernel)
        .zip(prior_profile)
        .map(|((p, k), x)| p * k * x)
        .sum();
    prior_xgas - embedded
}

/// Build the final sparse weight grid for one observation.
///
/// Arguments
/// -----------------
/// * `domain`: the model domain (grid extents and sigma levels).
/// * `psurf`: surface pressure field `(rows, cols)`, Pa.
/// * `spc`: species index of the retrieved gas.
/// * `geometry`: the pixel-to-grid rule.
/// * `profile`: the visibility profile on retrieval pressure levels.
/// * `time`: observation timestamp.
/// * `interp_time`: bracket two fine steps linearly, or snap to the nearest.
///
/// Return
/// ----------
/// * The weight grid. Empty when the geometry misses the grid entirely — callers treat an
///   empty grid as an invalid observation and drop the record.
pub fn build_weight_grid(
    domain: &DomainRecord,
    psurf: &Array2<f64>,
    spc: usize,
    geometry: &ObsGeometry,
    profile: &VisibilityProfile,
    time: ObsTime,
    interp_time: bool,
) -> WeightGrid {
    let spatial = spatial_weights(domain, geometry);
    if spatial.is_empty() {
        return WeightGrid::new();
    }
    let total: f64 = spatial.values().sum();

    let mut grid = WeightGrid::new();
    for ((lay, row, col), w) in spatial {
        let pmid = layer_mid_pressure(domain, psurf[[row, col]], lay);
        let vis = profile.interp(pmid);
        let weight = w / total * vis;
        if weight == 0.0 {
            continue;
        }
        for (step, tw) in time_brackets(domain, time, interp_time) {
            *grid
                .entry(Coord6 { day: time.day, step, lay, row, col, spc })
                .or_insert(0.0) += weight * tw;
        }
    }
    grid
}

/// Pressure at the middle of layer `lay` for a column with surface pressure `psurf`.
fn layer_mid_pressure(domain: &DomainRecord, psurf: f64, lay: usize) -> f64 {
    let sig = 0.5 * (domain.sigma[lay] + domain.sigma[lay + 1]);
    domain.ptop + sig * (psurf - domain.ptop)
}

/// The one or two `(fine step, weight)` pairs bracketing the observation time.
fn time_brackets(domain: &DomainRecord, time: ObsTime, interp_time: bool) -> Vec<(usize, f64)> {
    let last = domain.steps_per_day();
    let f = (time.second_of_day / domain.step_seconds as f64).clamp(0.0, last as f64);
    let i0 = f.floor() as usize;
    let frac = f - i0 as f64;
    if !interp_time {
        return vec![(f.round() as usize, 1.0)];
    }
    if frac == 0.0 || i0 >= last {
        vec![(i0.min(last), 1.0)]
    } else {
        vec![(i0, 1.0 - frac), (i0 + 1, frac)]
    }
}

/// Un-normalized spatial weights per `(lay, row, col)` cell.
fn spatial_weights(
    domain: &DomainRecord,
    geometry: &ObsGeometry,
) -> HashMap<(usize, usize, usize), f64> {
    let mut out = HashMap::new();
    match geometry {
        ObsGeometry::Point { lay, row, col } => {
            if *lay < domain.lays && *row < domain.rows && *col < domain.cols {
                out.insert((*lay, *row, *col), 1.0);
            }
        }
        ObsGeometry::Ray { sun, pixel, sensor } => {
            for (cell, len) in ray_cell_lengths(domain, *sun, *pixel)
                .into_iter()
                .chain(ray_cell_lengths(domain, *pixel, *sensor))
            {
                *out.entry(cell).or_insert(0.0) += len;
            }
        }
        ObsGeometry::Footprint { corners } => {
            for ((row, col), area) in footprint_cell_areas(domain, corners) {
                for lay in 0..domain.lays {
                    out.insert((lay, row, col), area);
                }
            }
        }
    }
    out
}

/// Per-cell path lengths of the segment `a → b` through the grid box, by incremental
/// line–box (DDA-style) traversal. Coordinates in grid units `(x=col, y=row, z=lay)`.
pub fn ray_cell_lengths(
    domain: &DomainRecord,
    a: [f64; 3],
    b: [f64; 3],
) -> Vec<((usize, usize, usize), f64)> {
    let extent = [domain.cols as f64, domain.rows as f64, domain.lays as f64];
    let dir = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let seg_len = (dir[0] * dir[0] + dir[1] * dir[1] + dir[2] * dir[2]).sqrt();
    if seg_len == 0.0 {
        return Vec::new();
    }

    // Clip the parameter range to the grid box by axis slabs.
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;
    for k in 0..3 {
        if dir[k] == 0.0 {
            if a[k] < 0.0 || a[k] > extent[k] {
                return Vec::new();
            }
        } else {
            let ta = (0.0 - a[k]) / dir[k];
            let tb = (extent[k] - a[k]) / dir[k];
            t0 = t0.max(ta.min(tb));
            t1 = t1.min(ta.max(tb));
        }
    }
    if t0 >= t1 {
        return Vec::new();
    }

    let clamp_cell = |v: f64, n: f64| (v.floor().max(0.0) as usize).min(n as usize - 1);
    let probe = 1e-9;
    let mut t = t0;
    let mut cell = [
        clamp_cell(a[0] + (t0 + probe) * dir[0], extent[0]),
        clamp_cell(a[1] + (t0 + probe) * dir[1], extent[1]),
        clamp_cell(a[2] + (t0 + probe) * dir[2], extent[2]),
    ];
    let mut lengths = Vec::new();
    loop {
        // Parameter of the next face crossing along each axis.
        let mut tn = t1;
        let mut cross = [false; 3];
        for k in 0..3 {
            let next = if dir[k] > 0.0 {
                (cell[k] as f64 + 1.0 - a[k]) / dir[k]
            } else if dir[k] < 0.0 {
                (cell[k] as f64 - a[k]) / dir[k]
            } else {
                f64::INFINITY
            };
            if next < tn - 1e-15 {
                tn = next;
                cross = [false; 3];
                cross[k] = true;
            } else if (next - tn).abs() <= 1e-15 && next < t1 {
                cross[k] = true;
            }
        }
        let step_len = (tn - t) * seg_len;
        if step_len > 0.0 {
            lengths.push(((cell[2], cell[1], cell[0]), step_len));
        }
        if tn >= t1 {
            break;
        }
        t = tn;
        for k in 0..3 {
            if cross[k] {
                if dir[k] > 0.0 {
                    cell[k] += 1;
                    if cell[k] as f64 >= extent[k] {
                        return lengths;
                    }
                } else {
                    if cell[k] == 0 {
                        return lengths;
                    }
                    cell[k] -= 1;
                }
            }
        }
    }
    lengths
}

/// Per-cell areas of a surface polygon, by clipping it against every grid cell in its
/// bounding box (Sutherland–Hodgman) and taking the clipped area.
pub fn footprint_cell_areas(
    domain: &DomainRecord,
    corners: &[(f64, f64)],
) -> Vec<((usize, usize), f64)> {
    if corners.len() < 3 {
        return Vec::new();
    }
    let xs: Vec<f64> = corners.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = corners.iter().map(|p| p.1).collect();
    let c0 = xs.iter().cloned().fold(f64::INFINITY, f64::min).floor().max(0.0) as usize;
    let c1 = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max).ceil().min(domain.cols as f64) as usize;
    let r0 = ys.iter().cloned().fold(f64::INFINITY, f64::min).floor().max(0.0) as usize;
    let r1 = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max).ceil().min(domain.rows as f64) as usize;

    let mut out = Vec::new();
    for row in r0..r1 {
        for col in c0..c1 {
            let clipped = clip_to_rect(corners, col as f64, row as f64, col as f64 + 1.0, row as f64 + 1.0);
            let area = polygon_area(&clipped).abs();
            if area > 1e-12 {
                out.push(((row, col), area));
            }
        }
    }
    out
}

/// Shoelace area (signed).
fn polygon_area(poly: &[(f64, f64)]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..poly.len() {
        let (x0, y0) = poly[i];
        let (x1, y1) = poly[(i + 1) % poly.len()];
        acc += x0 * y1 - x1 * y0;
    }
    0.5 * acc
}

/// Sutherland–Hodgman clip of a polygon against an axis-aligned rectangle.
fn clip_to_rect(poly: &[(f64, f64)], x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<(f64, f64)> {
    // Each edge as (inside test, intersection with the edge line).
    type Edge = (fn(&(f64, f64), f64) -> bool, fn(&(f64, f64), &(f64, f64), f64) -> (f64, f64));
    let left: Edge = (
        |p, x| p.0 >= x,
        |p, q, x| {
            let t = (x - p.0) / (q.0 - p.0);
            (x, p.1 + t * (q.1 - p.1))
        },
    );
    let right: Edge = (
        |p, x| p.0 <= x,
        |p, q, x| {
            let t = (x - p.0) / (q.0 - p.0);
            (x, p.1 + t * (q.1 - p.1))
        },
    );
    let bottom: Edge = (
        |p, y| p.1 >= y,
        |p, q, y| {
            let t = (y - p.1) / (q.1 - p.1);
            (p.0 + t * (q.0 - p.0), y)
        },
    );
    let top: Edge = (
        |p, y| p.1 <= y,
        |p, q, y| {
            let t = (y - p.1) / (q.1 - p.1);
            (p.0 + t * (q.0 - p.0), y)
        },
    );

    let mut current = poly.to_vec();
    for ((inside, intersect), bound) in [(left, x0), (right, x1), (bottom, y0), (top, y1)] {
        if current.is_empty() {
            break;
        }
        let mut next = Vec::with_capacity(current.len() + 2);
        for i in 0..current.len() {
            let p = current[i];
            let q = current[(i + 1) % current.len()];
            let p_in = inside(&p, bound);
            let q_in = inside(&q, bound);
            match (p_in, q_in) {
                (true, true) => next.push(q),
                (true, false) => next.push(intersect(&p, &q, bound)),
                (false, true) => {
                    next.push(intersect(&p, &q, bound));
                    next.push(q);
                }
                (false, false) => {}
            }
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn tall_domain() -> DomainRecord {
        let mut dom = DomainRecord::example();
        dom.lays = 4;
        dom.sigma = vec![1.0, 0.75, 0.5, 0.25, 0.0];
        dom
    }

    fn psurf(dom: &DomainRecord) -> Array2<f64> {
        Array2::from_elem((dom.rows, dom.cols), 101_325.0)
    }

    #[test]
    fn vertical_ray_crosses_each_layer_once() {
        let dom = tall_domain();
        let lengths = ray_cell_lengths(&dom, [3.5, 4.5, 0.0], [3.5, 4.5, 4.0]);
        assert_eq!(lengths.len(), 4);
        for (lay, ((l, r, c), len)) in lengths.iter().enumerate() {
            assert_eq!((*l, *r, *c), (lay, 4, 3));
            assert_relative_eq!(*len, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn slanted_ray_path_lengths_sum_to_the_clipped_segment() {
        let dom = tall_domain();
        let a = [0.0, 0.0, 0.0];
        let b = [4.0, 3.0, 4.0];
        let lengths = ray_cell_lengths(&dom, a, b);
        let total: f64 = lengths.iter().map(|(_, l)| l).sum();
        let seg = (16.0_f64 + 9.0 + 16.0).sqrt();
        assert_relative_eq!(total, seg, epsilon = 1e-9);
    }

    #[test]
    fn ray_missing_the_grid_yields_no_cells() {
        let dom = tall_domain();
        assert!(ray_cell_lengths(&dom, [-5.0, -5.0, 0.0], [-5.0, -5.0, 4.0]).is_empty());
        assert!(ray_cell_lengths(&dom, [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]).is_empty());
    }

    #[test]
    fn aligned_unit_footprint_covers_exactly_one_cell() {
        let dom = tall_domain();
        let areas = footprint_cell_areas(&dom, &[(2.0, 3.0), (3.0, 3.0), (3.0, 4.0), (2.0, 4.0)]);
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].0, (3, 2));
        assert_relative_eq!(areas[0].1, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn straddling_footprint_splits_by_area() {
        let dom = tall_domain();
        let areas =
            footprint_cell_areas(&dom, &[(1.5, 2.0), (2.5, 2.0), (2.5, 3.0), (1.5, 3.0)]);
        let mut areas = areas;
        areas.sort_by_key(|(cell, _)| *cell);
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].0, (2, 1));
        assert_eq!(areas[1].0, (2, 2));
        assert_relative_eq!(areas[0].1, 0.5, epsilon = 1e-12);
        assert_relative_eq!(areas[1].1, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn footprint_outside_the_grid_is_clipped_away() {
        let dom = tall_domain();
        let areas = footprint_cell_areas(
            &dom,
            &[(-3.0, -3.0), (-1.0, -3.0), (-1.0, -1.0), (-3.0, -1.0)],
        );
        assert!(areas.is_empty());
    }

    #[test]
    fn visibility_interpolates_and_clamps() {
        let prof = VisibilityProfile {
            pressure: vec![100_000.0, 50_000.0],
            weight: vec![1.0, 0.5],
        };
        assert_relative_eq!(prof.interp(75_000.0), 0.75);
        assert_relative_eq!(prof.interp(110_000.0), 1.0);
        assert_relative_eq!(prof.interp(10_000.0), 0.5);
    }

    #[test]
    fn time_bracketing_splits_by_fraction_and_snaps_when_disabled() {
        let dom = tall_domain();
        let t = ObsTime { day: 0, second_of_day: 3600.0 * 5.25 };
        assert_eq!(
            time_brackets(&dom, t, true),
            vec![(5, 0.75), (6, 0.25)]
        );
        assert_eq!(time_brackets(&dom, t, false), vec![(5, 1.0)]);
        let aligned = ObsTime { day: 0, second_of_day: 3600.0 * 7.0 };
        assert_eq!(time_brackets(&dom, aligned, true), vec![(7, 1.0)]);
    }

    #[test]
    fn point_weight_grid_is_normalized_visibility_at_the_cell() {
        let dom = tall_domain();
        let grid = build_weight_grid(
            &dom,
            &psurf(&dom),
            0,
            &ObsGeometry::Point { lay: 0, row: 5, col: 5 },
            &VisibilityProfile::uniform(),
            ObsTime { day: 0, second_of_day: 0.0 },
            true,
        );
        assert_eq!(grid.len(), 1);
        let (c, w) = grid.iter().next().unwrap();
        assert_eq!((c.day, c.step, c.lay, c.row, c.col, c.spc), (0, 0, 0, 5, 5, 0));
        assert_relative_eq!(*w, 1.0);
    }

    #[test]
    fn footprint_weight_grid_sums_to_mean_visibility_per_bracket() {
        let dom = tall_domain();
        let grid = build_weight_grid(
            &dom,
            &psurf(&dom),
            0,
            &ObsGeometry::Footprint {
                corners: vec![(1.0, 1.0), (3.0, 1.0), (3.0, 2.0), (1.0, 2.0)],
            },
            &VisibilityProfile::uniform(),
            ObsTime { day: 0, second_of_day: 1800.0 },
            true,
        );
        // Two cells × four layers × two time brackets.
        assert_eq!(grid.len(), 16);
        let total: f64 = grid.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn retrieval_offset_subtracts_the_embedded_prior_column() {
        let offset = retrieval_offset(
            400.0,
            &[0.25, 0.25, 0.5],
            &[1.0, 0.8, 0.6],
            &[390.0, 400.0, 410.0],
        );
        assert_relative_eq!(offset, 400.0 - (97.5 + 80.0 + 123.0));
    }
}
