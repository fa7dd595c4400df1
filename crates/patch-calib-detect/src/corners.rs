//! Corner lattice estimation and refinement.
//!
//! Unit grid convention: cell `(r, c)` has its centre at `(c + 0.5, r + 0.5)`
//! and corner `(i, j)` of the `(rows + 1) x (cols + 1)` lattice sits at
//! `(j, i)`.

use log::{debug, warn};
use nalgebra::Point2;
use patch_calib_core::{
    ensure, estimate_homography, homography_from_4pt, ConfigError, CornerSearch,
    CornerSearchMode, GrayImageView, PatternSize,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default cap on the corner search radius, in pixels.
pub const MAX_SEARCH_DIST: f32 = 3.0;

/// Default blend factor of the iterative refinement.
pub const DEFAULT_CORRECTION_FACTOR: f32 = 0.5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementParams {
    /// Weight of the local-homography prediction, in `[0, 1]`.
    pub correction_factor: f32,
    pub max_iterations: usize,
    /// Converged once no corner moves farther than this (pixels).
    pub tolerance: f32,
    /// Radius of the initial interior-corner search as a fraction of the
    /// local corner spacing; `0` skips it.
    pub initial_search_fraction: f32,
}

impl Default for RefinementParams {
    fn default() -> Self {
        Self {
            correction_factor: DEFAULT_CORRECTION_FACTOR,
            max_iterations: 20,
            tolerance: 0.01,
            initial_search_fraction: 0.25,
        }
    }
}

impl RefinementParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            (0.0..=1.0).contains(&self.correction_factor),
            "correction_factor",
            "must lie in [0, 1]",
        )?;
        ensure(
            self.max_iterations >= 1,
            "max_iterations",
            "must be at least 1",
        )?;
        ensure(
            self.tolerance.is_finite() && self.tolerance > 0.0,
            "tolerance",
            "must be finite and positive",
        )?;
        ensure(
            (0.0..=0.5).contains(&self.initial_search_fraction),
            "initial_search_fraction",
            "must lie in [0, 0.5]",
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefinementOutcome {
    pub iterations: usize,
    /// Largest corner displacement of the last iteration.
    pub max_shift: f32,
    pub converged: bool,
}

/// Snap settings for [`find_best_corners`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerSearchParams {
    pub mode: CornerSearchMode,
    pub search_dist: f32,
    pub max_search_dist: f32,
}

impl Default for CornerSearchParams {
    fn default() -> Self {
        Self {
            mode: CornerSearchMode::Mask,
            search_dist: MAX_SEARCH_DIST,
            max_search_dist: MAX_SEARCH_DIST,
        }
    }
}

impl CornerSearchParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.search_dist > 0.0 && self.max_search_dist > 0.0,
            "search_dist",
            "search distances must be positive",
        )
    }

    pub fn radius(&self) -> f32 {
        self.search_dist.min(self.max_search_dist)
    }
}

#[inline]
fn unit_corner(i: usize, j: usize) -> Point2<f32> {
    Point2::new(j as f32, i as f32)
}

/// Corner lattice from the row-major cell centres.
///
/// Each corner is mapped through the homography of the 2x2 block of cell
/// centres around it; boundary corners use the nearest in-grid block.
/// `None` when the centre count is wrong or a block is degenerate.
pub fn interpolate_corner_locations(
    centres: &[Point2<f32>],
    size: PatternSize,
) -> Option<Vec<Point2<f32>>> {
    if centres.len() != size.cell_count() || size.rows < 2 || size.cols < 2 {
        return None;
    }

    // One homography per 2x2 block, indexed by its top-left cell.
    let blocks = PatternSize {
        rows: size.rows - 1,
        cols: size.cols - 1,
    };
    let mut hs = Vec::with_capacity(blocks.cell_count());
    for r in 0..blocks.rows {
        for c in 0..blocks.cols {
            let unit = [
                Point2::new(c as f32 + 0.5, r as f32 + 0.5),
                Point2::new(c as f32 + 1.5, r as f32 + 0.5),
                Point2::new(c as f32 + 1.5, r as f32 + 1.5),
                Point2::new(c as f32 + 0.5, r as f32 + 1.5),
            ];
            let img = [
                centres[size.index(r, c)],
                centres[size.index(r, c + 1)],
                centres[size.index(r + 1, c + 1)],
                centres[size.index(r + 1, c)],
            ];
            hs.push(homography_from_4pt(&unit, &img)?);
        }
    }

    let lattice = size.corner_grid();
    let mut out = Vec::with_capacity(lattice.cell_count());
    for i in 0..lattice.rows {
        for j in 0..lattice.cols {
            let br = i.saturating_sub(1).min(blocks.rows - 1);
            let bc = j.saturating_sub(1).min(blocks.cols - 1);
            out.push(hs[blocks.index(br, bc)].try_apply(unit_corner(i, j))?);
        }
    }
    Some(out)
}

/// Lattice indices of a cell's corners, `[TL, TR, BR, BL]`.
#[inline]
fn quad_indices(size: PatternSize, r: usize, c: usize) -> [usize; 4] {
    let lattice = size.corner_grid();
    [
        lattice.index(r, c),
        lattice.index(r, c + 1),
        lattice.index(r + 1, c + 1),
        lattice.index(r + 1, c),
    ]
}

/// Row-major lattice corners to per-cell quads `[TL, TR, BR, BL]`, cells in
/// row-major order. `None` on a length mismatch.
pub fn group_points_in_quads(
    corners: &[Point2<f32>],
    size: PatternSize,
) -> Option<Vec<[Point2<f32>; 4]>> {
    if corners.len() != size.corner_count() {
        return None;
    }
    let mut out = Vec::with_capacity(size.cell_count());
    for r in 0..size.rows {
        for c in 0..size.cols {
            out.push(quad_indices(size, r, c).map(|k| corners[k]));
        }
    }
    Some(out)
}

/// Inverse of [`group_points_in_quads`]; shared corners take their first
/// occurrence.
pub fn ungroup_quads(quads: &[[Point2<f32>; 4]], size: PatternSize) -> Option<Vec<Point2<f32>>> {
    if quads.len() != size.cell_count() {
        return None;
    }
    let mut out: Vec<Option<Point2<f32>>> = vec![None; size.corner_count()];
    for r in 0..size.rows {
        for c in 0..size.cols {
            let quad = &quads[size.index(r, c)];
            for (k, idx) in quad_indices(size, r, c).into_iter().enumerate() {
                out[idx].get_or_insert(quad[k]);
            }
        }
    }
    out.into_iter().collect()
}

#[inline]
fn is_interior(lattice: PatternSize, i: usize, j: usize) -> bool {
    i > 0 && j > 0 && i + 1 < lattice.rows && j + 1 < lattice.cols
}

/// Shortest distance from lattice corner `(i, j)` to a row/column neighbour.
fn corner_spacing(corners: &[Point2<f32>], lattice: PatternSize, i: usize, j: usize) -> f32 {
    let p = corners[lattice.index(i, j)];
    [
        (i.wrapping_sub(1), j),
        (i + 1, j),
        (i, j.wrapping_sub(1)),
        (i, j + 1),
    ]
    .into_iter()
    .filter(|&(a, b)| a < lattice.rows && b < lattice.cols)
    .map(|(a, b)| (corners[lattice.index(a, b)] - p).norm())
    .fold(f32::INFINITY, f32::min)
}

/// First snap of the interpolated lattice onto the image, before the
/// geometric refinement.
///
/// Only interior corners are searched, with a radius of `fraction` times the
/// local corner spacing; boundary corners have no crossing to lock onto and
/// are placed by [`refine_corner_positions`]. Returns how many were moved.
pub fn initial_refinement_of_corners(
    img: &GrayImageView<'_>,
    corners: &mut [Point2<f32>],
    size: PatternSize,
    search: &dyn CornerSearch,
    mode: CornerSearchMode,
    fraction: f32,
) -> usize {
    if fraction <= 0.0 || corners.len() != size.corner_count() {
        return 0;
    }
    let lattice = size.corner_grid();
    let estimates = corners.to_vec();
    let mut moved = 0;
    for i in 1..lattice.rows - 1 {
        for j in 1..lattice.cols - 1 {
            let radius = fraction * corner_spacing(&estimates, lattice, i, j) / mode.window_scale();
            if radius.is_nan() || radius < 1.0 {
                continue;
            }
            let k = lattice.index(i, j);
            if let Some(p) = search.search(img, estimates[k], radius, mode) {
                corners[k] = p;
                moved += 1;
            }
        }
    }
    debug!("initial refinement moved {moved} interior corners");
    moved
}

/// Iteratively pull every corner towards the position predicted by the
/// homography of its surrounding cells.
///
/// Per cell, a homography is fitted to the corners of the surrounding block
/// of cells (up to 3x3, clamped to the grid) without the cell's own four
/// corners, and predicts those four. Predictions are averaged per corner
/// and blended `f * predicted + (1 - f) * previous`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(corners, params), fields(rows = size.rows, cols = size.cols))
)]
pub fn refine_corner_positions(
    corners: &mut [Point2<f32>],
    size: PatternSize,
    params: &RefinementParams,
) -> RefinementOutcome {
    let mut outcome = RefinementOutcome {
        iterations: 0,
        max_shift: 0.0,
        converged: false,
    };
    if corners.len() != size.corner_count() {
        return outcome;
    }

    let lattice = size.corner_grid();
    let bh = size.rows.min(3);
    let bw = size.cols.min(3);
    let f = params.correction_factor;

    for iter in 0..params.max_iterations {
        let mut sum = vec![nalgebra::Vector2::<f32>::zeros(); corners.len()];
        let mut count = vec![0u32; corners.len()];

        for r in 0..size.rows {
            for c in 0..size.cols {
                let r0 = (r.saturating_sub(1)).min(size.rows - bh);
                let c0 = (c.saturating_sub(1)).min(size.cols - bw);
                let own = quad_indices(size, r, c);

                let mut unit = Vec::with_capacity((bh + 1) * (bw + 1));
                let mut img = Vec::with_capacity((bh + 1) * (bw + 1));
                for i in r0..=r0 + bh {
                    for j in c0..=c0 + bw {
                        let k = lattice.index(i, j);
                        if own.contains(&k) {
                            continue;
                        }
                        unit.push(unit_corner(i, j));
                        img.push(corners[k]);
                    }
                }
                let Some(h) = estimate_homography(&unit, &img) else {
                    continue;
                };
                for k in own {
                    let (i, j) = (k / lattice.cols, k % lattice.cols);
                    if let Some(p) = h.try_apply(unit_corner(i, j)) {
                        sum[k] += p.coords;
                        count[k] += 1;
                    }
                }
            }
        }

        let mut max_shift = 0.0f32;
        for (k, corner) in corners.iter_mut().enumerate() {
            if count[k] == 0 {
                continue;
            }
            let predicted = sum[k] / count[k] as f32;
            let next = Point2::from(predicted * f + corner.coords * (1.0 - f));
            max_shift = max_shift.max((next - *corner).norm());
            *corner = next;
        }

        outcome.iterations = iter + 1;
        outcome.max_shift = max_shift;
        if max_shift < params.tolerance {
            outcome.converged = true;
            break;
        }
    }

    if outcome.converged {
        debug!(
            "refinement converged after {} iterations (shift {:.4}px)",
            outcome.iterations, outcome.max_shift
        );
    } else {
        warn!(
            "refinement stopped after {} iterations, last shift {:.4}px",
            outcome.iterations, outcome.max_shift
        );
    }
    outcome
}

/// Snap every corner of the `size` lattice to the image with `search`;
/// corners without a reliable result keep their estimate, as do boundary
/// corners when the mode is interior-only. Returns how many were snapped.
pub fn find_best_corners(
    img: &GrayImageView<'_>,
    corners: &mut [Point2<f32>],
    size: PatternSize,
    search: &dyn CornerSearch,
    params: &CornerSearchParams,
) -> usize {
    let radius = params.radius();
    let lattice = size.corner_grid();
    let interior_only = params.mode.interior_only() && corners.len() == lattice.cell_count();
    let mut snapped = 0;
    for (k, corner) in corners.iter_mut().enumerate() {
        if interior_only && !is_interior(lattice, k / lattice.cols, k % lattice.cols) {
            continue;
        }
        if let Some(p) = search.search(img, *corner, radius, params.mode) {
            *corner = p;
            snapped += 1;
        }
    }
    snapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;
    use patch_calib_core::{GrayImage, Homography, SubpixelCornerSearch};

    fn board_h() -> Homography {
        Homography::new(Matrix3::new(
            40.0, 2.0, 60.0, //
            -1.5, 38.0, 50.0, //
            0.004, 0.002, 1.0,
        ))
    }

    fn centres(size: PatternSize, h: &Homography) -> Vec<Point2<f32>> {
        (0..size.rows)
            .flat_map(|r| (0..size.cols).map(move |c| Point2::new(c as f32 + 0.5, r as f32 + 0.5)))
            .map(|p| h.apply(p))
            .collect()
    }

    fn lattice(size: PatternSize, h: &Homography) -> Vec<Point2<f32>> {
        let l = size.corner_grid();
        (0..l.rows)
            .flat_map(|i| (0..l.cols).map(move |j| unit_corner(i, j)))
            .map(|p| h.apply(p))
            .collect()
    }

    fn max_err(a: &[Point2<f32>], b: &[Point2<f32>]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(p, q)| (p - q).norm())
            .fold(0.0, f32::max)
    }

    #[test]
    fn interpolation_is_exact_for_projective_grid() {
        let size = PatternSize::new(4, 5).expect("size");
        let h = board_h();
        let corners = interpolate_corner_locations(&centres(size, &h), size).expect("corners");
        assert_eq!(corners.len(), 30);
        assert!(max_err(&corners, &lattice(size, &h)) < 1e-2);
    }

    #[test]
    fn interpolation_rejects_wrong_count() {
        let size = PatternSize::new(3, 3).expect("size");
        assert!(interpolate_corner_locations(&[Point2::new(0.0, 0.0); 8], size).is_none());
    }

    #[test]
    fn quads_round_trip() {
        let size = PatternSize::new(3, 4).expect("size");
        let corners = lattice(size, &board_h());
        let quads = group_points_in_quads(&corners, size).expect("quads");
        assert_eq!(quads.len(), 12);
        // Cell (1, 2): TL is lattice (1, 2), BR is lattice (2, 3).
        assert_eq!(quads[6][0], corners[7]);
        assert_eq!(quads[6][2], corners[13]);
        assert_eq!(ungroup_quads(&quads, size).expect("ungroup"), corners);
        assert!(ungroup_quads(&quads[..11], size).is_none());
    }

    #[test]
    fn refinement_keeps_consistent_grid_and_converges() {
        let size = PatternSize::new(4, 4).expect("size");
        let truth = lattice(size, &board_h());
        let mut corners = truth.clone();
        let out = refine_corner_positions(&mut corners, size, &RefinementParams::default());
        assert!(out.converged);
        assert_eq!(out.iterations, 1);
        assert!(max_err(&corners, &truth) < 1e-2);
    }

    #[test]
    fn refinement_pulls_displaced_corner_back() {
        let size = PatternSize::new(4, 5).expect("size");
        let truth = lattice(size, &board_h());
        let mut corners = truth.clone();
        // Interior corner (2, 2).
        let k = size.corner_grid().index(2, 2);
        corners[k].x += 4.0;
        corners[k].y -= 3.0;

        let out = refine_corner_positions(&mut corners, size, &RefinementParams::default());
        assert!(out.iterations >= 2);
        assert!((corners[k] - truth[k]).norm() < 1.5, "corner {:?}", corners[k]);
    }

    #[test]
    fn zero_correction_factor_is_identity() {
        let size = PatternSize::new(3, 3).expect("size");
        let mut corners = lattice(size, &board_h());
        corners[5].x += 2.0;
        let before = corners.clone();
        let params = RefinementParams {
            correction_factor: 0.0,
            ..RefinementParams::default()
        };
        let out = refine_corner_positions(&mut corners, size, &params);
        assert!(out.converged);
        assert_eq!(corners, before);
    }

    /// Light 5px gaps between dark cells of pitch 20; gap columns are
    /// `x % 20` in `{18, 19, 0, 1, 2}`, so crossings sit on multiples of 20.
    fn gap_grid() -> GrayImage {
        let mut img = GrayImage::new(100, 100, 30);
        for y in 0..100 {
            for x in 0..100 {
                let gx = (x as i32 % 20 - 10).abs() >= 8;
                let gy = (y as i32 % 20 - 10).abs() >= 8;
                if gx || gy {
                    img.set(x, y, 220);
                }
            }
        }
        img
    }

    /// 3x3-cell lattice over [`gap_grid`] crossings, shifted by `(dx, dy)`.
    fn shifted_lattice(dx: f32, dy: f32) -> Vec<Point2<f32>> {
        (0..4)
            .flat_map(|i| {
                (0..4).map(move |j| {
                    Point2::new(20.0 + 20.0 * j as f32 + dx, 20.0 + 20.0 * i as f32 + dy)
                })
            })
            .collect()
    }

    #[test]
    fn snapping_moves_estimates_onto_crossings() {
        let img = gap_grid();
        let mut corners = vec![Point2::new(41.0, 39.2), Point2::new(59.3, 60.8)];
        let n = find_best_corners(
            &img.view(),
            &mut corners,
            PatternSize { rows: 2, cols: 2 },
            &SubpixelCornerSearch::default(),
            &CornerSearchParams::default(),
        );
        assert_eq!(n, 2);
        assert!((corners[0] - Point2::new(40.0, 40.0)).norm() < 0.4, "{:?}", corners[0]);
        assert!((corners[1] - Point2::new(60.0, 60.0)).norm() < 0.4, "{:?}", corners[1]);
    }

    #[test]
    fn inner_mask_leaves_boundary_corners() {
        let img = gap_grid();
        let size = PatternSize { rows: 3, cols: 3 };
        let lattice = size.corner_grid();
        let start = shifted_lattice(0.8, -0.7);
        let params = CornerSearchParams {
            mode: CornerSearchMode::InnerMask,
            ..CornerSearchParams::default()
        };

        let mut corners = start.clone();
        let search = SubpixelCornerSearch::default();
        let n = find_best_corners(&img.view(), &mut corners, size, &search, &params);
        assert_eq!(n, 4);
        for i in 0..4 {
            for j in 0..4 {
                let k = lattice.index(i, j);
                if is_interior(lattice, i, j) {
                    let truth = Point2::new(20.0 + 20.0 * j as f32, 20.0 + 20.0 * i as f32);
                    assert!((corners[k] - truth).norm() < 0.4, "{:?}", corners[k]);
                } else {
                    assert_eq!(corners[k], start[k]);
                }
            }
        }

        let mut all = start.clone();
        let mask = CornerSearchParams::default();
        assert_eq!(find_best_corners(&img.view(), &mut all, size, &search, &mask), 16);
    }

    #[test]
    fn initial_refinement_snaps_interior_corners_from_afar() {
        let img = gap_grid();
        let size = PatternSize { rows: 3, cols: 3 };
        let lattice = size.corner_grid();
        let start = shifted_lattice(2.5, -2.0);
        let mut corners = start.clone();

        let moved = initial_refinement_of_corners(
            &img.view(),
            &mut corners,
            size,
            &SubpixelCornerSearch::default(),
            CornerSearchMode::Mask,
            0.25,
        );
        assert_eq!(moved, 4);
        for (k, (c, s)) in corners.iter().zip(&start).enumerate() {
            let (i, j) = (k / lattice.cols, k % lattice.cols);
            if is_interior(lattice, i, j) {
                let truth = Point2::new(20.0 + 20.0 * j as f32, 20.0 + 20.0 * i as f32);
                assert!((c - truth).norm() < 0.4, "corner {k}: {c:?}");
            } else {
                assert_eq!(c, s);
            }
        }

        let mut untouched = start.clone();
        let search = SubpixelCornerSearch::default();
        let mode = CornerSearchMode::Mask;
        let n = initial_refinement_of_corners(&img.view(), &mut untouched, size, &search, mode, 0.0);
        assert_eq!(n, 0);
        assert_eq!(untouched, start);
    }

    #[test]
    fn search_radius_is_capped() {
        let p = CornerSearchParams {
            search_dist: 10.0,
            ..CornerSearchParams::default()
        };
        assert_eq!(p.radius(), MAX_SEARCH_DIST);
    }
}
