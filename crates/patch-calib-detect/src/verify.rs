//! Geometric acceptance checks for a grid-ordered point set.

use nalgebra::Point2;
use patch_calib_core::{ensure, ConfigError, ImageSize, PatternSize};
use serde::{Deserialize, Serialize};

/// Default minimum distance of every point from the image border (pixels).
pub const MIN_DISTANCE_FROM_EDGE: f32 = 2.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GeometryViolation {
    #[error("expected {expected} points, got {found}")]
    Count { found: usize, expected: usize },

    #[error("point {index} is not finite")]
    NonFinite { index: usize },

    #[error("points {a} and {b} are {distance:.2}px apart, outside [{min}, {max}]")]
    NeighbourDistance {
        a: usize,
        b: usize,
        distance: f32,
        min: f32,
        max: f32,
    },

    #[error("cell {cell} is not a convex quad with the grid's winding")]
    Winding { cell: usize },

    #[error("point {index} lies outside the image")]
    OutsideImage { index: usize },

    #[error("corner interpolation failed")]
    Degenerate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyParams {
    /// Minimum distance between row/column neighbours (pixels).
    pub min_dist: f32,
    /// Maximum distance between row/column neighbours (pixels).
    pub max_dist: f32,
    pub min_border: f32,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            min_dist: 4.0,
            max_dist: 1000.0,
            min_border: MIN_DISTANCE_FROM_EDGE,
        }
    }
}

impl VerifyParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.min_dist >= 0.0 && self.max_dist > self.min_dist,
            "min_dist/max_dist",
            "need 0 <= min_dist < max_dist",
        )?;
        ensure(self.min_border >= 0.0, "min_border", "must be non-negative")
    }
}

/// Check a row-major `grid` of points: count, finiteness and the distance
/// between every pair of row and column neighbours.
pub fn check_pattern(
    points: &[Point2<f32>],
    grid: PatternSize,
    min_dist: f32,
    max_dist: f32,
) -> Result<(), GeometryViolation> {
    if points.len() != grid.cell_count() {
        return Err(GeometryViolation::Count {
            found: points.len(),
            expected: grid.cell_count(),
        });
    }
    if let Some(index) = points
        .iter()
        .position(|p| !p.x.is_finite() || !p.y.is_finite())
    {
        return Err(GeometryViolation::NonFinite { index });
    }

    let check = |a: usize, b: usize| {
        let distance = (points[a] - points[b]).norm();
        if distance < min_dist || distance > max_dist {
            Err(GeometryViolation::NeighbourDistance {
                a,
                b,
                distance,
                min: min_dist,
                max: max_dist,
            })
        } else {
            Ok(())
        }
    };
    for r in 0..grid.rows {
        for c in 0..grid.cols {
            let k = grid.index(r, c);
            if c + 1 < grid.cols {
                check(k, grid.index(r, c + 1))?;
            }
            if r + 1 < grid.rows {
                check(k, grid.index(r + 1, c))?;
            }
        }
    }
    Ok(())
}

pub fn verify_pattern(points: &[Point2<f32>], grid: PatternSize, min_dist: f32, max_dist: f32) -> bool {
    check_pattern(points, grid, min_dist, max_dist).is_ok()
}

#[inline]
fn cross(o: Point2<f32>, a: Point2<f32>, b: Point2<f32>) -> f32 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Every 2x2 block of the row-major `grid` must be a strictly convex quad
/// wound the same way as the first block.
fn check_winding(points: &[Point2<f32>], grid: PatternSize) -> Result<(), GeometryViolation> {
    let blocks = grid.cols - 1;
    let mut winding = 0.0f32;
    for r in 0..grid.rows - 1 {
        for c in 0..blocks {
            let q = [
                points[grid.index(r, c)],
                points[grid.index(r, c + 1)],
                points[grid.index(r + 1, c + 1)],
                points[grid.index(r + 1, c)],
            ];
            let turns = [
                cross(q[0], q[1], q[2]),
                cross(q[1], q[2], q[3]),
                cross(q[2], q[3], q[0]),
                cross(q[3], q[0], q[1]),
            ];
            if winding == 0.0 {
                winding = turns[0].signum();
            }
            if winding == 0.0 || turns.iter().any(|&t| t * winding <= 0.0) {
                return Err(GeometryViolation::Winding {
                    cell: r * blocks + c,
                });
            }
        }
    }
    Ok(())
}

/// [`check_pattern`] on the corner lattice of `size` cells, plus every cell
/// quad being strictly convex with the same winding as the first one.
pub fn check_corners(
    corners: &[Point2<f32>],
    size: PatternSize,
    min_dist: f32,
    max_dist: f32,
) -> Result<(), GeometryViolation> {
    let lattice = size.corner_grid();
    check_pattern(corners, lattice, min_dist, max_dist)?;
    check_winding(corners, lattice)
}

pub fn verify_corners(corners: &[Point2<f32>], size: PatternSize, min_dist: f32, max_dist: f32) -> bool {
    check_corners(corners, size, min_dist, max_dist).is_ok()
}

/// Ordered patch centres of a `size` grid: neighbour distances as in
/// [`check_pattern`], every centre inside `image`, and every 2x2 block of
/// centres a convex quad with a common winding.
pub fn check_patches(
    centres: &[Point2<f32>],
    size: PatternSize,
    image: ImageSize,
    min_dist: f32,
    max_dist: f32,
) -> Result<(), GeometryViolation> {
    check_pattern(centres, size, min_dist, max_dist)?;
    if let Some(index) = centres.iter().position(|p| !pattern_in_frame(&[*p], image, 0.0)) {
        return Err(GeometryViolation::OutsideImage { index });
    }
    check_winding(centres, size)
}

pub fn verify_patches(
    centres: &[Point2<f32>],
    size: PatternSize,
    image: ImageSize,
    min_dist: f32,
    max_dist: f32,
) -> bool {
    check_patches(centres, size, image, min_dist, max_dist).is_ok()
}

/// Every point at least `min_border` pixels inside the image.
pub fn pattern_in_frame(points: &[Point2<f32>], image: ImageSize, min_border: f32) -> bool {
    let max_x = image.width as f32 - 1.0 - min_border;
    let max_y = image.height as f32 - 1.0 - min_border;
    points.iter().all(|p| {
        p.x.is_finite()
            && p.y.is_finite()
            && p.x >= min_border
            && p.y >= min_border
            && p.x <= max_x
            && p.y <= max_y
    })
}
