//! Assigns an unordered set of patch centroids to grid rows and columns.

use kiddo::{KdTree, SquaredEuclidean};
use log::debug;
use nalgebra::{Point2, Vector2};
use patch_calib_core::{estimate_homography, homography_from_4pt, Homography, PatternSize};
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, FRAC_PI_8};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TopologyError {
    #[error("expected {expected} points, got {found}")]
    Count { found: usize, expected: usize },

    #[error("could not determine grid axes")]
    Axes,

    #[error("degenerate grid homography")]
    Homography,

    #[error("point {index} falls outside the grid at cell ({row}, {col})")]
    OutOfGrid { index: usize, row: i64, col: i64 },

    #[error("points {kept} and {dropped} both fall in cell ({row}, {col})")]
    Collision {
        row: usize,
        col: usize,
        kept: usize,
        dropped: usize,
    },
}

/// Position of a cell within the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellRole {
    Corner,
    Edge,
    Interior,
}

pub fn cell_role(size: PatternSize, row: usize, col: usize) -> CellRole {
    let on_row_edge = row == 0 || row + 1 == size.rows;
    let on_col_edge = col == 0 || col + 1 == size.cols;
    match (on_row_edge, on_col_edge) {
        (true, true) => CellRole::Corner,
        (true, false) | (false, true) => CellRole::Edge,
        (false, false) => CellRole::Interior,
    }
}

/// Unit directions of the grid in the image: columns advance along
/// `col_axis` (mostly +x), rows along `row_axis` (mostly +y).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridAxes {
    pub col_axis: Vector2<f32>,
    pub row_axis: Vector2<f32>,
}

/// Result of topology solving.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridAssignment {
    /// Grid as laid out in the image (rows top-to-bottom).
    pub size: PatternSize,
    /// Board rows run along image x.
    pub transposed: bool,
    /// `order[row * cols + col]` is the input index of that cell's point.
    pub order: Vec<usize>,
}

impl GridAssignment {
    pub fn ordered(&self, points: &[Point2<f32>]) -> Vec<Point2<f32>> {
        self.order.iter().map(|&i| points[i]).collect()
    }

    pub fn roles(&self) -> Vec<CellRole> {
        (0..self.size.rows)
            .flat_map(|r| (0..self.size.cols).map(move |c| (r, c)))
            .map(|(r, c)| cell_role(self.size, r, c))
            .collect()
    }
}

/// Dominant grid directions from nearest-neighbour displacements.
///
/// Directions are folded modulo 90° by quadrupling their angle, each axis
/// is then refined from the displacements within 22.5° of it.
pub fn dominant_axes(points: &[Point2<f32>]) -> Option<GridAxes> {
    if points.len() < 2 {
        return None;
    }
    let mut tree: KdTree<f32, 2> = KdTree::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        tree.add(&[p.x, p.y], i as u64);
    }

    let mut dirs: Vec<Vector2<f32>> = Vec::new();
    for (i, p) in points.iter().enumerate() {
        let nn: Vec<(usize, f32)> = tree
            .nearest_n::<SquaredEuclidean>(&[p.x, p.y], 5)
            .into_iter()
            .filter(|n| n.item as usize != i && n.distance > 0.0)
            .map(|n| (n.item as usize, n.distance.sqrt()))
            .collect();
        let Some(d_min) = nn.iter().map(|&(_, d)| d).reduce(f32::min) else {
            continue;
        };
        for (j, d) in nn {
            if d <= 1.25 * d_min {
                dirs.push((points[j] - p) / d);
            }
        }
    }

    let (c4, s4) = dirs.iter().fold((0.0f32, 0.0f32), |(c, s), v| {
        let a = 4.0 * v.y.atan2(v.x);
        (c + a.cos(), s + a.sin())
    });
    if c4.hypot(s4) < 1e-3 * dirs.len().max(1) as f32 {
        return None;
    }
    let phi = s4.atan2(c4) / 4.0;

    let refine = |angle: f32| -> Vector2<f32> {
        let u = Vector2::new(angle.cos(), angle.sin());
        let cos_tol = FRAC_PI_8.cos();
        let sum = dirs.iter().fold(Vector2::zeros(), |acc, v| {
            let d = v.dot(&u);
            if d.abs() >= cos_tol {
                acc + v * d.signum()
            } else {
                acc
            }
        });
        let n = sum.norm();
        if n > 1e-6 {
            sum / n
        } else {
            u
        }
    };
    let a = refine(phi);
    let b = refine(phi + FRAC_PI_2);

    let (mut col_axis, mut row_axis) = if a.x.abs() >= b.x.abs() { (a, b) } else { (b, a) };
    if col_axis.x < 0.0 {
        col_axis = -col_axis;
    }
    if row_axis.y < 0.0 {
        row_axis = -row_axis;
    }
    if (col_axis.x * row_axis.y - col_axis.y * row_axis.x).abs() < 0.5 {
        return None;
    }
    Some(GridAxes { col_axis, row_axis })
}

#[inline]
fn cell_centre(col: usize, row: usize) -> Point2<f32> {
    Point2::new(col as f32 + 0.5, row as f32 + 0.5)
}

/// Bin every point through `img_to_unit`; rejects out-of-grid points and
/// shared cells (the point closer to the cell centre is reported as kept).
fn bin_points(
    points: &[Point2<f32>],
    visit: &[usize],
    img_to_unit: &Homography,
    size: PatternSize,
) -> Result<Vec<usize>, TopologyError> {
    let mut cells: Vec<Option<(usize, f32)>> = vec![None; size.cell_count()];
    let mut collision = None;

    for &i in visit {
        let q = img_to_unit
            .try_apply(points[i])
            .ok_or(TopologyError::Homography)?;
        let (col, row) = (q.x.floor() as i64, q.y.floor() as i64);
        if col < 0 || row < 0 || col >= size.cols as i64 || row >= size.rows as i64 {
            return Err(TopologyError::OutOfGrid { index: i, row, col });
        }
        let (row, col) = (row as usize, col as usize);
        let d = (q - cell_centre(col, row)).norm();
        let slot = &mut cells[size.index(row, col)];
        match *slot {
            None => *slot = Some((i, d)),
            Some((j, dj)) => {
                let (kept, dropped) = if d < dj { (i, j) } else { (j, i) };
                *slot = Some((kept, d.min(dj)));
                collision.get_or_insert(TopologyError::Collision {
                    row,
                    col,
                    kept,
                    dropped,
                });
            }
        }
    }
    if let Some(err) = collision {
        return Err(err);
    }
    cells
        .into_iter()
        .map(|c| c.map(|(i, _)| i).ok_or(TopologyError::Count {
            found: visit.len(),
            expected: size.cell_count(),
        }))
        .collect()
}

fn assign(
    points: &[Point2<f32>],
    visit: &[usize],
    axes: &GridAxes,
    size: PatternSize,
) -> Result<Vec<usize>, TopologyError> {
    let uv = |i: usize| {
        let p = points[i].coords;
        (p.dot(&axes.col_axis), p.dot(&axes.row_axis))
    };
    let pick = |key: &dyn Fn(usize) -> f32| -> Option<usize> {
        visit
            .iter()
            .copied()
            .fold(None, |best: Option<(usize, f32)>, i| {
                let k = key(i);
                match best {
                    Some((_, bk)) if bk >= k => best,
                    _ => Some((i, k)),
                }
            })
            .map(|(i, _)| i)
    };
    let sum = |i: usize| {
        let (u, v) = uv(i);
        u + v
    };
    let diff = |i: usize| {
        let (u, v) = uv(i);
        u - v
    };
    let tl = pick(&|i| -sum(i)).ok_or(TopologyError::Axes)?;
    let br = pick(&|i| sum(i)).ok_or(TopologyError::Axes)?;
    let tr = pick(&|i| diff(i)).ok_or(TopologyError::Axes)?;
    let bl = pick(&|i| -diff(i)).ok_or(TopologyError::Axes)?;

    let (r1, c1) = (size.rows - 1, size.cols - 1);
    let unit = [
        cell_centre(0, 0),
        cell_centre(c1, 0),
        cell_centre(c1, r1),
        cell_centre(0, r1),
    ];
    let img = [points[tl], points[tr], points[br], points[bl]];
    let seed = homography_from_4pt(&unit, &img).ok_or(TopologyError::Homography)?;
    let inv = seed.inverse().ok_or(TopologyError::Homography)?;
    let order = bin_points(points, visit, &inv, size)?;

    // Re-fit from every assignment and bin again.
    let unit_all: Vec<Point2<f32>> = (0..size.rows)
        .flat_map(|r| (0..size.cols).map(move |c| cell_centre(c, r)))
        .collect();
    let img_all: Vec<Point2<f32>> = order.iter().map(|&i| points[i]).collect();
    let refit = estimate_homography(&unit_all, &img_all)
        .and_then(|h| h.inverse())
        .ok_or(TopologyError::Homography)?;
    bin_points(points, visit, &refit, size)
}

/// Assign `rows * cols` points to grid cells.
///
/// Points are visited in `(y, x)` order so the result does not depend on
/// the input order. When the primary layout fails and the grid is not
/// square, the transposed layout is tried.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(points), fields(points = points.len(), rows = size.rows, cols = size.cols))
)]
pub fn solve_topology(
    points: &[Point2<f32>],
    size: PatternSize,
) -> Result<GridAssignment, TopologyError> {
    if points.len() != size.cell_count() {
        return Err(TopologyError::Count {
            found: points.len(),
            expected: size.cell_count(),
        });
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(TopologyError::Axes);
    }

    let mut visit: Vec<usize> = (0..points.len()).collect();
    visit.sort_by(|&a, &b| {
        points[a]
            .y
            .total_cmp(&points[b].y)
            .then(points[a].x.total_cmp(&points[b].x))
    });

    let axes = dominant_axes(points).ok_or(TopologyError::Axes)?;
    match assign(points, &visit, &axes, size) {
        Ok(order) => Ok(GridAssignment {
            size,
            transposed: false,
            order,
        }),
        Err(primary) if size.rows != size.cols => {
            debug!("primary layout failed ({primary}), trying transposed");
            let t = size.transposed();
            assign(points, &visit, &axes, t)
                .map(|order| GridAssignment {
                    size: t,
                    transposed: true,
                    order,
                })
                .map_err(|_| primary)
        }
        Err(e) => Err(e),
    }
}

/// Reorder points into row-major order from explicit per-point row and
/// column indices.
pub fn reorder_patches(
    points: &[Point2<f32>],
    size: PatternSize,
    rows: &[usize],
    cols: &[usize],
) -> Result<Vec<Point2<f32>>, TopologyError> {
    let expected = size.cell_count();
    for found in [points.len(), rows.len(), cols.len()] {
        if found != expected {
            return Err(TopologyError::Count { found, expected });
        }
    }

    let mut slots: Vec<Option<usize>> = vec![None; expected];
    for (i, (&r, &c)) in rows.iter().zip(cols.iter()).enumerate() {
        if r >= size.rows || c >= size.cols {
            return Err(TopologyError::OutOfGrid {
                index: i,
                row: r as i64,
                col: c as i64,
            });
        }
        let slot = &mut slots[size.index(r, c)];
        if let Some(kept) = *slot {
            return Err(TopologyError::Collision {
                row: r,
                col: c,
                kept,
                dropped: i,
            });
        }
        *slot = Some(i);
    }
    // Every slot is filled: `expected` distinct cells were written.
    Ok(slots.into_iter().flatten().map(|i| points[i]).collect())
}
