//! Grid sizes, image sizes and small polygon helpers.

use crate::ConfigError;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Expected patch grid: `rows` cells top-to-bottom, `cols` cells left-to-right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    pub rows: usize,
    pub cols: usize,
}

impl PatternSize {
    /// Smallest grid the corner estimator can work with (one 2x2 block).
    pub const MIN_DIM: usize = 2;

    pub fn new(rows: usize, cols: usize) -> Result<Self, ConfigError> {
        let size = Self { rows, cols };
        size.validate()?;
        Ok(size)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows < Self::MIN_DIM || self.cols < Self::MIN_DIM {
            return Err(ConfigError::PatternSize {
                rows: self.rows,
                cols: self.cols,
                min: Self::MIN_DIM,
            });
        }
        Ok(())
    }

    /// Number of patches (cells).
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Size of the corner lattice: one more row and column than cells.
    #[inline]
    pub fn corner_grid(&self) -> PatternSize {
        PatternSize {
            rows: self.rows + 1,
            cols: self.cols + 1,
        }
    }

    #[inline]
    pub fn corner_count(&self) -> usize {
        (self.rows + 1) * (self.cols + 1)
    }

    #[inline]
    pub fn transposed(&self) -> PatternSize {
        PatternSize {
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Row-major linear index of `(row, col)`.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }
}

/// Image dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ImageDimensions { width, height });
        }
        Ok(Self { width, height })
    }

    #[inline]
    pub fn center(&self) -> Point2<f32> {
        Point2::new(
            (self.width as f32 - 1.0) * 0.5,
            (self.height as f32 - 1.0) * 0.5,
        )
    }

    /// Map a pixel position to `[0, 1)^2`; `None` outside the image.
    #[inline]
    pub fn normalize(&self, p: Point2<f32>) -> Option<(f32, f32)> {
        if !p.x.is_finite() || !p.y.is_finite() {
            return None;
        }
        let u = (p.x + 0.5) / self.width as f32;
        let v = (p.y + 0.5) / self.height as f32;
        if !(0.0..1.0).contains(&u) || !(0.0..1.0).contains(&v) {
            return None;
        }
        Some((u, v))
    }
}

/// Convex hull (Andrew's monotone chain), counter-clockwise in image
/// coordinates with y pointing down. Collinear points are dropped.
pub fn convex_hull(points: &[Point2<i32>]) -> Vec<Point2<i32>> {
    let mut pts: Vec<Point2<i32>> = points.to_vec();
    pts.sort_by(|a, b| (a.x, a.y).cmp(&(b.x, b.y)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    fn cross(o: &Point2<i32>, a: &Point2<i32>, b: &Point2<i32>) -> i64 {
        (a.x - o.x) as i64 * (b.y - o.y) as i64 - (a.y - o.y) as i64 * (b.x - o.x) as i64
    }

    let mut hull: Vec<Point2<i32>> = Vec::with_capacity(2 * pts.len());
    for p in pts.iter() {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower_len = hull.len() + 1;
    for p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

/// Signed shoelace area; positive for the winding produced by [`convex_hull`].
pub fn polygon_signed_area(poly: &[Point2<i32>]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for (i, a) in poly.iter().enumerate() {
        let b = &poly[(i + 1) % poly.len()];
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    acc as f64 * 0.5
}

pub fn polygon_perimeter(poly: &[Point2<i32>]) -> f64 {
    if poly.len() < 2 {
        return 0.0;
    }
    poly.iter()
        .enumerate()
        .map(|(i, a)| {
            let b = &poly[(i + 1) % poly.len()];
            let dx = (b.x - a.x) as f64;
            let dy = (b.y - a.y) as f64;
            (dx * dx + dy * dy).sqrt()
        })
        .sum()
}

/// Even-odd point-in-polygon test; points on the boundary count as inside
/// for axis-aligned edges through pixel centres.
pub fn point_in_polygon(p: Point2<f32>, poly: &[Point2<i32>]) -> bool {
    if poly.len() < 3 {
        return false;
    }
    if point_on_boundary(p, poly) {
        return true;
    }
    let (px, py) = (p.x as f64, p.y as f64);
    let mut inside = false;
    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let (xi, yi) = (poly[i].x as f64, poly[i].y as f64);
        let (xj, yj) = (poly[j].x as f64, poly[j].y as f64);
        if (yi > py) != (yj > py) {
            let x_cross = xj + (py - yj) * (xi - xj) / (yi - yj);
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn point_on_boundary(p: Point2<f32>, poly: &[Point2<i32>]) -> bool {
    let (px, py) = (p.x as f64, p.y as f64);
    poly.iter().enumerate().any(|(i, a)| {
        let b = &poly[(i + 1) % poly.len()];
        let (ax, ay, bx, by) = (a.x as f64, a.y as f64, b.x as f64, b.y as f64);
        let cross = (bx - ax) * (py - ay) - (by - ay) * (px - ax);
        if cross.abs() > 1e-9 {
            return false;
        }
        px >= ax.min(bx) - 1e-9
            && px <= ax.max(bx) + 1e-9
            && py >= ay.min(by) - 1e-9
            && py <= ay.max(by) + 1e-9
    })
}

/// Inclusive integer bounding box `(min, max)`.
pub fn polygon_bbox(poly: &[Point2<i32>]) -> Option<(Point2<i32>, Point2<i32>)> {
    let first = poly.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in poly.iter().skip(1) {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    Some((min, max))
}
