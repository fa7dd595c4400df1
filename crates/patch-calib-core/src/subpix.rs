//! Sub-pixel corner search seam.

use crate::{sample_bilinear, ConfigError, GrayImageView};
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Corner model used when snapping an estimate to image evidence.
///
/// Integer codes follow the legacy finder numbering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CornerSearchMode {
    /// Saddle corner, gradient-orthogonality solve.
    Chessboard,
    /// Light crossing between dark patches, bright-weighted centroid.
    #[default]
    Mask,
    /// Gradient-orthogonality solve over a doubled window.
    Extended,
    /// Dark crossing between light patches, dark-weighted centroid.
    Inverted,
    /// As [`Mask`](Self::Mask), but only interior lattice corners are
    /// snapped; boundary corners keep their estimate.
    InnerMask,
    /// Thermal chessboard: gradient-orthogonality solve on the inverted image.
    HeatedChessboard,
}

impl CornerSearchMode {
    pub const fn code(self) -> u32 {
        match self {
            Self::Chessboard => 0,
            Self::Mask => 3,
            Self::Extended => 5,
            Self::Inverted => 10,
            Self::InnerMask => 8,
            Self::HeatedChessboard => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, ConfigError> {
        match code {
            0 => Ok(Self::Chessboard),
            3 => Ok(Self::Mask),
            5 => Ok(Self::Extended),
            10 => Ok(Self::Inverted),
            8 => Ok(Self::InnerMask),
            2 => Ok(Self::HeatedChessboard),
            other => Err(ConfigError::parameter(
                "corner_search_mode",
                format!("unknown finder code {other}"),
            )),
        }
    }

    /// Search window scale relative to the requested radius.
    pub const fn window_scale(self) -> f32 {
        match self {
            Self::Extended => 2.0,
            _ => 1.0,
        }
    }

    /// Whether boundary lattice corners are left to the geometric refinement.
    pub const fn interior_only(self) -> bool {
        matches!(self, Self::InnerMask)
    }
}

/// Snaps a corner estimate to the image within a search radius.
pub trait CornerSearch: Send + Sync {
    /// `None` when no reliable corner is found, or when the result lies
    /// farther from `estimate` than the search window.
    fn search(
        &self,
        img: &GrayImageView<'_>,
        estimate: Point2<f32>,
        radius: f32,
        mode: CornerSearchMode,
    ) -> Option<Point2<f32>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubpixelCornerSearch {
    pub max_iterations: usize,
    /// Stop once an iteration moves the point less than this (pixels).
    pub epsilon: f32,
}

impl Default for SubpixelCornerSearch {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            epsilon: 0.01,
        }
    }
}

impl SubpixelCornerSearch {
    fn iterate(
        &self,
        estimate: Point2<f32>,
        mut step: impl FnMut(Point2<f32>) -> Option<Point2<f32>>,
    ) -> Option<Point2<f32>> {
        let mut c = estimate;
        for _ in 0..self.max_iterations.max(1) {
            let next = step(c)?;
            let moved = (next - c).norm();
            c = next;
            if moved < self.epsilon {
                break;
            }
        }
        Some(c)
    }
}

impl CornerSearch for SubpixelCornerSearch {
    fn search(
        &self,
        img: &GrayImageView<'_>,
        estimate: Point2<f32>,
        radius: f32,
        mode: CornerSearchMode,
    ) -> Option<Point2<f32>> {
        if radius.is_nan() || radius <= 0.0 || !estimate.x.is_finite() || !estimate.y.is_finite() {
            return None;
        }
        let window = radius * mode.window_scale();
        let half = window.round().max(1.0) as i32;

        let refined = match mode {
            CornerSearchMode::Chessboard | CornerSearchMode::Extended => self.iterate(estimate, |c| {
                gradient_step(|x, y| sample_bilinear(img, x, y), c, half)
            }),
            CornerSearchMode::HeatedChessboard => self.iterate(estimate, |c| {
                gradient_step(|x, y| 255.0 - sample_bilinear(img, x, y), c, half)
            }),
            CornerSearchMode::Mask | CornerSearchMode::InnerMask => {
                self.iterate(estimate, |c| weighted_centroid_step(img, c, half, true))
            }
            CornerSearchMode::Inverted => {
                self.iterate(estimate, |c| weighted_centroid_step(img, c, half, false))
            }
        }?;

        let ok = refined.x.is_finite()
            && refined.y.is_finite()
            && (refined - estimate).norm() <= window
            && img.contains(refined.x, refined.y);
        ok.then_some(refined)
    }
}

/// One gradient-orthogonality update: the point `c` minimizing
/// `sum_q w(q) (g(q) . (q - c))^2` over the window of `sample`.
fn gradient_step(
    sample: impl Fn(f32, f32) -> f32,
    c: Point2<f32>,
    half: i32,
) -> Option<Point2<f32>> {
    let sigma = half as f32;
    let mut a = Matrix2::<f64>::zeros();
    let mut b = Vector2::<f64>::zeros();

    for dy in -half..=half {
        for dx in -half..=half {
            let qx = c.x + dx as f32;
            let qy = c.y + dy as f32;
            let gx = 0.5 * (sample(qx + 1.0, qy) - sample(qx - 1.0, qy));
            let gy = 0.5 * (sample(qx, qy + 1.0) - sample(qx, qy - 1.0));
            let r2 = (dx * dx + dy * dy) as f32;
            let w = (-r2 / (2.0 * sigma * sigma)).exp() as f64;

            let (gx, gy) = (gx as f64, gy as f64);
            let gxx = w * gx * gx;
            let gxy = w * gx * gy;
            let gyy = w * gy * gy;
            a[(0, 0)] += gxx;
            a[(0, 1)] += gxy;
            a[(1, 0)] += gxy;
            a[(1, 1)] += gyy;
            b[0] += gxx * qx as f64 + gxy * qy as f64;
            b[1] += gxy * qx as f64 + gyy * qy as f64;
        }
    }

    // Both gradient directions must be present.
    let det = a.determinant();
    if det.abs() < 1e-6 * (a.trace() * a.trace()).max(1e-12) {
        return None;
    }
    let sol = a.try_inverse()? * b;
    Some(Point2::new(sol[0] as f32, sol[1] as f32))
}

/// One weighted-centroid update; weights are intensity above the window
/// minimum (`bright`) or below the window maximum.
fn weighted_centroid_step(
    img: &GrayImageView<'_>,
    c: Point2<f32>,
    half: i32,
    bright: bool,
) -> Option<Point2<f32>> {
    let side = (2 * half + 1) as usize;
    let mut samples = Vec::with_capacity(side * side);
    for dy in -half..=half {
        for dx in -half..=half {
            let q = Point2::new(c.x + dx as f32, c.y + dy as f32);
            samples.push((q, sample_bilinear(img, q.x, q.y)));
        }
    }

    let (lo, hi) = samples
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &(_, v)| {
            (lo.min(v), hi.max(v))
        });
    if hi - lo < 1.0 {
        return None;
    }

    let (mut sw, mut sx, mut sy) = (0.0f64, 0.0f64, 0.0f64);
    for (q, v) in samples {
        let w = if bright { v - lo } else { hi - v } as f64;
        sw += w;
        sx += w * q.x as f64;
        sy += w * q.y as f64;
    }
    if sw <= f64::EPSILON {
        return None;
    }
    Some(Point2::new((sx / sw) as f32, (sy / sw) as f32))
}
