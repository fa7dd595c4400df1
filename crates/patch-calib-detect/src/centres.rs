//! Patch centre correction on the contrast-stretched image.

use log::debug;
use nalgebra::Point2;
use patch_calib_core::{ensure, sample_bilinear, ConfigError, GrayImageView, PatternSize};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentreCorrectionParams {
    pub enabled: bool,
    /// Window radius as a fraction of the distance to the nearest
    /// neighbouring centre.
    pub window_fraction: f32,
    pub max_iterations: usize,
    /// Corrections farther than this fraction of the neighbour distance are
    /// discarded.
    pub max_shift_fraction: f32,
    /// Minimum intensity range inside the window.
    pub min_contrast: f32,
}

impl Default for CentreCorrectionParams {
    fn default() -> Self {
        Self {
            enabled: true,
            window_fraction: 0.5,
            max_iterations: 5,
            max_shift_fraction: 0.25,
            min_contrast: 16.0,
        }
    }
}

impl CentreCorrectionParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.window_fraction > 0.0 && self.window_fraction <= 0.5,
            "window_fraction",
            "must lie in (0, 0.5]",
        )?;
        ensure(self.max_iterations >= 1, "max_iterations", "must be at least 1")?;
        ensure(
            self.max_shift_fraction > 0.0,
            "max_shift_fraction",
            "must be positive",
        )?;
        ensure(self.min_contrast >= 0.0, "min_contrast", "must be non-negative")
    }
}

/// Distance from centre `(r, c)` to its closest row/column neighbour.
fn neighbour_distance(centres: &[Point2<f32>], size: PatternSize, r: usize, c: usize) -> f32 {
    let p = centres[size.index(r, c)];
    let mut best = f32::INFINITY;
    let mut visit = |rr: usize, cc: usize| {
        best = best.min((centres[size.index(rr, cc)] - p).norm());
    };
    if r > 0 {
        visit(r - 1, c);
    }
    if r + 1 < size.rows {
        visit(r + 1, c);
    }
    if c > 0 {
        visit(r, c - 1);
    }
    if c + 1 < size.cols {
        visit(r, c + 1);
    }
    best
}

/// Centroid of the patch under a disc around `c`. Intensities are stretched
/// to `[0, 1]` over the disc; the patch side is the one the centre pixel
/// falls on.
fn stretched_centroid(
    img: &GrayImageView<'_>,
    c: Point2<f32>,
    radius: f32,
    min_contrast: f32,
) -> Option<Point2<f32>> {
    let x0 = (c.x - radius).floor().max(0.0) as i64;
    let y0 = (c.y - radius).floor().max(0.0) as i64;
    let x1 = ((c.x + radius).ceil() as i64).min(img.width as i64 - 1);
    let y1 = ((c.y + radius).ceil() as i64).min(img.height as i64 - 1);
    if x0 > x1 || y0 > y1 {
        return None;
    }

    let r2 = radius * radius;
    let mut samples = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let (dx, dy) = (x as f32 - c.x, y as f32 - c.y);
            if dx * dx + dy * dy <= r2 {
                samples.push((x as f32, y as f32, img.get(x as usize, y as usize) as f32));
            }
        }
    }
    let (lo, hi) = samples
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &(_, _, v)| {
            (lo.min(v), hi.max(v))
        });
    if hi - lo < min_contrast.max(1.0) {
        return None;
    }
    let dark = sample_bilinear(img, c.x, c.y) < 0.5 * (lo + hi);

    let (mut sw, mut sx, mut sy) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y, v) in samples {
        let s = (v - lo) / (hi - lo);
        let w = if dark { 1.0 - s } else { s } as f64;
        sw += w;
        sx += w * x as f64;
        sy += w * y as f64;
    }
    (sw > f64::EPSILON).then(|| Point2::new((sx / sw) as f32, (sy / sw) as f32))
}

/// Re-estimate every row-major patch centre as the centroid of its patch in
/// a disc scaled to the local grid spacing. Centres without enough contrast,
/// or whose correction would move them too far, are left alone. Returns the
/// number of centres moved.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip(img, centres, params), fields(rows = size.rows, cols = size.cols))
)]
pub fn correct_patch_centres(
    img: &GrayImageView<'_>,
    centres: &mut [Point2<f32>],
    size: PatternSize,
    params: &CentreCorrectionParams,
) -> usize {
    if centres.len() != size.cell_count() || size.cell_count() < 2 {
        return 0;
    }
    let original = centres.to_vec();
    let mut moved = 0;

    for r in 0..size.rows {
        for c in 0..size.cols {
            let k = size.index(r, c);
            let spacing = neighbour_distance(&original, size, r, c);
            if !spacing.is_finite() {
                continue;
            }
            let radius = params.window_fraction * spacing;

            let mut p = original[k];
            for _ in 0..params.max_iterations {
                let Some(next) = stretched_centroid(img, p, radius, params.min_contrast) else {
                    break;
                };
                let step = (next - p).norm();
                p = next;
                if step < 0.01 {
                    break;
                }
            }

            let shift = (p - original[k]).norm();
            if shift > 0.0 && shift <= params.max_shift_fraction * spacing {
                centres[k] = p;
                moved += 1;
            }
        }
    }
    debug!("corrected {moved} of {} patch centres", centres.len());
    moved
}
