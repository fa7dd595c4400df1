//! Running coverage statistics over accepted point sets.
//!
//! Three histograms are kept per session: a fine occupancy map over the
//! image, a coarse bin map counting how many sets touched each bin, and a
//! radial histogram of distances from the image centre. A candidate set is
//! scored by how much of it lands where the histograms are still empty,
//! weighted by a Gaussian prior over the image.

use log::debug;
use nalgebra::Point2;
use patch_calib_core::{ensure, ConfigError, ImageSize};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Radially symmetric weight over normalized image coordinates in `[-1, 1]^2`:
/// `floor + (1 - floor) * exp(-r^2 / (2 sigma^2))`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianPrior {
    pub sigma: f64,
    pub floor: f64,
}

impl Default for GaussianPrior {
    fn default() -> Self {
        Self {
            sigma: 0.6,
            floor: 0.5,
        }
    }
}

impl GaussianPrior {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.sigma.is_finite() && self.sigma > 0.0,
            "prior.sigma",
            "must be finite and > 0",
        )?;
        ensure(
            (0.0..=1.0).contains(&self.floor),
            "prior.floor",
            "must lie in [0, 1]",
        )
    }

    #[inline]
    pub fn weight(&self, x: f64, y: f64) -> f64 {
        let r2 = x * x + y * y;
        self.floor + (1.0 - self.floor) * (-r2 / (2.0 * self.sigma * self.sigma)).exp()
    }
}

/// Histogram resolutions and score weights.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageParams {
    /// Occupancy map columns.
    pub map_cols: usize,
    /// Occupancy map rows.
    pub map_rows: usize,
    pub bin_cols: usize,
    pub bin_rows: usize,
    /// Radial histogram bins over `[0, 1]` half-diagonals.
    pub radial_bins: usize,
    pub distribution_weight: f64,
    pub radial_weight: f64,
    pub prior: GaussianPrior,
}

impl Default for CoverageParams {
    fn default() -> Self {
        Self {
            map_cols: 32,
            map_rows: 24,
            bin_cols: 8,
            bin_rows: 6,
            radial_bins: 32,
            distribution_weight: 0.7,
            radial_weight: 0.3,
            prior: GaussianPrior::default(),
        }
    }
}

impl CoverageParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.map_cols > 0 && self.map_rows > 0,
            "map_cols/map_rows",
            "must be > 0",
        )?;
        ensure(
            self.bin_cols > 0 && self.bin_rows > 0,
            "bin_cols/bin_rows",
            "must be > 0",
        )?;
        ensure(self.radial_bins > 0, "radial_bins", "must be > 0")?;
        ensure(
            self.distribution_weight.is_finite() && self.distribution_weight >= 0.0,
            "distribution_weight",
            "must be finite and >= 0",
        )?;
        ensure(
            self.radial_weight.is_finite() && self.radial_weight >= 0.0,
            "radial_weight",
            "must be finite and >= 0",
        )?;
        self.prior.validate()
    }
}

/// Where one point lands in each histogram.
#[derive(Clone, Copy, Debug)]
struct Placement {
    map: usize,
    bin: usize,
    radial: usize,
    weight: f64,
}

#[inline]
fn cell(t: f32, n: usize) -> usize {
    ((t * n as f32) as usize).min(n - 1)
}

/// Session-wide coverage state. Counts only ever grow until [`reset`].
///
/// [`reset`]: CoverageAccumulator::reset
#[derive(Clone, Debug, PartialEq)]
pub struct CoverageAccumulator {
    image: ImageSize,
    params: CoverageParams,
    distribution: Vec<u32>,
    bins: Vec<u32>,
    radial: Vec<u32>,
    sets: usize,
}

impl CoverageAccumulator {
    pub fn new(image: ImageSize, params: CoverageParams) -> Result<Self, ConfigError> {
        if image.width == 0 || image.height == 0 {
            return Err(ConfigError::ImageDimensions {
                width: image.width,
                height: image.height,
            });
        }
        params.validate()?;
        Ok(Self {
            distribution: vec![0; params.map_cols * params.map_rows],
            bins: vec![0; params.bin_cols * params.bin_rows],
            radial: vec![0; params.radial_bins],
            image,
            params,
            sets: 0,
        })
    }

    pub fn with_defaults(image: ImageSize) -> Result<Self, ConfigError> {
        Self::new(image, CoverageParams::default())
    }

    pub fn image_size(&self) -> ImageSize {
        self.image
    }

    pub fn params(&self) -> &CoverageParams {
        &self.params
    }

    /// Row-major `map_rows x map_cols` occupancy counts.
    pub fn distribution_map(&self) -> &[u32] {
        &self.distribution
    }

    /// Row-major `bin_rows x bin_cols` set counts.
    pub fn bin_map(&self) -> &[u32] {
        &self.bins
    }

    pub fn radial_distribution(&self) -> &[u32] {
        &self.radial
    }

    /// Number of sets passed to [`accumulate`](Self::accumulate).
    pub fn accumulated_sets(&self) -> usize {
        self.sets
    }

    pub fn reset(&mut self) {
        self.distribution.iter_mut().for_each(|c| *c = 0);
        self.bins.iter_mut().for_each(|c| *c = 0);
        self.radial.iter_mut().for_each(|c| *c = 0);
        self.sets = 0;
    }

    fn place(&self, p: Point2<f32>) -> Option<Placement> {
        let (u, v) = self.image.normalize(p)?;
        let cfg = &self.params;

        let c = self.image.center();
        let half_diag =
            0.5 * ((self.image.width as f32).powi(2) + (self.image.height as f32).powi(2)).sqrt();
        let r = ((p.x - c.x).powi(2) + (p.y - c.y).powi(2)).sqrt() / half_diag;

        Some(Placement {
            map: cell(v, cfg.map_rows) * cfg.map_cols + cell(u, cfg.map_cols),
            bin: cell(v, cfg.bin_rows) * cfg.bin_cols + cell(u, cfg.bin_cols),
            radial: cell(r.min(1.0), cfg.radial_bins),
            weight: cfg.prior.weight(2.0 * u as f64 - 1.0, 2.0 * v as f64 - 1.0),
        })
    }

    /// Mean prior-weighted novelty of `points` against the current counts.
    ///
    /// Novelty of a count `c` is `1 / (1 + c)^2`. Points outside the image
    /// are skipped; an empty (or fully outside) set scores `0`.
    pub fn obtain_set_score(&self, points: &[Point2<f32>]) -> f64 {
        let novelty = |c: u32| 1.0 / (1.0 + c as f64).powi(2);
        let alpha = self.params.distribution_weight;
        let beta = self.params.radial_weight;

        let mut sum = 0.0;
        let mut n = 0usize;
        for pl in points.iter().filter_map(|&p| self.place(p)) {
            sum += pl.weight
                * (alpha * novelty(self.distribution[pl.map])
                    + beta * novelty(self.radial[pl.radial]));
            n += 1;
        }
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// One count per point in the occupancy map.
    pub fn add_to_distribution_map(&mut self, points: &[Point2<f32>]) {
        for p in points {
            if let Some(pl) = self.place(*p) {
                self.distribution[pl.map] = self.distribution[pl.map].saturating_add(1);
            }
        }
    }

    /// One count per touched bin, regardless of how many points landed there.
    pub fn add_to_bin_map(&mut self, points: &[Point2<f32>]) {
        let mut touched = vec![false; self.bins.len()];
        for p in points {
            if let Some(pl) = self.place(*p) {
                touched[pl.bin] = true;
            }
        }
        for (count, hit) in self.bins.iter_mut().zip(touched) {
            if hit {
                *count = count.saturating_add(1);
            }
        }
    }

    pub fn add_to_radial_distribution(&mut self, points: &[Point2<f32>]) {
        for p in points {
            if let Some(pl) = self.place(*p) {
                self.radial[pl.radial] = self.radial[pl.radial].saturating_add(1);
            }
        }
    }

    /// Accept a set into all three histograms.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, points), fields(points = points.len()))
    )]
    pub fn accumulate(&mut self, points: &[Point2<f32>]) {
        self.add_to_distribution_map(points);
        self.add_to_bin_map(points);
        self.add_to_radial_distribution(points);
        self.sets += 1;
        debug!(
            "accumulated set #{} ({} points), bin coverage {:.3}",
            self.sets,
            points.len(),
            self.coverage_fraction()
        );
    }

    /// Fraction of coarse bins touched by at least one set.
    pub fn coverage_fraction(&self) -> f64 {
        let touched = self.bins.iter().filter(|&&c| c > 0).count();
        touched as f64 / self.bins.len() as f64
    }
}

/// A [`CoverageAccumulator`] shared between threads: many scorers, one
/// writer at a time.
#[derive(Debug)]
pub struct SharedCoverage {
    inner: RwLock<CoverageAccumulator>,
}

impl SharedCoverage {
    pub fn new(coverage: CoverageAccumulator) -> Self {
        Self {
            inner: RwLock::new(coverage),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CoverageAccumulator> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CoverageAccumulator> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn score(&self, points: &[Point2<f32>]) -> f64 {
        self.read().obtain_set_score(points)
    }

    /// Score and accumulate under a single write lock; returns the gain.
    pub fn accept(&self, points: &[Point2<f32>]) -> f64 {
        let mut guard = self.write();
        let gain = guard.obtain_set_score(points);
        guard.accumulate(points);
        gain
    }

    pub fn snapshot(&self) -> CoverageAccumulator {
        self.read().clone()
    }

    pub fn into_inner(self) -> CoverageAccumulator {
        self.inner.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vga() -> CoverageAccumulator {
        CoverageAccumulator::with_defaults(ImageSize {
            width: 640,
            height: 480,
        })
        .unwrap()
    }

    fn patch(x0: f32, y0: f32) -> Vec<Point2<f32>> {
        (0..3)
            .flat_map(move |r| {
                (0..3).map(move |c| Point2::new(x0 + 20.0 * c as f32, y0 + 20.0 * r as f32))
            })
            .collect()
    }

    #[test]
    fn prior_peaks_at_centre() {
        let prior = GaussianPrior::default();
        assert_relative_eq!(prior.weight(0.0, 0.0), 1.0);
        assert!(prior.weight(1.0, 1.0) < prior.weight(0.5, 0.0));
        assert!(prior.weight(1.0, 1.0) >= prior.floor);
    }

    #[test]
    fn empty_set_scores_zero() {
        let cov = vga();
        assert_eq!(cov.obtain_set_score(&[]), 0.0);
        let outside = [Point2::new(-5.0, 10.0), Point2::new(700.0, 10.0)];
        assert_eq!(cov.obtain_set_score(&outside), 0.0);
    }

    #[test]
    fn fresh_accumulator_scores_prior_mean() {
        let cov = vga();
        let c = cov.image_size().center();
        let score = cov.obtain_set_score(&[c]);
        assert_relative_eq!(score, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn accepted_region_loses_novelty() {
        let mut cov = vga();
        let set = patch(300.0, 220.0);
        let before = cov.obtain_set_score(&set);
        cov.accumulate(&set);
        let after = cov.obtain_set_score(&set);
        assert!(after < 0.5 * before, "before={before}, after={after}");

        let elsewhere = patch(40.0, 40.0);
        assert!(cov.obtain_set_score(&elsewhere) > after);
    }

    #[test]
    fn bin_map_counts_sets_not_points() {
        let mut cov = vga();
        let dense: Vec<_> = (0..10).map(|i| Point2::new(10.0 + i as f32, 10.0)).collect();
        cov.add_to_bin_map(&dense);
        assert_eq!(cov.bin_map()[0], 1);
        cov.add_to_distribution_map(&dense);
        assert_eq!(cov.distribution_map().iter().sum::<u32>(), 10);
    }

    #[test]
    fn coverage_fraction_and_reset() {
        let mut cov = vga();
        assert_eq!(cov.coverage_fraction(), 0.0);
        cov.accumulate(&[Point2::new(1.0, 1.0), Point2::new(630.0, 470.0)]);
        assert_relative_eq!(cov.coverage_fraction(), 2.0 / 48.0);
        assert_eq!(cov.accumulated_sets(), 1);
        cov.reset();
        assert_eq!(cov.coverage_fraction(), 0.0);
        assert_eq!(cov.accumulated_sets(), 0);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        let bad = CoverageParams {
            map_cols: 0,
            ..CoverageParams::default()
        };
        assert!(CoverageAccumulator::new(size, bad).is_err());
        let bad_prior = CoverageParams {
            prior: GaussianPrior {
                sigma: 0.0,
                floor: 0.5,
            },
            ..CoverageParams::default()
        };
        assert!(CoverageAccumulator::new(size, bad_prior).is_err());
        let empty = ImageSize {
            width: 0,
            height: 480,
        };
        assert!(matches!(
            CoverageAccumulator::with_defaults(empty),
            Err(ConfigError::ImageDimensions { .. })
        ));
    }

    #[test]
    fn shared_coverage_accepts_and_scores() {
        let shared = SharedCoverage::new(vga());
        let set = patch(300.0, 220.0);
        let first = shared.score(&set);
        let gain = shared.accept(&set);
        assert_relative_eq!(first, gain);
        assert!(shared.score(&set) < gain);
        assert_eq!(shared.into_inner().accumulated_sets(), 1);
    }
}
