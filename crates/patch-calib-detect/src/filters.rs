//! Patch filters that shrink the candidate set down to the expected grid.
//!
//! Every filter only reads [`Patch`] attributes. [`FilterPipeline`] runs them
//! in order and stops as soon as fewer patches than grid cells remain.

use crate::{Patch, Rejection};
use kiddo::{KdTree, SquaredEuclidean};
use log::debug;
use nalgebra::{Matrix2, Vector2};
use patch_calib_core::{ensure, ConfigError, PatternSize};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One stage of the pipeline.
pub trait PatchFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the surviving patches, preserving their relative order.
    fn apply(&self, patches: Vec<Patch>, size: PatternSize) -> Result<Vec<Patch>, Rejection>;
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    })
}

fn retain_flags(patches: Vec<Patch>, keep: &[bool]) -> Vec<Patch> {
    patches
        .into_iter()
        .zip(keep.iter())
        .filter_map(|(p, &k)| k.then_some(p))
        .collect()
}

/// Drops patches whose internal intensity variance is unusually high.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceFilter {
    /// Multiple of the median variance above which a patch is dropped.
    pub variance_factor: f32,
    /// The threshold never drops below this variance.
    pub variance_floor: f32,
}

impl Default for VarianceFilter {
    fn default() -> Self {
        Self {
            variance_factor: 4.0,
            variance_floor: 400.0,
        }
    }
}

impl PatchFilter for VarianceFilter {
    fn name(&self) -> &'static str {
        "variance"
    }

    fn apply(&self, patches: Vec<Patch>, _size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        let Some(med) = median(
            patches
                .iter()
                .map(|p| p.intensity_variance as f64)
                .collect(),
        ) else {
            return Ok(patches);
        };
        let threshold = (self.variance_factor as f64 * med).max(self.variance_floor as f64);
        Ok(patches
            .into_iter()
            .filter(|p| p.intensity_variance as f64 <= threshold)
            .collect())
    }
}

/// Drops patches too small, too elongated or too ragged to be pattern cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeFilter {
    pub min_area: f64,
    pub max_elongation: f64,
    pub min_compactness: f64,
}

impl Default for ShapeFilter {
    fn default() -> Self {
        Self {
            min_area: 20.0,
            max_elongation: 3.0,
            min_compactness: 0.5,
        }
    }
}

impl PatchFilter for ShapeFilter {
    fn name(&self) -> &'static str {
        "shape"
    }

    fn apply(&self, patches: Vec<Patch>, _size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        Ok(patches
            .into_iter()
            .filter(|p| {
                p.area >= self.min_area
                    && p.elongation().is_some_and(|e| e <= self.max_elongation)
                    && p.compactness() >= self.min_compactness
            })
            .collect())
    }
}

/// Resolves nested patches: an outer patch much larger than the one it
/// encloses swallows distinct cells and is dropped, otherwise the inner one
/// is a near duplicate and is dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclosureFilter {
    pub nested_area_ratio: f64,
}

impl Default for EnclosureFilter {
    fn default() -> Self {
        Self {
            nested_area_ratio: 2.0,
        }
    }
}

impl PatchFilter for EnclosureFilter {
    fn name(&self) -> &'static str {
        "enclosure"
    }

    fn apply(&self, patches: Vec<Patch>, _size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        let mut keep = vec![true; patches.len()];
        for (i, outer) in patches.iter().enumerate() {
            for (j, inner) in patches.iter().enumerate() {
                if i == j || outer.area < inner.area {
                    continue;
                }
                // Equal areas: only the lower index plays the outer role.
                if outer.area == inner.area && i > j {
                    continue;
                }
                if !outer.contains(inner.centroid) {
                    continue;
                }
                if outer.area / inner.area >= self.nested_area_ratio {
                    keep[i] = false;
                } else {
                    keep[j] = false;
                }
            }
        }
        Ok(retain_flags(patches, &keep))
    }
}

/// Drops patches isolated from the rest or with outlying area.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterFilter {
    /// Nearest neighbour farther than this multiple of the median spacing
    /// marks a patch as isolated.
    pub max_spacing_factor: f64,
    /// Accepted area band `[median / tol, median * tol]`.
    pub area_tolerance: f64,
}

impl Default for ClusterFilter {
    fn default() -> Self {
        Self {
            max_spacing_factor: 2.0,
            area_tolerance: 2.5,
        }
    }
}

/// Distance from each point to its nearest other point.
pub(crate) fn nearest_neighbour_distances(points: &[[f32; 2]]) -> Vec<f64> {
    if points.len() < 2 {
        return vec![f64::INFINITY; points.len()];
    }
    let mut tree: KdTree<f32, 2> = KdTree::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        tree.add(p, i as u64);
    }
    points
        .iter()
        .enumerate()
        .map(|(i, q)| {
            tree.nearest_n::<SquaredEuclidean>(q, 2)
                .into_iter()
                .filter(|nn| nn.item as usize != i)
                .map(|nn| (nn.distance as f64).sqrt())
                .next()
                .unwrap_or(f64::INFINITY)
        })
        .collect()
}

impl PatchFilter for ClusterFilter {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn apply(&self, patches: Vec<Patch>, _size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        if patches.len() < 2 {
            return Ok(patches);
        }
        let coords: Vec<[f32; 2]> = patches
            .iter()
            .map(|p| [p.centroid.x, p.centroid.y])
            .collect();
        let nn = nearest_neighbour_distances(&coords);
        let (Some(spacing), Some(area)) = (
            median(nn.clone()),
            median(patches.iter().map(|p| p.area).collect()),
        ) else {
            return Ok(patches);
        };

        let max_gap = self.max_spacing_factor * spacing;
        let (lo, hi) = (area / self.area_tolerance, area * self.area_tolerance);
        let keep: Vec<bool> = patches
            .iter()
            .zip(nn.iter())
            .map(|(p, &d)| d <= max_gap && p.area >= lo && p.area <= hi)
            .collect();
        debug!(
            "cluster: median spacing {:.2}px, median area {:.1}px², keeping {}/{}",
            spacing,
            area,
            keep.iter().filter(|&&k| k).count(),
            patches.len()
        );
        Ok(retain_flags(patches, &keep))
    }
}

/// Removes the most deviant patches one at a time until exactly
/// `rows * cols` remain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceCluster {
    /// Largest surplus that is reduced; more rejects the frame.
    pub max_excess: usize,
}

impl Default for ReduceCluster {
    fn default() -> Self {
        Self { max_excess: 8 }
    }
}

/// Combined deviation of each patch from the population: squared
/// Mahalanobis distance of the centroid plus squared z-scores of log-area
/// and mean intensity.
fn deviation_scores(patches: &[Patch]) -> Vec<f64> {
    let n = patches.len() as f64;
    let mean_pos = patches.iter().fold(Vector2::<f64>::zeros(), |acc, p| {
        acc + Vector2::new(p.centroid.x as f64, p.centroid.y as f64)
    }) / n;
    let cov = patches.iter().fold(Matrix2::<f64>::zeros(), |acc, p| {
        let d = Vector2::new(p.centroid.x as f64, p.centroid.y as f64) - mean_pos;
        acc + d * d.transpose()
    }) / n;
    let cov_inv = (cov + Matrix2::identity() * 1e-9)
        .try_inverse()
        .unwrap_or_else(Matrix2::zeros);

    let zscores = |values: Vec<f64>| -> Vec<f64> {
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        let sd = var.sqrt();
        values
            .into_iter()
            .map(|v| if sd > 1e-12 { (v - mean) / sd } else { 0.0 })
            .collect()
    };
    let z_area = zscores(patches.iter().map(|p| p.area.max(1e-9).ln()).collect());
    let z_int = zscores(patches.iter().map(|p| p.mean_intensity as f64).collect());

    patches
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let d = Vector2::new(p.centroid.x as f64, p.centroid.y as f64) - mean_pos;
            let mahalanobis = (d.transpose() * cov_inv * d)[(0, 0)];
            mahalanobis + z_area[i] * z_area[i] + z_int[i] * z_int[i]
        })
        .collect()
}

impl PatchFilter for ReduceCluster {
    fn name(&self) -> &'static str {
        "reduce"
    }

    fn apply(&self, mut patches: Vec<Patch>, size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        let expected = size.cell_count();
        if patches.len() <= expected {
            return Ok(patches);
        }
        let excess = patches.len() - expected;
        if excess > self.max_excess {
            return Err(Rejection::TooManyPatches {
                found: patches.len(),
                expected,
                max_excess: self.max_excess,
            });
        }
        while patches.len() > expected {
            let scores = deviation_scores(&patches);
            let worst = scores
                .iter()
                .enumerate()
                .fold((0usize, f64::NEG_INFINITY), |best, (i, &s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                })
                .0;
            patches.remove(worst);
        }
        Ok(patches)
    }
}

/// Parameters of the default filter stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub variance: VarianceFilter,
    pub shape: ShapeFilter,
    pub enclosure: EnclosureFilter,
    pub cluster: ClusterFilter,
    pub reduce: ReduceCluster,
}

impl FilterParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.variance.variance_factor > 0.0 && self.variance.variance_floor >= 0.0,
            "variance",
            "factor must be positive and floor non-negative",
        )?;
        ensure(
            self.shape.max_elongation >= 1.0,
            "shape.max_elongation",
            "must be at least 1",
        )?;
        ensure(
            (0.0..=1.0).contains(&self.shape.min_compactness),
            "shape.min_compactness",
            "must lie in [0, 1]",
        )?;
        ensure(
            self.enclosure.nested_area_ratio > 1.0,
            "enclosure.nested_area_ratio",
            "must be greater than 1",
        )?;
        ensure(
            self.cluster.max_spacing_factor >= 1.0,
            "cluster.max_spacing_factor",
            "must be at least 1",
        )?;
        ensure(
            self.cluster.area_tolerance >= 1.0,
            "cluster.area_tolerance",
            "must be at least 1",
        )
    }
}

/// Ordered list of filter stages.
pub struct FilterPipeline {
    stages: Vec<Box<dyn PatchFilter>>,
}

impl FilterPipeline {
    pub fn new(stages: Vec<Box<dyn PatchFilter>>) -> Self {
        Self { stages }
    }

    /// Variance, shape, enclosure, cluster, reduce.
    pub fn from_params(params: &FilterParams) -> Self {
        Self::new(vec![
            Box::new(params.variance.clone()),
            Box::new(params.shape.clone()),
            Box::new(params.enclosure.clone()),
            Box::new(params.cluster.clone()),
            Box::new(params.reduce.clone()),
        ])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, patches), fields(patches = patches.len()))
    )]
    pub fn run(&self, patches: Vec<Patch>, size: PatternSize) -> Result<Vec<Patch>, Rejection> {
        let expected = size.cell_count();
        let check = |stage: &'static str, found: usize| {
            if found < expected {
                Err(Rejection::InsufficientPatches {
                    stage,
                    found,
                    expected,
                })
            } else {
                Ok(())
            }
        };

        check("extract", patches.len())?;
        let mut current = patches;
        for stage in &self.stages {
            let before = current.len();
            current = stage.apply(current, size)?;
            debug!("filter {}: {} -> {}", stage.name(), before, current.len());
            check(stage.name(), current.len())?;
        }

        if current.len() > expected {
            return Err(Rejection::TooManyPatches {
                found: current.len(),
                expected,
                max_excess: 0,
            });
        }
        Ok(current)
    }
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::from_params(&FilterParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::tests::square_patch;
    use patch_calib_core::GrayImage;

    fn board_image() -> GrayImage {
        GrayImage::new(400, 400, 200)
    }

    fn grid_patches(img: &GrayImage, rows: i32, cols: i32, pitch: i32, side: i32) -> Vec<Patch> {
        let mut out = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                out.push(square_patch(&img.view(), 40 + c * pitch, 40 + r * pitch, side));
            }
        }
        out
    }

    #[test]
    fn variance_filter_drops_noisy_patch() {
        let mut img = board_image();
        // Checkerboard noise inside one square.
        for y in 40..60 {
            for x in 40..60 {
                img.set(x, y, if (x + y) % 2 == 0 { 0 } else { 255 });
            }
        }
        let patches = grid_patches(&img, 2, 2, 60, 20);
        let out = VarianceFilter::default()
            .apply(patches, PatternSize::new(2, 2).expect("size"))
            .expect("filter");
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|p| p.intensity_variance < 1.0));
    }

    #[test]
    fn shape_filter_drops_slivers() {
        let img = board_image();
        let mut patches = grid_patches(&img, 2, 2, 60, 20);
        let sliver = vec![
            nalgebra::Point2::new(200, 200),
            nalgebra::Point2::new(260, 200),
            nalgebra::Point2::new(260, 205),
            nalgebra::Point2::new(200, 205),
        ];
        patches.push(Patch::from_hull(sliver, &img.view()).expect("sliver"));
        let out = ShapeFilter::default()
            .apply(patches, PatternSize::new(2, 2).expect("size"))
            .expect("filter");
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn enclosure_drops_near_duplicate_inner_and_swallowing_outer() {
        let img = board_image();
        let size = PatternSize::new(2, 2).expect("size");

        let outer = square_patch(&img.view(), 100, 100, 24);
        let inner = square_patch(&img.view(), 102, 102, 20);
        let out = EnclosureFilter::default()
            .apply(vec![inner.clone(), outer.clone()], size)
            .expect("filter");
        assert_eq!(out, vec![outer]);

        let big = square_patch(&img.view(), 90, 90, 80);
        let out = EnclosureFilter::default()
            .apply(vec![big, inner.clone()], size)
            .expect("filter");
        assert_eq!(out, vec![inner]);
    }

    #[test]
    fn enclosure_is_order_independent() {
        let img = board_image();
        let size = PatternSize::new(2, 2).expect("size");
        let a = square_patch(&img.view(), 100, 100, 24);
        let b = square_patch(&img.view(), 102, 102, 20);
        let c = square_patch(&img.view(), 200, 200, 20);
        let f = EnclosureFilter::default();
        let ab = f.apply(vec![a.clone(), b.clone(), c.clone()], size).expect("filter");
        let ba = f.apply(vec![c.clone(), b, a], size).expect("filter");
        assert_eq!(ab.len(), 2);
        assert_eq!(ba.len(), 2);
        assert!(ab.contains(&c) && ba.contains(&c));
    }

    #[test]
    fn cluster_filter_drops_isolated_and_oversized() {
        let img = board_image();
        let mut patches = grid_patches(&img, 3, 3, 40, 20);
        patches.push(square_patch(&img.view(), 360, 360, 20));
        patches.push(square_patch(&img.view(), 160, 40, 38));
        let out = ClusterFilter::default()
            .apply(patches, PatternSize::new(3, 3).expect("size"))
            .expect("filter");
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn reduce_cluster_removes_outlier_and_rejects_large_excess() {
        let img = board_image();
        let size = PatternSize::new(3, 3).expect("size");
        let grid = grid_patches(&img, 3, 3, 40, 20);

        let mut patches = grid.clone();
        patches.insert(4, square_patch(&img.view(), 200, 40, 12));
        let out = ReduceCluster::default().apply(patches, size).expect("reduce");
        assert_eq!(out, grid);

        let mut crowded = grid.clone();
        for k in 0..9 {
            crowded.push(square_patch(&img.view(), 250 + 5 * k, 300, 4));
        }
        assert!(matches!(
            ReduceCluster::default().apply(crowded, size),
            Err(Rejection::TooManyPatches {
                found: 18,
                expected: 9,
                max_excess: 8
            })
        ));
    }

    #[test]
    fn pipeline_reports_insufficient_stage() {
        let img = board_image();
        let size = PatternSize::new(3, 3).expect("size");
        let patches = grid_patches(&img, 2, 3, 40, 20);
        let err = FilterPipeline::default().run(patches, size).unwrap_err();
        assert_eq!(
            err,
            Rejection::InsufficientPatches {
                stage: "extract",
                found: 6,
                expected: 9
            }
        );

        let mut patches = grid_patches(&img, 3, 3, 40, 20);
        patches[0] = square_patch(&img.view(), 40, 40, 3);
        let err = FilterPipeline::default().run(patches, size).unwrap_err();
        assert!(matches!(
            err,
            Rejection::InsufficientPatches { stage: "shape", found: 8, .. }
        ));
    }

    #[test]
    fn pipeline_passes_clean_grid() {
        let img = board_image();
        let size = PatternSize::new(3, 4).expect("size");
        let patches = grid_patches(&img, 3, 4, 40, 20);
        let out = FilterPipeline::default().run(patches.clone(), size).expect("pipeline");
        assert_eq!(out, patches);
        assert_eq!(
            FilterPipeline::default().stage_names(),
            vec!["variance", "shape", "enclosure", "cluster", "reduce"]
        );
    }
}
