use crate::{
    check_corners, check_patches, correct_patch_centres, find_best_corners,
    initial_refinement_of_corners, interpolate_corner_locations, pattern_in_frame,
    refine_corner_positions, solve_topology, FilterPipeline, FinderParams, GeometryViolation,
    PatchExtractor, RefinementOutcome, Rejection,
};
use log::{debug, info};
use nalgebra::Point2;
use patch_calib_core::{
    BlobDetector, ConfigError, CornerSearch, GrayImageView, ImageSize, PatternSize,
    SubpixelCornerSearch,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// How much to trust a returned detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Nominal,
    /// Corner refinement hit its iteration cap before converging.
    Degraded,
}

/// A detected pattern in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternDetection {
    /// Grid as laid out in the image.
    pub size: PatternSize,
    /// Board rows run along image x.
    pub transposed: bool,
    /// Patch centres, row-major, `rows * cols`.
    pub centres: Vec<Point2<f32>>,
    /// Refined cell corners, row-major, `(rows + 1) * (cols + 1)`.
    pub corners: Vec<Point2<f32>>,
    pub refinement: RefinementOutcome,
    /// Corners moved by the sub-pixel search.
    pub snapped: usize,
    pub confidence: Confidence,
}

/// Per-frame pipeline: extract, filter, order, correct centres, verify
/// patches, interpolate, refine, snap, verify corners.
pub struct PatternFinder {
    params: FinderParams,
    extractor: PatchExtractor,
    pipeline: FilterPipeline,
    corner_search: Box<dyn CornerSearch>,
}

impl std::fmt::Debug for PatternFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternFinder")
            .field("params", &self.params)
            .field("stages", &self.pipeline.stage_names())
            .finish_non_exhaustive()
    }
}

impl PatternFinder {
    pub fn new(params: FinderParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            extractor: PatchExtractor::new(Box::new(params.detector.clone())),
            pipeline: FilterPipeline::from_params(&params.filters),
            corner_search: Box::new(SubpixelCornerSearch::default()),
            params,
        })
    }

    pub fn with_blob_detector(mut self, detector: Box<dyn BlobDetector>) -> Self {
        self.extractor = PatchExtractor::new(detector);
        self
    }

    pub fn with_corner_search(mut self, search: Box<dyn CornerSearch>) -> Self {
        self.corner_search = search;
        self
    }

    pub fn with_pipeline(mut self, pipeline: FilterPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn params(&self) -> &FinderParams {
        &self.params
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, img), fields(width = img.width, height = img.height))
    )]
    pub fn find(&self, img: &GrayImageView<'_>) -> Result<PatternDetection, Rejection> {
        let size = self.params.size;
        let frame = ImageSize {
            width: img.width,
            height: img.height,
        };
        let verify = &self.params.verify;
        let patches = self.extractor.extract(img);
        let patches = self.pipeline.run(patches, size)?;

        let points: Vec<Point2<f32>> = patches.iter().map(|p| p.centroid).collect();
        let grid = solve_topology(&points, size)?;
        let mut centres = grid.ordered(&points);
        debug!(
            "topology solved: {}x{} (transposed: {})",
            grid.size.rows, grid.size.cols, grid.transposed
        );
        if self.params.centres.enabled {
            correct_patch_centres(img, &mut centres, grid.size, &self.params.centres);
        }
        check_patches(&centres, grid.size, frame, verify.min_dist, verify.max_dist)?;

        let mut corners = interpolate_corner_locations(&centres, grid.size)
            .ok_or(GeometryViolation::Degenerate)?;
        let search = self.corner_search.as_ref();
        let refinement_params = &self.params.refinement;
        initial_refinement_of_corners(
            img,
            &mut corners,
            grid.size,
            search,
            self.params.corners.mode,
            refinement_params.initial_search_fraction,
        );
        let refinement = refine_corner_positions(&mut corners, grid.size, refinement_params);
        let snapped = find_best_corners(img, &mut corners, grid.size, search, &self.params.corners);

        check_corners(&corners, grid.size, verify.min_dist, verify.max_dist)?;
        if !pattern_in_frame(&corners, frame, verify.min_border) {
            return Err(Rejection::OutOfFrame {
                min_border: verify.min_border,
            });
        }

        let confidence = if refinement.converged {
            Confidence::Nominal
        } else {
            Confidence::Degraded
        };
        info!(
            "pattern accepted: {} corners, {} snapped, {:?}",
            corners.len(),
            snapped,
            confidence
        );
        Ok(PatternDetection {
            size: grid.size,
            transposed: grid.transposed,
            centres,
            corners,
            refinement,
            snapped,
            confidence,
        })
    }
}
