//! A calibration session: detect over many frames, keep the accepted ones,
//! then pick the subset that best covers the image.

use log::{debug, info};
use nalgebra::Point2;
use patch_calib_core::{
    ensure, ConfigError, FrameScope, GrayImageView, ImageSize, PatternSize,
};
use patch_calib_detect::{FinderParams, PatternDetection, PatternFinder, Rejection};
use patch_calib_select::{
    random_culling, CoverageAccumulator, CoverageParams, OptimizationMode, SelectError,
    Selection, SelectionParams, SetOptimizer,
};
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default cap on the candidate pool before selection.
pub const MAX_CANDIDATE_PATTERNS: usize = 100;

/// Default cap on accepted frames held between detection batches.
pub const MAX_PATTERNS_TO_KEEP: usize = 500;

fn default_max_candidates() -> usize {
    MAX_CANDIDATE_PATTERNS
}

fn default_max_pool() -> usize {
    MAX_PATTERNS_TO_KEEP
}

/// Everything a session needs, loadable from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Frame dimensions the coverage maps are laid over.
    pub image: ImageSize,
    pub finder: FinderParams,
    #[serde(default)]
    pub coverage: CoverageParams,
    #[serde(default)]
    pub selection: SelectionParams,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Pool size beyond which accepted frames are randomly culled on
    /// insertion.
    #[serde(default = "default_max_pool")]
    pub max_pool: usize,
    /// Seed for pool culling.
    #[serde(default)]
    pub cull_seed: u64,
}

impl SessionConfig {
    pub fn new(image: ImageSize, size: PatternSize) -> Self {
        Self {
            image,
            finder: FinderParams::new(size),
            coverage: CoverageParams::default(),
            selection: SelectionParams::default(),
            max_candidates: MAX_CANDIDATE_PATTERNS,
            max_pool: MAX_PATTERNS_TO_KEEP,
            cull_seed: 0,
        }
    }

    pub fn with_mode(mut self, mode: OptimizationMode) -> Self {
        self.selection.mode = mode;
        self
    }
}

/// A frame whose pattern was found and verified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcceptedFrame {
    pub name: String,
    pub detection: PatternDetection,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RejectedFrame {
    pub name: String,
    pub reason: Rejection,
}

/// Outcome of one [`CalibrationSession::detect_frames`] call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FrameSummary {
    pub accepted: usize,
    pub rejected: Vec<RejectedFrame>,
}

impl FrameSummary {
    pub fn processed(&self) -> usize {
        self.accepted + self.rejected.len()
    }
}

/// One selected frame as handed to the calibration solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedFrame {
    pub name: String,
    pub gain: f64,
    pub corners: Vec<Point2<f32>>,
}

/// Serializable summary of the last selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    pub mode: OptimizationMode,
    pub pattern: PatternSize,
    pub candidates: usize,
    pub aggregate: f64,
    pub coverage_fraction: f64,
    pub frames: Vec<SelectedFrame>,
}

/// Owns the finder, the candidate pool and the coverage state of one
/// calibration run.
#[derive(Debug)]
pub struct CalibrationSession {
    config: SessionConfig,
    finder: PatternFinder,
    optimizer: SetOptimizer,
    coverage: CoverageAccumulator,
    pool: Vec<AcceptedFrame>,
    selection: Option<Selection>,
}

impl CalibrationSession {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        ensure(config.max_candidates > 0, "max_candidates", "must be > 0")?;
        ensure(
            config.max_pool >= config.max_candidates,
            "max_pool",
            "must be >= max_candidates",
        )?;
        let finder = PatternFinder::new(config.finder.clone())?;
        let optimizer = SetOptimizer::new(config.selection.clone())?;
        let coverage = CoverageAccumulator::new(config.image, config.coverage.clone())?;
        Ok(Self {
            config,
            finder,
            optimizer,
            coverage,
            pool: Vec::new(),
            selection: None,
        })
    }

    /// Replace the finder, e.g. one with a custom blob detector.
    pub fn with_finder(mut self, finder: PatternFinder) -> Self {
        self.finder = finder;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn finder(&self) -> &PatternFinder {
        &self.finder
    }

    pub fn pool(&self) -> &[AcceptedFrame] {
        &self.pool
    }

    pub fn coverage(&self) -> &CoverageAccumulator {
        &self.coverage
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Run the finder on every frame in parallel, then append accepted frames
    /// to the pool in input order. Frames whose size differs from the
    /// session's image size are rejected without detection.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, frames), fields(frames = frames.len()))
    )]
    pub fn detect_frames<S>(&mut self, frames: &[(S, GrayImageView<'_>)]) -> FrameSummary
    where
        S: AsRef<str> + Sync,
    {
        let expected = self.config.image;
        let finder = &self.finder;
        let results: Vec<(String, Result<PatternDetection, Rejection>)> = frames
            .par_iter()
            .map(|(name, img)| {
                let name = name.as_ref();
                let _scope = FrameScope::enter(name);
                #[cfg(feature = "tracing")]
                let _span = tracing::info_span!("frame", name).entered();
                let result = if img.width != expected.width || img.height != expected.height {
                    Err(Rejection::ImageSize {
                        width: img.width,
                        height: img.height,
                        expected_width: expected.width,
                        expected_height: expected.height,
                    })
                } else {
                    finder.find(img)
                };
                (name.to_owned(), result)
            })
            .collect();

        let mut summary = FrameSummary::default();
        for (name, result) in results {
            match result {
                Ok(detection) => {
                    self.add_detection(name, detection);
                    summary.accepted += 1;
                }
                Err(reason) => {
                    debug!("{name}: rejected ({})", reason.kind());
                    summary.rejected.push(RejectedFrame { name, reason });
                }
            }
        }
        info!(
            "detected {} of {} frames (pool: {})",
            summary.accepted,
            summary.processed(),
            self.pool.len()
        );
        summary
    }

    /// Add a detection produced elsewhere. A pool grown past `max_pool` is
    /// culled back to it.
    pub fn add_detection(&mut self, name: impl Into<String>, detection: PatternDetection) {
        self.pool.push(AcceptedFrame {
            name: name.into(),
            detection,
        });
        self.selection = None;
        if self.pool.len() > self.config.max_pool {
            self.cull(self.config.max_pool);
        }
    }

    /// Randomly thin the pool to at most `max` frames, keeping their order.
    /// Returns the number of frames dropped.
    pub fn cull(&mut self, max: usize) -> usize {
        let before = self.pool.len();
        if before <= max {
            return 0;
        }
        let mut rng = StdRng::seed_from_u64(self.config.cull_seed);
        self.pool = random_culling(std::mem::take(&mut self.pool), max, &mut rng);
        self.selection = None;
        let dropped = before - self.pool.len();
        info!("culled {dropped} of {before} candidate frames");
        dropped
    }

    /// [`cull`](Self::cull) down to the configured `max_candidates`.
    pub fn cull_to_limit(&mut self) -> usize {
        self.cull(self.config.max_candidates)
    }

    /// Select from the whole pool against fresh coverage statistics.
    pub fn select(&mut self) -> Result<&Selection, SelectError> {
        self.coverage.reset();
        let sets: Vec<&[Point2<f32>]> = self
            .pool
            .iter()
            .map(|f| f.detection.corners.as_slice())
            .collect();
        let selection = self.optimizer.optimize(&sets, &mut self.coverage)?;
        Ok(self.selection.insert(selection))
    }

    /// Selected frames in acceptance order; empty before [`select`](Self::select).
    pub fn selected(&self) -> Vec<&AcceptedFrame> {
        self.selection
            .iter()
            .flat_map(|s| s.indices.iter())
            .filter_map(|&i| self.pool.get(i))
            .collect()
    }

    /// `(name, corners)` of each selected frame, ready for a calibration
    /// solver.
    pub fn calibration_points(&self) -> Vec<(&str, &[Point2<f32>])> {
        self.selected()
            .into_iter()
            .map(|f| (f.name.as_str(), f.detection.corners.as_slice()))
            .collect()
    }

    pub fn report(&self) -> Option<SelectionReport> {
        let selection = self.selection.as_ref()?;
        let frames = selection
            .indices
            .iter()
            .zip(&selection.gains)
            .filter_map(|(&i, &gain)| {
                self.pool.get(i).map(|f| SelectedFrame {
                    name: f.name.clone(),
                    gain,
                    corners: f.detection.corners.clone(),
                })
            })
            .collect();
        Some(SelectionReport {
            mode: selection.mode,
            pattern: self.config.finder.size,
            candidates: self.pool.len(),
            aggregate: selection.aggregate,
            coverage_fraction: self.coverage.coverage_fraction(),
            frames,
        })
    }
}
