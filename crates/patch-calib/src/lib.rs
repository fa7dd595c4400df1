//! Blob-grid calibration pattern detection and coverage-driven frame
//! selection.
//!
//! This crate re-exports the workspace crates and adds a
//! [`CalibrationSession`] that runs detection over many frames in parallel,
//! keeps the accepted detections, and selects the subset handed to a camera
//! calibration solver.
//!
//! ## Quickstart
//!
//! ```no_run
//! use patch_calib::{detect, CalibrationSession, ImageSize, PatternSize, SessionConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let size = PatternSize::new(6, 8)?;
//! let mut session = CalibrationSession::new(SessionConfig::new(ImageSize::new(1280, 960)?, size))?;
//!
//! let frames = vec![("frame_000.png", detect::load_gray("frame_000.png")?)];
//! let summary = session.detect_images(&frames);
//! println!("accepted {} frames", summary.accepted);
//!
//! session.cull_to_limit();
//! session.select()?;
//! for (name, corners) in session.calibration_points() {
//!     println!("{name}: {} corners", corners.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `patch_calib::core`: images, geometry, moments, homographies, detector seams.
//! - `patch_calib::detection`: the per-frame [`PatternFinder`] and its stages.
//! - `patch_calib::select`: coverage statistics and the frame optimizer.
//! - `patch_calib::detect` (feature `image`): helpers for `image::GrayImage`.

pub use patch_calib_core as core;
pub use patch_calib_detect as detection;
pub use patch_calib_select as select;

pub use patch_calib_core::{
    init_with_level, ConfigError, CornerSearchMode, FrameScope, GrayImageView, ImageSize,
    PatchParams, PatternSize,
};
#[cfg(feature = "tracing")]
pub use patch_calib_core::init_tracing;
pub use patch_calib_detect::{FinderParams, PatternDetection, PatternFinder, Rejection};
pub use patch_calib_select::{
    CoverageAccumulator, OptimizationMode, SelectError, Selection, SelectionParams,
};

mod io;
mod session;

pub use io::SessionIoError;
pub use session::{
    AcceptedFrame, CalibrationSession, FrameSummary, RejectedFrame, SelectedFrame,
    SelectionReport, SessionConfig, MAX_CANDIDATE_PATTERNS, MAX_PATTERNS_TO_KEEP,
};

#[cfg(feature = "image")]
pub mod detect;
