//! Coverage-driven selection of calibration frames.
//!
//! Detected corner sets are scored against a [`CoverageAccumulator`] and a
//! [`SetOptimizer`] picks the subset that best covers the image, following
//! one of the eight [`OptimizationMode`]s. [`random_culling`] trims an
//! oversized candidate pool beforehand.

mod coverage;
mod culling;
mod error;
mod optimizer;

pub use coverage::{CoverageAccumulator, CoverageParams, GaussianPrior, SharedCoverage};
pub use culling::{random_culling, random_culling_paired};
pub use error::SelectError;
pub use optimizer::{
    aggregate_score, OptimizationMode, Selection, SelectionParams, SetOptimizer,
    MAX_PATTERNS_PER_SET,
};
