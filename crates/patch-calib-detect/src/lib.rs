//! Blob-grid calibration pattern detection.
//!
//! [`PatternFinder::find`] runs the per-frame pipeline:
//!
//! 1. [`PatchExtractor`] turns stable regions into [`Patch`]es,
//! 2. [`FilterPipeline`] shrinks them to exactly `rows * cols`,
//! 3. [`solve_topology`] orders them row-major,
//! 4. [`correct_patch_centres`] re-centres them on the image and
//!    [`check_patches`] checks they form a grid,
//! 5. [`interpolate_corner_locations`], [`initial_refinement_of_corners`],
//!    [`refine_corner_positions`] and [`find_best_corners`] build the
//!    sub-pixel corner lattice,
//! 6. [`check_corners`] and [`pattern_in_frame`] accept or reject it.
//!
//! Rejections are values ([`Rejection`]), never panics.

mod centres;
mod corners;
mod detector;
mod error;
mod filters;
mod params;
mod patch;
mod topology;
mod verify;

pub use centres::{correct_patch_centres, CentreCorrectionParams};
pub use corners::{
    find_best_corners, group_points_in_quads, initial_refinement_of_corners,
    interpolate_corner_locations, refine_corner_positions, ungroup_quads, CornerSearchParams,
    RefinementOutcome, RefinementParams, DEFAULT_CORRECTION_FACTOR, MAX_SEARCH_DIST,
};
pub use detector::{Confidence, PatternDetection, PatternFinder};
pub use error::Rejection;
pub use filters::{
    ClusterFilter, EnclosureFilter, FilterParams, FilterPipeline, PatchFilter, ReduceCluster,
    ShapeFilter, VarianceFilter,
};
pub use params::FinderParams;
pub use patch::{Patch, PatchExtractor};
pub use topology::{
    cell_role, dominant_axes, reorder_patches, solve_topology, CellRole, GridAssignment,
    GridAxes, TopologyError,
};
pub use verify::{
    check_corners, check_pattern, check_patches, pattern_in_frame, verify_corners,
    verify_patches, verify_pattern, GeometryViolation, VerifyParams, MIN_DISTANCE_FROM_EDGE,
};
