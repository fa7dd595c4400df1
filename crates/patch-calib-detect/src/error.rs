use crate::topology::TopologyError;
use crate::verify::GeometryViolation;
use serde::Serialize;

/// Why a frame produced no detection. Per-frame conditions are values,
/// not failures of the detector.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("insufficient patches after {stage}: found {found}, expected {expected}")]
    InsufficientPatches {
        stage: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("too many patches to reduce: found {found}, expected {expected} (max excess {max_excess})")]
    TooManyPatches {
        found: usize,
        expected: usize,
        max_excess: usize,
    },

    #[error("ambiguous topology: {source}")]
    AmbiguousTopology {
        #[from]
        source: TopologyError,
    },

    #[error("pattern geometry rejected: {source}")]
    PatternGeometry {
        #[from]
        source: GeometryViolation,
    },

    #[error("pattern closer than {min_border}px to the image border")]
    OutOfFrame { min_border: f32 },

    #[error("frame is {width}x{height}, expected {expected_width}x{expected_height}")]
    ImageSize {
        width: usize,
        height: usize,
        expected_width: usize,
        expected_height: usize,
    },
}

impl Rejection {
    /// Short stable identifier, used as a key in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientPatches { .. } => "insufficient_patches",
            Self::TooManyPatches { .. } => "too_many_patches",
            Self::AmbiguousTopology { .. } => "ambiguous_topology",
            Self::PatternGeometry { .. } => "pattern_geometry",
            Self::OutOfFrame { .. } => "out_of_frame",
            Self::ImageSize { .. } => "image_size",
        }
    }
}
