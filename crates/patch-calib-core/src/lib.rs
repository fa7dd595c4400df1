//! Core types and utilities for blob-grid calibration pattern detection.
//!
//! Image views and sampling, grid and polygon geometry, polygon moments,
//! homography estimation, and the two pluggable seams the detector builds
//! on: [`BlobDetector`] (default [`MserDetector`]) and [`CornerSearch`]
//! (default [`SubpixelCornerSearch`]).

mod blob;
mod error;
mod geometry;
mod homography;
mod image;
mod logger;
mod moments;
mod subpix;

pub use blob::{BlobDetector, MserDetector, PatchParams, Polarity};
pub use error::{ensure, ConfigError};
pub use geometry::{
    convex_hull, point_in_polygon, polygon_bbox, polygon_perimeter, polygon_signed_area,
    ImageSize, PatternSize,
};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{box_blur, invert, sample_bilinear, GrayImage, GrayImageView};
pub use moments::Moments;
pub use subpix::{CornerSearch, CornerSearchMode, SubpixelCornerSearch};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{current_frame, init_with_level, FrameScope};
