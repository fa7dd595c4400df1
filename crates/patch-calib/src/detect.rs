//! `image`-crate entry points.

use crate::session::{CalibrationSession, FrameSummary};
use patch_calib_core::{ConfigError, GrayImageView};
use patch_calib_detect::{PatternDetection, PatternFinder, Rejection};
use std::path::Path;

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum ImageInputError {
    #[error(transparent)]
    Decode(#[from] ::image::ImageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Borrow an `image::GrayImage` as a [`GrayImageView`].
pub fn gray_view(img: &::image::GrayImage) -> GrayImageView<'_> {
    GrayImageView {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw(),
    }
}

/// Luma conversion of any decoded image.
pub fn to_gray(img: &::image::DynamicImage) -> ::image::GrayImage {
    img.to_luma8()
}

/// Decode an image file into 8-bit luma.
pub fn load_gray(path: impl AsRef<Path>) -> Result<::image::GrayImage, ImageInputError> {
    Ok(::image::open(path)?.to_luma8())
}

/// Build an `image::GrayImage` from a raw row-major buffer.
pub fn gray_image_from_slice(
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<::image::GrayImage, ImageInputError> {
    GrayImageView::new(width as usize, height as usize, pixels)?;
    ::image::GrayImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        ConfigError::ImageDimensions {
            width: width as usize,
            height: height as usize,
        }
        .into()
    })
}

#[cfg_attr(
    feature = "tracing",
    instrument(
        level = "info",
        skip(finder, img),
        fields(width = img.width(), height = img.height())
    )
)]
pub fn find_pattern(
    finder: &PatternFinder,
    img: &::image::GrayImage,
) -> Result<PatternDetection, Rejection> {
    finder.find(&gray_view(img))
}

impl CalibrationSession {
    /// [`detect_frames`](CalibrationSession::detect_frames) over `image`
    /// buffers.
    pub fn detect_images<S>(&mut self, frames: &[(S, ::image::GrayImage)]) -> FrameSummary
    where
        S: AsRef<str> + Sync,
    {
        let views: Vec<(&str, GrayImageView<'_>)> = frames
            .iter()
            .map(|(name, img)| (name.as_ref(), gray_view(img)))
            .collect();
        self.detect_frames(&views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_shares_the_buffer() {
        let img = ::image::GrayImage::from_fn(7, 5, |x, y| ::image::Luma([(x * 10 + y) as u8]));
        let view = gray_view(&img);
        assert_eq!((view.width, view.height), (7, 5));
        assert_eq!(view.get(3, 2), 32);
    }

    #[test]
    fn rgb_input_is_converted_to_luma() {
        let rgb = ::image::RgbImage::from_pixel(4, 3, ::image::Rgb([200, 200, 200]));
        let gray = to_gray(&::image::DynamicImage::ImageRgb8(rgb));
        assert_eq!(gray.dimensions(), (4, 3));
        assert_eq!(gray.get_pixel(0, 0).0[0], 200);
    }

    #[test]
    fn slice_length_is_checked() {
        assert!(gray_image_from_slice(4, 4, &[0; 16]).is_ok());
        let err = gray_image_from_slice(4, 4, &[0; 15]).unwrap_err();
        assert!(matches!(
            err,
            ImageInputError::Config(ConfigError::ImageBuffer {
                expected: 16,
                got: 15
            })
        ));
    }
}
