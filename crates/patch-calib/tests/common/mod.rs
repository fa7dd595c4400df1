#![allow(dead_code)]

use nalgebra::Point2;

pub const DARK: u8 = 30;
pub const LIGHT: u8 = 220;

pub struct Frame {
    pub image: image::GrayImage,
    pub centres: Vec<Point2<f32>>,
}

/// Axis-aligned mask board: `rows x cols` dark squares of `side` pixels on a
/// `pitch` lattice whose first square starts at `origin`.
pub fn mask_board(
    width: u32,
    height: u32,
    rows: usize,
    cols: usize,
    origin: (u32, u32),
) -> Frame {
    let (pitch, side) = (40u32, 34u32);
    let mut image = image::GrayImage::from_pixel(width, height, image::Luma([LIGHT]));
    let mut centres = Vec::with_capacity(rows * cols);
    for r in 0..rows as u32 {
        for c in 0..cols as u32 {
            let x0 = origin.0 + c * pitch;
            let y0 = origin.1 + r * pitch;
            for y in y0..y0 + side {
                for x in x0..x0 + side {
                    image.put_pixel(x, y, image::Luma([DARK]));
                }
            }
            let half = (side - 1) as f32 * 0.5;
            centres.push(Point2::new(x0 as f32 + half, y0 as f32 + half));
        }
    }
    Frame { image, centres }
}

pub fn blank(width: u32, height: u32) -> image::GrayImage {
    image::GrayImage::from_pixel(width, height, image::Luma([LIGHT]))
}
