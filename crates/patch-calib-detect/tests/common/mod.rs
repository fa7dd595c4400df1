#![allow(dead_code)]

use nalgebra::{Matrix3, Point2};
use patch_calib_core::{GrayImage, Homography};

pub const DARK: u8 = 30;
pub const LIGHT: u8 = 220;

/// Mask board: `rows x cols` dark squares separated by light gaps.
pub struct SyntheticBoard {
    pub rows: usize,
    pub cols: usize,
    pub pitch: f64,
    pub gap: f64,
    /// Top-left lattice corner in the image.
    pub origin: (f64, f64),
    pub angle_deg: f64,
    /// Projective terms `(g, h)` per board unit: a board point `(u, v)` is
    /// divided by `1 + g u + h v`.
    pub perspective: (f64, f64),
}

pub struct Rendered {
    pub image: GrayImage,
    /// Square centres, row-major.
    pub centres: Vec<Point2<f32>>,
    /// Lattice corners, row-major `(rows + 1) x (cols + 1)`.
    pub corners: Vec<Point2<f32>>,
}

impl SyntheticBoard {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            pitch: 40.0,
            gap: 6.0,
            origin: (60.0, 50.0),
            angle_deg: 0.0,
            perspective: (0.0, 0.0),
        }
    }

    /// Board unit coordinates (one unit per cell) to image pixels.
    pub fn board_to_image(&self) -> Homography {
        let (s, c) = self.angle_deg.to_radians().sin_cos();
        let p = self.pitch;
        let (g, h) = self.perspective;
        Homography::new(Matrix3::new(
            p * c, -p * s, self.origin.0, //
            p * s, p * c, self.origin.1, //
            g, h, 1.0,
        ))
    }

    fn is_dark(&self, u: f64, v: f64) -> bool {
        if u < 0.0 || v < 0.0 || u >= self.cols as f64 || v >= self.rows as f64 {
            return false;
        }
        let half_gap = 0.5 * self.gap / self.pitch;
        let (fu, fv) = (u.fract(), v.fract());
        fu >= half_gap && fu <= 1.0 - half_gap && fv >= half_gap && fv <= 1.0 - half_gap
    }

    pub fn render(&self, width: usize, height: usize) -> Rendered {
        let h = self.board_to_image();
        let inv = h.h.try_inverse().expect("invertible board transform");
        let ss = 4;
        let mut image = GrayImage::new(width, height, LIGHT);
        for y in 0..height {
            for x in 0..width {
                let mut dark = 0u32;
                for sy in 0..ss {
                    for sx in 0..ss {
                        let px = x as f64 - 0.5 + (sx as f64 + 0.5) / ss as f64;
                        let py = y as f64 - 0.5 + (sy as f64 + 0.5) / ss as f64;
                        let q = inv * nalgebra::Vector3::new(px, py, 1.0);
                        if self.is_dark(q[0] / q[2], q[1] / q[2]) {
                            dark += 1;
                        }
                    }
                }
                let n = (ss * ss) as u32;
                let v = (dark * DARK as u32 + (n - dark) * LIGHT as u32 + n / 2) / n;
                image.set(x, y, v as u8);
            }
        }

        let centres = (0..self.rows)
            .flat_map(|r| (0..self.cols).map(move |c| Point2::new(c as f32 + 0.5, r as f32 + 0.5)))
            .map(|p| h.apply(p))
            .collect();
        let corners = (0..=self.rows)
            .flat_map(|i| (0..=self.cols).map(move |j| Point2::new(j as f32, i as f32)))
            .map(|p| h.apply(p))
            .collect();
        Rendered {
            image,
            centres,
            corners,
        }
    }
}

/// Draw a filled dark disc.
pub fn draw_disc(img: &mut GrayImage, cx: f32, cy: f32, radius: f32) {
    for y in 0..img.height {
        for x in 0..img.width {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            if dx * dx + dy * dy <= radius * radius {
                img.set(x, y, DARK);
            }
        }
    }
}

pub fn max_error(a: &[Point2<f32>], b: &[Point2<f32>]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(p, q)| (p - q).norm())
        .fold(0.0, f32::max)
}
