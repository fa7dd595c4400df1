//! Spatial moments of a closed polygon (Green's theorem).

use nalgebra::{Matrix2, Point2};
use serde::{Deserialize, Serialize};

/// Raw and central moments up to second order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub m20: f64,
    pub m11: f64,
    pub m02: f64,
    pub mu20: f64,
    pub mu11: f64,
    pub mu02: f64,
}

impl Moments {
    /// Moments of the region enclosed by `poly`; orientation independent.
    pub fn from_polygon(poly: &[Point2<i32>]) -> Self {
        if poly.len() < 3 {
            return Self::default();
        }
        let (mut a00, mut a10, mut a01) = (0.0f64, 0.0f64, 0.0f64);
        let (mut a20, mut a11, mut a02) = (0.0f64, 0.0f64, 0.0f64);

        for (i, p) in poly.iter().enumerate() {
            let q = &poly[(i + 1) % poly.len()];
            let (xi, yi) = (p.x as f64, p.y as f64);
            let (xj, yj) = (q.x as f64, q.y as f64);
            let a = xi * yj - xj * yi;
            a00 += a;
            a10 += a * (xi + xj);
            a01 += a * (yi + yj);
            a20 += a * (xi * xi + xi * xj + xj * xj);
            a11 += a * (xi * yj + 2.0 * xi * yi + 2.0 * xj * yj + xj * yi);
            a02 += a * (yi * yi + yi * yj + yj * yj);
        }

        let sign = if a00 < 0.0 { -1.0 } else { 1.0 };
        let m00 = sign * a00 / 2.0;
        let m10 = sign * a10 / 6.0;
        let m01 = sign * a01 / 6.0;
        let m20 = sign * a20 / 12.0;
        let m11 = sign * a11 / 24.0;
        let m02 = sign * a02 / 12.0;

        let (mu20, mu11, mu02) = if m00.abs() > f64::EPSILON {
            let cx = m10 / m00;
            let cy = m01 / m00;
            (m20 - cx * m10, m11 - cx * m01, m02 - cy * m01)
        } else {
            (0.0, 0.0, 0.0)
        };

        Self {
            m00,
            m10,
            m01,
            m20,
            m11,
            m02,
            mu20,
            mu11,
            mu02,
        }
    }

    pub fn centroid(&self) -> Option<Point2<f64>> {
        if self.m00.abs() <= f64::EPSILON {
            return None;
        }
        Some(Point2::new(self.m10 / self.m00, self.m01 / self.m00))
    }

    /// Eigenvalues `(major, minor)` of the normalized second-moment matrix.
    pub fn principal_variances(&self) -> Option<(f64, f64)> {
        if self.m00.abs() <= f64::EPSILON {
            return None;
        }
        let cov = Matrix2::new(self.mu20, self.mu11, self.mu11, self.mu02) / self.m00;
        let eig = cov.symmetric_eigen();
        let (a, b) = (eig.eigenvalues[0], eig.eigenvalues[1]);
        Some((a.max(b), a.min(b)))
    }

    /// Ratio of principal axis lengths (1 for squares and discs).
    pub fn elongation(&self) -> Option<f64> {
        let (major, minor) = self.principal_variances()?;
        if minor <= f64::EPSILON {
            return None;
        }
        Some((major / minor).sqrt())
    }

    /// Angle of the major axis in radians, in `(-π/2, π/2]`.
    pub fn orientation(&self) -> f64 {
        0.5 * (2.0 * self.mu11).atan2(self.mu20 - self.mu02)
    }
}
