use log::debug;
use nalgebra::Point2;
use patch_calib_core::{
    polygon_bbox, polygon_perimeter, point_in_polygon, BlobDetector, GrayImageView, Moments,
    MserDetector,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One candidate blob: its convex boundary and the statistics the filters
/// work on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Convex boundary in integer pixel coordinates.
    pub hull: Vec<Point2<i32>>,
    /// Sub-pixel centroid of the enclosed region.
    pub centroid: Point2<f32>,
    /// `centroid` rounded to the nearest pixel.
    pub centroid_px: Point2<i32>,
    pub moments: Moments,
    pub area: f64,
    pub perimeter: f64,
    /// Mean intensity of the pixels inside `hull`.
    pub mean_intensity: f32,
    pub intensity_variance: f32,
}

impl Patch {
    /// Build a patch from a boundary polygon. `None` for degenerate polygons
    /// (fewer than three vertices, zero area, or no pixel inside).
    pub fn from_hull(hull: Vec<Point2<i32>>, img: &GrayImageView<'_>) -> Option<Self> {
        if hull.len() < 3 {
            return None;
        }
        let moments = Moments::from_polygon(&hull);
        if moments.m00 <= 0.0 {
            return None;
        }
        let c = moments.centroid()?;
        let centroid = Point2::new(c.x as f32, c.y as f32);
        let (mean_intensity, intensity_variance) = intensity_stats(img, &hull)?;

        Some(Self {
            perimeter: polygon_perimeter(&hull),
            area: moments.m00,
            centroid_px: Point2::new(c.x.round() as i32, c.y.round() as i32),
            centroid,
            moments,
            mean_intensity,
            intensity_variance,
            hull,
        })
    }

    /// `sqrt(λmax / λmin)` of the central second moments.
    pub fn elongation(&self) -> Option<f64> {
        self.moments.elongation()
    }

    /// `4π·area / perimeter²`: 1 for a disc, π/4 for a square.
    pub fn compactness(&self) -> f64 {
        if self.perimeter <= 0.0 {
            return 0.0;
        }
        4.0 * std::f64::consts::PI * self.area / (self.perimeter * self.perimeter)
    }

    pub fn contains(&self, p: Point2<f32>) -> bool {
        point_in_polygon(p, &self.hull)
    }
}

/// Mean and variance of the pixels inside a polygon (boundary included).
fn intensity_stats(img: &GrayImageView<'_>, hull: &[Point2<i32>]) -> Option<(f32, f32)> {
    let (lo, hi) = polygon_bbox(hull)?;
    let x0 = lo.x.max(0);
    let y0 = lo.y.max(0);
    let x1 = hi.x.min(img.width as i32 - 1);
    let y1 = hi.y.min(img.height as i32 - 1);

    let (mut n, mut sum, mut sum2) = (0u64, 0f64, 0f64);
    for y in y0..=y1 {
        for x in x0..=x1 {
            if point_in_polygon(Point2::new(x as f32, y as f32), hull) {
                let v = img.get(x as usize, y as usize) as f64;
                n += 1;
                sum += v;
                sum2 += v * v;
            }
        }
    }
    if n == 0 {
        return None;
    }
    let mean = sum / n as f64;
    let var = (sum2 / n as f64 - mean * mean).max(0.0);
    Some((mean as f32, var as f32))
}

/// Runs a [`BlobDetector`] and wraps every usable polygon into a [`Patch`].
pub struct PatchExtractor {
    detector: Box<dyn BlobDetector>,
}

impl Default for PatchExtractor {
    fn default() -> Self {
        Self::new(Box::new(MserDetector::default()))
    }
}

impl PatchExtractor {
    pub fn new(detector: Box<dyn BlobDetector>) -> Self {
        Self { detector }
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, img), fields(width = img.width, height = img.height))
    )]
    pub fn extract(&self, img: &GrayImageView<'_>) -> Vec<Patch> {
        let polygons = self.detector.detect(img);
        let total = polygons.len();
        let patches: Vec<Patch> = polygons
            .into_iter()
            .filter_map(|hull| Patch::from_hull(hull, img))
            .collect();
        debug!(
            "extracted {} patches from {} polygons",
            patches.len(),
            total
        );
        patches
    }
}
