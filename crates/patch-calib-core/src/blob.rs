//! Blob extraction seam and the default stable-region (MSER-style) detector.

use crate::{box_blur, convex_hull, ensure, invert, ConfigError, GrayImage, GrayImageView};
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Produces closed boundary polygons (integer pixel coordinates) of
/// candidate blobs. Implementations must be deterministic for a given image.
pub trait BlobDetector: Send + Sync {
    fn detect(&self, img: &GrayImageView<'_>) -> Vec<Vec<Point2<i32>>>;
}

/// Sensitivity knobs of the stable-region detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchParams {
    /// Intensity step between thresholds; also the half-width of the
    /// stability window.
    pub delta: f64,
    /// Maximum relative area change `(A(t+Δ) - A(t-Δ)) / A(t)`.
    pub max_variation: f64,
    /// Nested stable regions whose areas differ by less than this fraction
    /// collapse to the most stable one.
    pub min_diversity: f64,
    /// Cap on the number of threshold levels.
    pub max_evolution: usize,
    /// Growth ratio below which a region counts as not evolving.
    pub area_threshold: f64,
    /// Tolerance of the local-minimum test on variation.
    pub min_margin: f64,
    /// Box blur kernel applied first (`0` or `1` disables).
    pub edge_blur_size: usize,
}

impl Default for PatchParams {
    fn default() -> Self {
        Self {
            delta: 7.5,
            max_variation: 0.25,
            min_diversity: 0.20,
            max_evolution: 200,
            area_threshold: 1.01,
            min_margin: 0.003,
            edge_blur_size: 5,
        }
    }
}

impl PatchParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.delta.is_finite() && self.delta > 0.0,
            "delta",
            "must be finite and positive",
        )?;
        ensure(
            self.max_variation.is_finite() && self.max_variation > 0.0,
            "max_variation",
            "must be finite and positive",
        )?;
        ensure(
            (0.0..1.0).contains(&self.min_diversity),
            "min_diversity",
            "must lie in [0, 1)",
        )?;
        ensure(self.max_evolution >= 1, "max_evolution", "must be at least 1")?;
        ensure(
            self.area_threshold.is_finite() && self.area_threshold >= 1.0,
            "area_threshold",
            "must be finite and >= 1",
        )?;
        ensure(
            self.min_margin.is_finite() && self.min_margin >= 0.0,
            "min_margin",
            "must be finite and non-negative",
        )
    }

    /// Threshold levels `Δ·(k+1)` up to 255, at most `max_evolution` of them.
    pub fn levels(&self) -> Vec<f64> {
        (0..self.max_evolution)
            .map(|k| self.delta * (k as f64 + 1.0))
            .take_while(|&t| t <= 255.0)
            .collect()
    }
}

/// Which blobs to look for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Dark blobs on a lighter surround.
    Dark,
    /// Bright blobs on a darker surround.
    Bright,
    #[default]
    Both,
}

/// Threshold-sweep stable-region detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MserDetector {
    pub params: PatchParams,
    pub polarity: Polarity,
    /// Smallest region area in pixels.
    pub min_area: usize,
    /// Largest region area as a fraction of the image area.
    pub max_area_fraction: f64,
}

impl Default for MserDetector {
    fn default() -> Self {
        Self {
            params: PatchParams::default(),
            polarity: Polarity::Both,
            min_area: 20,
            max_area_fraction: 0.2,
        }
    }
}

/// Connected components of `I <= t` at one threshold level.
struct Level {
    /// 1-based component label per pixel, 0 outside the set.
    labels: Vec<u32>,
    areas: Vec<usize>,
    /// Darkest pixel of each component (first in raster order on ties).
    seeds: Vec<usize>,
}

impl Level {
    #[inline]
    fn area_at(&self, pixel: usize) -> usize {
        match self.labels[pixel] {
            0 => 0,
            l => self.areas[l as usize - 1],
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ChainEntry {
    level: usize,
    area: usize,
    variation: f64,
}

impl MserDetector {
    pub fn new(params: PatchParams) -> Result<Self, ConfigError> {
        let det = Self {
            params,
            ..Self::default()
        };
        det.validate()?;
        Ok(det)
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.params.validate()?;
        ensure(self.min_area >= 1, "min_area", "must be at least 1")?;
        ensure(
            self.max_area_fraction > 0.0 && self.max_area_fraction <= 1.0,
            "max_area_fraction",
            "must lie in (0, 1]",
        )
    }

    /// Dark-polarity pass over an already blurred image.
    fn detect_dark(&self, img: &GrayImageView<'_>) -> Vec<Vec<Point2<i32>>> {
        let levels = self.params.levels();
        if levels.len() < 3 {
            return Vec::new();
        }

        let max_area = (self.max_area_fraction * (img.width * img.height) as f64) as usize;
        let mut chains: BTreeMap<usize, Vec<ChainEntry>> = BTreeMap::new();

        let mut prev: Option<Level> = None;
        let mut cur = label_level(img, levels[0]);
        for k in 0..levels.len() - 1 {
            let next = label_level(img, levels[k + 1]);
            for (c, (&area, &seed)) in cur.areas.iter().zip(cur.seeds.iter()).enumerate() {
                let a_prev = prev.as_ref().map_or(0, |p| p.area_at(seed));
                let a_next = next.area_at(seed);
                let variation = if a_prev > 0
                    && (a_next as f64) < self.params.area_threshold * a_prev as f64
                {
                    0.0
                } else {
                    (a_next - a_prev) as f64 / area as f64
                };
                debug_assert_eq!(cur.labels[seed] as usize, c + 1);
                chains.entry(seed).or_default().push(ChainEntry {
                    level: k,
                    area,
                    variation,
                });
            }
            prev = Some(cur);
            cur = next;
        }

        let mut flood = RegionFlood::new(img.width * img.height);
        let mut out = Vec::new();
        for (&seed, chain) in &chains {
            for entry in self.select_stable(chain, max_area) {
                let pixels = flood.region(img, seed, levels[entry.level]);
                let hull = convex_hull(&pixels);
                if hull.len() >= 3 {
                    out.push(hull);
                }
            }
        }
        out
    }

    /// Local variation minima of one seed chain, pruned for diversity.
    fn select_stable(&self, chain: &[ChainEntry], max_area: usize) -> Vec<ChainEntry> {
        let p = &self.params;
        let candidates: Vec<ChainEntry> = chain
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                let left_ok = i
                    .checked_sub(1)
                    .map_or(true, |j| e.variation <= chain[j].variation + p.min_margin);
                let right_ok = chain
                    .get(i + 1)
                    .map_or(true, |n| e.variation <= n.variation + p.min_margin);
                e.variation <= p.max_variation
                    && e.area >= self.min_area
                    && e.area <= max_area
                    && left_ok
                    && right_ok
            })
            .map(|(_, e)| *e)
            .collect();

        let mut kept: Vec<ChainEntry> = Vec::new();
        let mut group_first_area = 0usize;
        for cand in candidates {
            let joins = match kept.last() {
                Some(_) => {
                    (cand.area - group_first_area) as f64 / (cand.area as f64) < p.min_diversity
                }
                None => false,
            };
            if joins {
                if let Some(best) = kept.last_mut() {
                    if cand.variation < best.variation {
                        *best = cand;
                    }
                }
            } else {
                group_first_area = cand.area;
                kept.push(cand);
            }
        }
        kept
    }
}

impl BlobDetector for MserDetector {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, img), fields(width = img.width, height = img.height))
    )]
    fn detect(&self, img: &GrayImageView<'_>) -> Vec<Vec<Point2<i32>>> {
        let blurred: GrayImage = box_blur(img, self.params.edge_blur_size);
        let mut out = Vec::new();
        if matches!(self.polarity, Polarity::Dark | Polarity::Both) {
            out.extend(self.detect_dark(&blurred.view()));
        }
        if matches!(self.polarity, Polarity::Bright | Polarity::Both) {
            let inverted = invert(&blurred.view());
            out.extend(self.detect_dark(&inverted.view()));
        }
        debug!(
            "stable regions: {} ({}x{}, polarity {:?})",
            out.len(),
            img.width,
            img.height,
            self.polarity
        );
        out
    }
}

const NEIGHBOURS4: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Label the 4-connected components of `I <= t`, visiting seeds in raster
/// order so labels and seeds are deterministic.
fn label_level(img: &GrayImageView<'_>, t: f64) -> Level {
    let (w, h) = (img.width, img.height);
    let mut labels = vec![0u32; w * h];
    let mut areas = Vec::new();
    let mut seeds = Vec::new();
    let mut stack = Vec::new();

    for start in 0..w * h {
        if labels[start] != 0 || img.data[start] as f64 > t {
            continue;
        }
        let label = areas.len() as u32 + 1;
        labels[start] = label;
        stack.push(start);
        let mut area = 0usize;
        let mut seed = start;

        while let Some(idx) = stack.pop() {
            area += 1;
            let v = img.data[idx];
            let sv = img.data[seed];
            if v < sv || (v == sv && idx < seed) {
                seed = idx;
            }
            let (x, y) = ((idx % w) as i32, (idx / w) as i32);
            for (dx, dy) in NEIGHBOURS4 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i32 || ny >= h as i32 {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if labels[n] == 0 && img.data[n] as f64 <= t {
                    labels[n] = label;
                    stack.push(n);
                }
            }
        }
        areas.push(area);
        seeds.push(seed);
    }

    Level {
        labels,
        areas,
        seeds,
    }
}

/// Flood fill with a visit stamp shared across regions of one image, so
/// each fill only touches its own pixels.
struct RegionFlood {
    stamp: Vec<u32>,
    generation: u32,
    stack: Vec<usize>,
}

impl RegionFlood {
    fn new(len: usize) -> Self {
        Self {
            stamp: vec![0; len],
            generation: 0,
            stack: Vec::new(),
        }
    }

    /// Pixels of the 4-connected component of `I <= t` containing `seed`.
    fn region(&mut self, img: &GrayImageView<'_>, seed: usize, t: f64) -> Vec<Point2<i32>> {
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.stamp.fill(0);
            self.generation = 1;
        }
        let mark = self.generation;
        let w = img.width;
        self.stack.clear();
        self.stack.push(seed);
        self.stamp[seed] = mark;
        let mut out = Vec::new();

        while let Some(idx) = self.stack.pop() {
            let (x, y) = ((idx % w) as i32, (idx / w) as i32);
            out.push(Point2::new(x, y));
            for (dx, dy) in NEIGHBOURS4 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i32 || ny >= img.height as i32 {
                    continue;
                }
                let n = ny as usize * w + nx as usize;
                if self.stamp[n] != mark && img.data[n] as f64 <= t {
                    self.stamp[n] = mark;
                    self.stack.push(n);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Moments;

    fn squares_image(w: usize, h: usize, squares: &[(usize, usize, usize)], fg: u8, bg: u8) -> GrayImage {
        let mut img = GrayImage::new(w, h, bg);
        for &(x0, y0, side) in squares {
            for y in y0..y0 + side {
                for x in x0..x0 + side {
                    img.set(x, y, fg);
                }
            }
        }
        img
    }

    #[test]
    fn default_params_match_documented_values() {
        let p = PatchParams::default();
        assert_eq!(p.delta, 7.5);
        assert_eq!(p.max_evolution, 200);
        assert_eq!(p.edge_blur_size, 5);
        assert!(p.validate().is_ok());
        // 7.5 * 34 = 255
        assert_eq!(p.levels().len(), 34);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let bad = PatchParams {
            min_diversity: 1.0,
            ..PatchParams::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::Parameter {
                name: "min_diversity",
                ..
            })
        ));
        assert!(MserDetector::new(PatchParams {
            delta: 0.0,
            ..PatchParams::default()
        })
        .is_err());
    }

    #[test]
    fn finds_dark_squares_on_light_background() {
        let img = squares_image(120, 80, &[(10, 10, 20), (60, 30, 24)], 30, 220);
        let det = MserDetector::default().with_polarity(Polarity::Dark);
        let polys = det.detect(&img.view());
        assert!(!polys.is_empty());

        for (cx, cy) in [(19.5, 19.5), (71.5, 41.5)] {
            let hit = polys.iter().any(|poly| {
                let c = Moments::from_polygon(poly).centroid().expect("centroid");
                (c.x - cx).abs() < 1.0 && (c.y - cy).abs() < 1.0
            });
            assert!(hit, "no region centred near ({cx}, {cy})");
        }
    }

    #[test]
    fn bright_polarity_finds_light_squares() {
        let img = squares_image(100, 100, &[(40, 40, 20)], 230, 20);
        let dark_only = MserDetector::default().with_polarity(Polarity::Dark);
        let bright = MserDetector::default().with_polarity(Polarity::Bright);

        let hit = |polys: &[Vec<Point2<i32>>]| {
            polys.iter().any(|poly| {
                Moments::from_polygon(poly)
                    .centroid()
                    .is_some_and(|c| (c.x - 49.5).abs() < 1.0 && (c.y - 49.5).abs() < 1.0)
            })
        };
        assert!(hit(&bright.detect(&img.view())));
        assert!(!hit(&dark_only.detect(&img.view())));
    }

    #[test]
    fn region_flood_reuses_its_buffer() {
        // Two dark squares; flooding one must not leak visits into the other.
        let img = squares_image(30, 20, &[(2, 2, 5), (15, 4, 6)], 10, 200);
        let view = img.view();
        let mut flood = RegionFlood::new(30 * 20);
        let a = flood.region(&view, 2 * 30 + 2, 100.0);
        let b = flood.region(&view, 4 * 30 + 15, 100.0);
        let a_again = flood.region(&view, 3 * 30 + 3, 100.0);
        assert_eq!(a.len(), 25);
        assert_eq!(b.len(), 36);
        assert_eq!(a_again.len(), 25);
        assert_eq!(flood.stamp.len(), 600);

        flood.generation = u32::MAX;
        assert_eq!(flood.region(&view, 2 * 30 + 2, 100.0).len(), 25);
        assert_eq!(flood.generation, 1);
    }

    #[test]
    fn uniform_image_has_no_regions() {
        let img = GrayImage::new(64, 48, 128);
        assert!(MserDetector::default().detect(&img.view()).is_empty());
    }
}
