use crate::ConfigError;

/// Borrowed 8-bit grayscale image, row-major, `data.len() == width * height`.
#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8],
}

/// Owned 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl<'a> GrayImageView<'a> {
    /// Wrap a raw buffer, checking that its length matches the dimensions.
    pub fn new(width: usize, height: usize, data: &'a [u8]) -> Result<Self, ConfigError> {
        let expected = width
            .checked_mul(height)
            .ok_or(ConfigError::ImageDimensions { width, height })?;
        if width == 0 || height == 0 {
            return Err(ConfigError::ImageDimensions { width, height });
        }
        if data.len() != expected {
            return Err(ConfigError::ImageBuffer {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.width as f32 - 1.0 && y <= self.height as f32 - 1.0
    }
}

impl GrayImage {
    pub fn new(width: usize, height: usize, fill: u8) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u8) {
        self.data[y * self.width + x] = v;
    }
}

#[inline]
fn get_gray_clamped(src: &GrayImageView<'_>, x: i32, y: i32) -> u8 {
    let x = x.clamp(0, src.width as i32 - 1) as usize;
    let y = y.clamp(0, src.height as i32 - 1) as usize;
    src.data[y * src.width + x]
}

/// Bilinear sample at pixel-centre coordinates; samples outside the image
/// replicate the border.
#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_gray_clamped(src, x0, y0) as f32;
    let p10 = get_gray_clamped(src, x0 + 1, y0) as f32;
    let p01 = get_gray_clamped(src, x0, y0 + 1) as f32;
    let p11 = get_gray_clamped(src, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

/// Separable box blur with a `kernel x kernel` window (border replicated).
///
/// Even kernel sizes are rounded up to the next odd size; `kernel <= 1`
/// returns an unmodified copy.
pub fn box_blur(src: &GrayImageView<'_>, kernel: usize) -> GrayImage {
    let (w, h) = (src.width, src.height);
    if kernel <= 1 {
        return GrayImage {
            width: w,
            height: h,
            data: src.data.to_vec(),
        };
    }
    let r = (kernel / 2) as i32;
    let norm = (2 * r + 1) as u32;

    let mut horiz = vec![0u32; w * h];
    for y in 0..h {
        let row = &src.data[y * w..(y + 1) * w];
        let at = |x: i32| row[x.clamp(0, w as i32 - 1) as usize] as u32;
        let mut acc: u32 = (-r..=r).map(at).sum();
        for x in 0..w as i32 {
            horiz[y * w + x as usize] = acc;
            acc += at(x + r + 1);
            acc -= at(x - r);
        }
    }

    let mut out = vec![0u8; w * h];
    for x in 0..w {
        let at = |y: i32| horiz[y.clamp(0, h as i32 - 1) as usize * w + x];
        let mut acc: u32 = (-r..=r).map(at).sum();
        for y in 0..h as i32 {
            out[y as usize * w + x] = ((acc + norm * norm / 2) / (norm * norm)).min(255) as u8;
            acc += at(y + r + 1);
            acc -= at(y - r);
        }
    }

    GrayImage {
        width: w,
        height: h,
        data: out,
    }
}

/// Photometric negative of `src`.
pub fn invert(src: &GrayImageView<'_>) -> GrayImage {
    GrayImage {
        width: src.width,
        height: src.height,
        data: src.data.iter().map(|&v| 255 - v).collect(),
    }
}
