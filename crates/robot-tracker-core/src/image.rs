use crate::Pt2;
use serde::{Deserialize, Serialize};

/// Raw buffer validation errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageBufferError {
    #[error("invalid image dimensions (width={width}, height={height})")]
    InvalidDimensions { width: usize, height: usize },
    #[error("invalid buffer length (expected {expected} elements, got {got})")]
    InvalidLength { expected: usize, got: usize },
    #[error("depth map {depth:?} does not match color image {color:?}")]
    SizeMismatch {
        color: (usize, usize),
        depth: (usize, usize),
    },
}

fn checked_len(width: usize, height: usize, channels: usize) -> Result<usize, ImageBufferError> {
    if width == 0 || height == 0 {
        return Err(ImageBufferError::InvalidDimensions { width, height });
    }
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(channels))
        .ok_or(ImageBufferError::InvalidDimensions { width, height })
}

#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // row-major, len = w*h
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }
}

/// Interleaved 8-bit RGB image, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColorImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl ColorImage {
    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Result<Self, ImageBufferError> {
        let expected = checked_len(width, height, 3)?;
        if data.len() != expected {
            return Err(ImageBufferError::InvalidLength {
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

    /// Image filled with a single color.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Result<Self, ImageBufferError> {
        let n = checked_len(width, height, 1)?;
        let mut data = Vec::with_capacity(n * 3);
        for _ in 0..n {
            data.extend_from_slice(&rgb);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Write one pixel; out-of-bounds writes are ignored.
    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = (y * self.width + x) * 3;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Luma conversion (ITU-R BT.601 weights, integer arithmetic).
    pub fn to_gray(&self) -> GrayImage {
        let data = self
            .data
            .chunks_exact(3)
            .map(|p| ((77 * p[0] as u32 + 150 * p[1] as u32 + 29 * p[2] as u32) >> 8) as u8)
            .collect();
        GrayImage {
            width: self.width,
            height: self.height,
            data,
        }
    }
}

/// Per-pixel depth in metres aligned with the color image. `0.0` marks an invalid sample.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthMap {
    pub fn from_raw(width: usize, height: usize, data: Vec<f32>) -> Result<Self, ImageBufferError> {
        let expected = checked_len(width, height, 1)?;
        if data.len() != expected {
            return Err(ImageBufferError::InvalidLength {
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
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn depth(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let d = self.data[y * self.width + x];
        (d.is_finite() && d > 0.0).then_some(d)
    }

    /// Median of the valid samples in a `(2r+1)²` window around `p`.
    pub fn median_around(&self, p: Pt2, radius: usize) -> Option<f32> {
        let cx = p.x.floor() as i64;
        let cy = p.y.floor() as i64;
        let r = radius as i64;
        let mut samples = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for y in (cy - r)..=(cy + r) {
            for x in (cx - r)..=(cx + r) {
                if x < 0 || y < 0 {
                    continue;
                }
                if let Some(d) = self.depth(x as usize, y as usize) {
                    samples.push(d);
                }
            }
        }
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        Some(samples[samples.len() / 2])
    }
}

/// Axis-aligned pixel rectangle, `[x, x + width) × [y, y + height)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: width as u32,
            height: height as u32,
        }
    }

    /// Square window of half-size `half` centered on `center`, clipped to the
    /// `bounds_w × bounds_h` frame. Returns `None` when the clipped window is empty.
    pub fn around(center: Pt2, half: f64, bounds_w: usize, bounds_h: usize) -> Option<Self> {
        if !center.x.is_finite() || !center.y.is_finite() || !half.is_finite() {
            return None;
        }
        let x0 = (center.x - half).floor().max(0.0);
        let y0 = (center.y - half).floor().max(0.0);
        let x1 = (center.x + half).ceil().min(bounds_w as f64);
        let y1 = (center.y + half).ceil().min(bounds_h as f64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    #[inline]
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        let (x, y) = (x as u32, y as u32);
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    #[inline]
    pub fn contains_point(&self, p: Pt2) -> bool {
        p.x >= self.x as f64
            && p.y >= self.y as f64
            && p.x < self.right() as f64
            && p.y < self.bottom() as f64
    }

    /// Overlap of two rectangles, `None` if they do not overlap.
    pub fn intersection(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x0 < x1 && y0 < y1).then(|| PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }

    /// True if the rectangle lies inside a `width × height` frame.
    #[inline]
    pub fn is_within(&self, width: usize, height: usize) -> bool {
        self.right() as usize <= width && self.bottom() as usize <= height
    }

    #[inline]
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[inline]
fn get_gray(src: &GrayImageView<'_>, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i32 || y >= src.height as i32 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f64, y: f64) -> f64 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = get_gray(src, x0, y0) as f64;
    let p10 = get_gray(src, x0 + 1, y0) as f64;
    let p01 = get_gray(src, x0, y0 + 1) as f64;
    let p11 = get_gray(src, x0 + 1, y0 + 1) as f64;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

/// RGB to HSV on the 8-bit OpenCV scale: `H ∈ [0, 180)`, `S, V ∈ [0, 255]`.
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let r = rgb[0] as f32;
    let g = rgb[1] as f32;
    let b = rgb[2] as f32;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { 255.0 * delta / max } else { 0.0 };
    let h_deg = if delta <= 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h_deg = if h_deg < 0.0 { h_deg + 360.0 } else { h_deg };
    let h = ((h_deg / 2.0).round() as u32 % 180) as u8;

    [h, s.round().clamp(0.0, 255.0) as u8, v as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_intersection() {
        let a = PixelRect {
            x: 10,
            y: 10,
            width: 20,
            height: 20,
        };
        let b = PixelRect {
            x: 25,
            y: 0,
            width: 20,
            height: 15,
        };
        assert_eq!(
            a.intersection(&b),
            Some(PixelRect {
                x: 25,
                y: 10,
                width: 5,
                height: 5
            })
        );
        let far = PixelRect {
            x: 40,
            y: 40,
            width: 5,
            height: 5,
        };
        assert_eq!(a.intersection(&far), None);
    }

    #[test]
    fn hsv_matches_opencv_scale() {
        assert_eq!(rgb_to_hsv([255, 0, 0]), [0, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 255, 0]), [60, 255, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 255]), [120, 255, 255]);
        assert_eq!(rgb_to_hsv([255, 255, 255]), [0, 0, 255]);
        assert_eq!(rgb_to_hsv([0, 0, 0]), [0, 0, 0]);
    }

    #[test]
    fn window_is_clipped_to_frame() {
        let r = PixelRect::around(Pt2::new(5.0, 5.0), 20.0, 64, 48).expect("window");
        assert_eq!(r.x, 0);
        assert_eq!(r.y, 0);
        assert!(r.is_within(64, 48));

        let r = PixelRect::around(Pt2::new(60.0, 40.0), 10.0, 64, 48).expect("window");
        assert_eq!(r.right(), 64);
        assert_eq!(r.bottom(), 48);

        assert!(PixelRect::around(Pt2::new(-50.0, -50.0), 10.0, 64, 48).is_none());
    }

    #[test]
    fn depth_median_ignores_invalid_samples() {
        let mut data = vec![0.0f32; 25];
        data[12] = 1.5;
        data[13] = 1.6;
        data[7] = 1.4;
        let depth = DepthMap::from_raw(5, 5, data).expect("depth");
        let d = depth.median_around(Pt2::new(2.5, 2.5), 1).expect("median");
        assert_eq!(d, 1.5);
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        assert_eq!(
            ColorImage::from_raw(4, 4, vec![0; 10]),
            Err(ImageBufferError::InvalidLength {
                expected: 48,
                got: 10
            })
        );
        assert!(ColorImage::from_raw(0, 4, vec![]).is_err());
    }
}
