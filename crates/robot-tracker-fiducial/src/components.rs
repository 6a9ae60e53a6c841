//! Binary masks, morphology and connected-component labeling.

use robot_tracker_core::{PixelRect, Pt2};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Mask {
    pub width: usize,
    pub height: usize,
    data: Vec<bool>,
}

impl Mask {
    pub(crate) fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    /// Evaluate `pred` on every pixel covered by `regions`.
    pub(crate) fn from_regions(
        width: usize,
        height: usize,
        regions: &[PixelRect],
        mut pred: impl FnMut(usize, usize) -> bool,
    ) -> Self {
        let mut m = Self::new(width, height);
        for r in regions {
            let x1 = (r.right() as usize).min(width);
            let y1 = (r.bottom() as usize).min(height);
            for y in r.y as usize..y1 {
                for x in r.x as usize..x1 {
                    let i = y * width + x;
                    if !m.data[i] && pred(x, y) {
                        m.data[i] = true;
                    }
                }
            }
        }
        m
    }

    #[inline]
    pub(crate) fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    #[inline]
    pub(crate) fn set(&mut self, x: usize, y: usize, v: bool) {
        self.data[y * self.width + x] = v;
    }

    pub(crate) fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Morphological closing (dilate `iterations` times, then erode as often)
    /// with a disk of the given kernel size. Work is limited to `work`.
    pub(crate) fn close(&self, kernel_size: usize, iterations: usize, work: PixelRect) -> Mask {
        if kernel_size <= 1 || iterations == 0 {
            return self.clone();
        }
        let offsets = disk_offsets(kernel_size / 2);
        let mut m = self.clone();
        for _ in 0..iterations {
            m = m.morph(&offsets, work, true);
        }
        for _ in 0..iterations {
            m = m.morph(&offsets, work, false);
        }
        m
    }

    fn morph(&self, offsets: &[(i32, i32)], work: PixelRect, dilate: bool) -> Mask {
        let mut out = self.clone();
        let x1 = (work.right() as usize).min(self.width);
        let y1 = (work.bottom() as usize).min(self.height);
        for y in work.y as usize..y1 {
            for x in work.x as usize..x1 {
                let mut hit = !dilate;
                for &(dx, dy) in offsets {
                    let (nx, ny) = (x as i32 + dx, y as i32 + dy);
                    if nx < 0 || ny < 0 || nx >= self.width as i32 || ny >= self.height as i32 {
                        continue;
                    }
                    let v = self.get(nx as usize, ny as usize);
                    if dilate && v {
                        hit = true;
                        break;
                    }
                    if !dilate && !v {
                        hit = false;
                        break;
                    }
                }
                out.set(x, y, hit);
            }
        }
        out
    }
}

fn disk_offsets(radius: usize) -> Vec<(i32, i32)> {
    let r = radius as i32;
    let lim = (radius as f64 + 0.5).powi(2);
    let mut out = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            if ((dx * dx + dy * dy) as f64) <= lim {
                out.push((dx, dy));
            }
        }
    }
    out
}

/// One 8-connected foreground component.
#[derive(Clone, Debug)]
pub(crate) struct Component {
    pub pixels: Vec<(u32, u32)>,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Component {
    #[inline]
    pub(crate) fn area(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub(crate) fn bbox_width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    #[inline]
    pub(crate) fn bbox_height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    /// Centroid of pixel centers.
    pub(crate) fn centroid(&self) -> Pt2 {
        let n = self.pixels.len().max(1) as f64;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
        Pt2::new(sx / n + 0.5, sy / n + 0.5)
    }

    /// Fraction of the enclosing disk filled by the component, in `[0, 1]`.
    ///
    /// The enclosing radius is the largest pixel-center distance from the
    /// centroid plus half a pixel.
    pub(crate) fn circularity(&self) -> f64 {
        let c = self.centroid();
        let r_max = self
            .pixels
            .iter()
            .map(|&(x, y)| {
                let dx = x as f64 + 0.5 - c.x;
                let dy = y as f64 + 0.5 - c.y;
                dx * dx + dy * dy
            })
            .fold(0.0, f64::max)
            .sqrt();
        let disk = std::f64::consts::PI * (r_max + 0.5).powi(2);
        (self.area() as f64 / disk).min(1.0)
    }

    /// Outer silhouette: the leftmost and rightmost pixel of every row and the
    /// topmost and bottommost pixel of every column, as pixel centers.
    pub(crate) fn silhouette(&self) -> Vec<Pt2> {
        let w = self.bbox_width() as usize;
        let h = self.bbox_height() as usize;
        let mut row = vec![(u32::MAX, 0u32); h];
        let mut col = vec![(u32::MAX, 0u32); w];
        for &(x, y) in &self.pixels {
            let r = &mut row[(y - self.min_y) as usize];
            r.0 = r.0.min(x);
            r.1 = r.1.max(x);
            let c = &mut col[(x - self.min_x) as usize];
            c.0 = c.0.min(y);
            c.1 = c.1.max(y);
        }
        let mut out = Vec::with_capacity(2 * (w + h));
        for (i, &(lo, hi)) in row.iter().enumerate() {
            if lo == u32::MAX {
                continue;
            }
            let y = (self.min_y as usize + i) as f64 + 0.5;
            out.push(Pt2::new(lo as f64 + 0.5, y));
            if hi != lo {
                out.push(Pt2::new(hi as f64 + 0.5, y));
            }
        }
        for (i, &(lo, hi)) in col.iter().enumerate() {
            if lo == u32::MAX {
                continue;
            }
            let x = (self.min_x as usize + i) as f64 + 0.5;
            out.push(Pt2::new(x, lo as f64 + 0.5));
            if hi != lo {
                out.push(Pt2::new(x, hi as f64 + 0.5));
            }
        }
        out
    }
}

/// 8-connected labeling in raster order. Components smaller than `min_area`
/// are dropped.
pub(crate) fn label_components(mask: &Mask, min_area: usize) -> Vec<Component> {
    let (w, h) = (mask.width, mask.height);
    let mut labels = vec![0u32; w * h];
    let mut components = Vec::new();
    let mut next = 1u32;
    let mut stack = Vec::new();

    for y0 in 0..h {
        for x0 in 0..w {
            if !mask.get(x0, y0) || labels[y0 * w + x0] != 0 {
                continue;
            }
            let label = next;
            next += 1;
            let mut comp = Component {
                pixels: Vec::new(),
                min_x: x0 as u32,
                min_y: y0 as u32,
                max_x: x0 as u32,
                max_y: y0 as u32,
            };
            labels[y0 * w + x0] = label;
            stack.push((x0, y0));
            while let Some((x, y)) = stack.pop() {
                comp.pixels.push((x as u32, y as u32));
                comp.min_x = comp.min_x.min(x as u32);
                comp.min_y = comp.min_y.min(y as u32);
                comp.max_x = comp.max_x.max(x as u32);
                comp.max_y = comp.max_y.max(y as u32);
                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as usize, ny as usize);
                        let i = ny * w + nx;
                        if labels[i] == 0 && mask.get(nx, ny) {
                            labels[i] = label;
                            stack.push((nx, ny));
                        }
                    }
                }
            }
            if comp.area() >= min_area {
                comp.pixels.sort_unstable_by_key(|&(x, y)| (y, x));
                components.push(comp);
            }
        }
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> Mask {
        let mut m = Mask::new(rows[0].len(), rows.len());
        for (y, r) in rows.iter().enumerate() {
            for (x, c) in r.chars().enumerate() {
                m.set(x, y, c == '#');
            }
        }
        m
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let m = mask_from(&["#...", ".#..", "....", "..##"]);
        let l = label_components(&m, 1);
        assert_eq!(l.len(), 2);
        assert_eq!(l[0].area(), 2);
        assert_eq!(l[1].area(), 2);
    }

    #[test]
    fn small_components_are_filtered() {
        let m = mask_from(&["#...", "....", ".###", ".###"]);
        let l = label_components(&m, 3);
        assert_eq!(l.len(), 1);
        assert_eq!(l[0].bbox_width(), 3);
    }

    #[test]
    fn closing_fills_small_gaps() {
        let m = mask_from(&[
            ".......", ".###...", ".#.#...", ".###...", ".......", ".......",
        ]);
        let closed = m.close(3, 1, PixelRect::full(7, 6));
        assert!(closed.get(2, 2));
        assert!(!closed.get(5, 5));
    }

    #[test]
    fn square_is_less_circular_than_disk() {
        let mut m = Mask::new(40, 40);
        for y in 0..40 {
            for x in 0..40 {
                let dx = x as f64 + 0.5 - 20.0;
                let dy = y as f64 + 0.5 - 20.0;
                if dx * dx + dy * dy <= 100.0 {
                    m.set(x, y, true);
                }
            }
        }
        let disk = label_components(&m, 1)[0].circularity();

        let mut s = Mask::new(40, 40);
        for y in 10..30 {
            for x in 10..30 {
                s.set(x, y, true);
            }
        }
        let square = label_components(&s, 1)[0].circularity();
        assert!(disk > 0.85, "disk {disk}");
        assert!(square < 0.7, "square {square}");
    }
}
