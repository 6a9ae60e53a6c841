//! Synthetic scene rendering for tests, benches and demos.
//!
//! Markers are drawn with a one-cell black border and the inner bits stored
//! row-major with black = 1, the same layout the ArUco decoder reads.

use crate::{homography_from_4pt, ColorImage, Pt2};

pub const WHITE: [u8; 3] = [255, 255, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];

/// Axis-aligned marker corners (TL, TR, BR, BL) of side `side` centered on `center`,
/// rotated by `angle` radians.
pub fn square_corners(center: Pt2, side: f64, angle: f64) -> [Pt2; 4] {
    let h = 0.5 * side;
    let (s, c) = angle.sin_cos();
    [(-h, -h), (h, -h), (h, h), (-h, h)].map(|(x, y)| {
        Pt2::new(center.x + c * x - s * y, center.y + s * x + c * y)
    })
}

/// Draw a marker whose outer border corners land on `corners` (TL, TR, BR, BL).
///
/// Returns `false` if the quad is degenerate.
pub fn render_marker(img: &mut ColorImage, code: u64, bits: usize, corners: [Pt2; 4]) -> bool {
    let cells = bits + 2;
    let c = cells as f64;
    let canon = [
        Pt2::new(0.0, 0.0),
        Pt2::new(c, 0.0),
        Pt2::new(c, c),
        Pt2::new(0.0, c),
    ];
    let Some(img_from_canon) = homography_from_4pt(&canon, &corners) else {
        return false;
    };
    let Some(canon_from_img) = img_from_canon.inverse() else {
        return false;
    };

    let (x0, y0, x1, y1) = bounds(&corners, img.width(), img.height());
    for y in y0..y1 {
        for x in x0..x1 {
            let q = canon_from_img.apply(Pt2::new(x as f64 + 0.5, y as f64 + 0.5));
            if q.x < 0.0 || q.y < 0.0 || q.x >= c || q.y >= c {
                continue;
            }
            let (cx, cy) = (q.x as usize, q.y as usize);
            let border = cx == 0 || cy == 0 || cx + 1 == cells || cy + 1 == cells;
            let black = border || (code >> ((cy - 1) * bits + (cx - 1))) & 1 == 1;
            img.set_pixel(x, y, if black { BLACK } else { WHITE });
        }
    }
    true
}

/// Fill a disk of `radius` pixels.
pub fn fill_disk(img: &mut ColorImage, center: Pt2, radius: f64, rgb: [u8; 3]) {
    let x0 = (center.x - radius).floor().max(0.0) as usize;
    let y0 = (center.y - radius).floor().max(0.0) as usize;
    let x1 = ((center.x + radius).ceil().max(0.0) as usize).min(img.width());
    let y1 = ((center.y + radius).ceil().max(0.0) as usize).min(img.height());
    let r2 = radius * radius;
    for y in y0..y1 {
        for x in x0..x1 {
            let dx = x as f64 + 0.5 - center.x;
            let dy = y as f64 + 0.5 - center.y;
            if dx * dx + dy * dy <= r2 {
                img.set_pixel(x, y, rgb);
            }
        }
    }
}

/// Fill an axis-aligned rectangle.
pub fn fill_rect(img: &mut ColorImage, x: usize, y: usize, w: usize, h: usize, rgb: [u8; 3]) {
    for yy in y..(y + h).min(img.height()) {
        for xx in x..(x + w).min(img.width()) {
            img.set_pixel(xx, yy, rgb);
        }
    }
}

fn bounds(pts: &[Pt2; 4], w: usize, h: usize) -> (usize, usize, usize, usize) {
    let min_x = pts.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let min_y = pts.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_x = pts.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let max_y = pts.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    (
        min_x.floor().max(0.0) as usize,
        min_y.floor().max(0.0) as usize,
        (max_x.ceil().max(0.0) as usize).min(w),
        (max_y.ceil().max(0.0) as usize).min(h),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_border_is_black_and_quiet_zone_untouched() {
        let mut img = ColorImage::filled(80, 80, WHITE).expect("image");
        let corners = square_corners(Pt2::new(40.0, 40.0), 48.0, 0.0);
        assert!(render_marker(&mut img, 0, 4, corners));
        // 6 cells of 8 px: border cell spans 16..24.
        assert_eq!(img.pixel(18, 40), BLACK);
        assert_eq!(img.pixel(40, 18), BLACK);
        assert_eq!(img.pixel(10, 10), WHITE);
        // code 0: inner cells white
        assert_eq!(img.pixel(40, 40), WHITE);
    }

    #[test]
    fn disk_is_clipped_to_image() {
        let mut img = ColorImage::filled(20, 20, BLACK).expect("image");
        fill_disk(&mut img, Pt2::new(0.0, 0.0), 5.0, WHITE);
        assert_eq!(img.pixel(1, 1), WHITE);
        assert_eq!(img.pixel(10, 10), BLACK);
    }
}
