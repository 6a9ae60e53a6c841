//! ArUco marker detection: dark-quad candidates, perspective bit sampling and
//! dictionary decoding.

use std::collections::HashSet;

use robot_tracker_core::{
    homography_from_4pt, planar_pose_from_homography, sample_bilinear, CameraModel, Frame,
    GrayImageView, Homography, Mat3, Modality, Observation, PixelRect, Pt2, Pt3, TargetId,
};

use crate::components::{label_components, Mask};
use crate::threshold::Histogram;
use crate::{ArucoParams, DetectorConfigError, Matcher};

/// One decoded marker in image coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerDetection {
    pub id: u32,
    /// Marker corners in the marker's own order (TL, TR, BR, BL of the
    /// printed pattern).
    pub corners: [Pt2; 4],
    pub center: Pt2,
    pub rotation: u8,
    pub hamming: u8,
    pub border_score: f64,
    /// Mean distance of the silhouette to the fitted quad, px.
    pub residual_px: f64,
    pub confidence: f64,
}

impl MarkerDetection {
    /// Square root of the quad area, px.
    pub fn side_px(&self) -> f64 {
        quad_area(&self.corners).sqrt()
    }

    /// Direction of the first marker edge (TL → TR), radians.
    pub fn angle(&self) -> f64 {
        let d = self.corners[1] - self.corners[0];
        d.y.atan2(d.x)
    }
}

#[derive(Clone, Debug)]
pub struct ArucoDetector {
    params: ArucoParams,
    matcher: Matcher,
}

impl ArucoDetector {
    pub fn new(params: ArucoParams) -> Result<Self, DetectorConfigError> {
        params.validate()?;
        let matcher = Matcher::new(&params.dictionary, params.effective_max_hamming()).ok_or(
            DetectorConfigError::DictionaryTooLarge {
                marker_size: params.dictionary.marker_size,
                bits: params.dictionary.bit_count(),
            },
        )?;
        Ok(Self { params, matcher })
    }

    pub fn params(&self) -> &ArucoParams {
        &self.params
    }

    /// Decode every marker inside `regions`, best detection per id.
    pub fn detect_markers(
        &self,
        gray: &GrayImageView<'_>,
        regions: &[PixelRect],
    ) -> Vec<MarkerDetection> {
        let dark = self.dark_mask(gray, regions);
        let min_side = self.params.min_side_px;
        let max_side = self.params.max_side_frac * gray.width.max(gray.height) as f64;
        let min_area = (0.25 * min_side * min_side) as usize;

        let mut out = Vec::new();
        for comp in label_components(&dark, min_area.max(4)) {
            let side = comp.bbox_width().max(comp.bbox_height()) as f64;
            if side < min_side || side > max_side {
                continue;
            }
            let silhouette = comp.silhouette();
            let Some(quad) = fit_quad(&silhouette, comp.centroid(), min_side) else {
                continue;
            };
            let fill = comp.area() as f64 / quad_area(&quad);
            if !(0.3..=1.3).contains(&fill) {
                continue;
            }
            let residual = (mean_edge_distance(&silhouette, &quad) - 0.5).max(0.0);
            if residual > self.params.max_residual_px {
                continue;
            }
            if let Some(det) = self.decode_quad(gray, quad, residual) {
                out.push(det);
            }
        }
        dedup_by_id_keep_best(out)
    }

    /// Full observation pass for one frame.
    pub fn detect(
        &self,
        frame: &Frame,
        gray: &GrayImageView<'_>,
        regions: &[PixelRect],
    ) -> Vec<Observation> {
        self.detect_markers(gray, regions)
            .into_iter()
            .map(|m| {
                let mut obs = Observation::new(
                    Modality::ArucoMarker,
                    m.center,
                    m.confidence,
                    frame.camera_id(),
                    frame.timestamp(),
                )
                .with_target_hint(TargetId(m.id))
                .with_orientation(m.angle());
                obs.corners = Some(m.corners);
                obs.size_px = m.side_px();
                if let (Some(len), Some(model)) = (self.params.marker_length_m, frame.intrinsics())
                {
                    obs.point_3d = marker_center_3d(&m.corners, len, model);
                }
                obs
            })
            .collect()
    }

    /// Per-region Otsu split; low-contrast regions contribute nothing.
    fn dark_mask(&self, gray: &GrayImageView<'_>, regions: &[PixelRect]) -> Mask {
        let mut mask = Mask::new(gray.width, gray.height);
        for r in regions {
            let x1 = (r.right() as usize).min(gray.width);
            let y1 = (r.bottom() as usize).min(gray.height);
            if r.x as usize >= x1 || r.y as usize >= y1 {
                continue;
            }
            let mut hist = Histogram::new();
            for y in r.y as usize..y1 {
                for &v in &gray.data[y * gray.width + r.x as usize..y * gray.width + x1] {
                    hist.push(v);
                }
            }
            let Some((lo, hi)) = hist.range() else {
                continue;
            };
            if hi - lo < self.params.min_contrast {
                continue;
            }
            let t = hist.otsu();
            for y in r.y as usize..y1 {
                for x in r.x as usize..x1 {
                    if gray.data[y * gray.width + x] < t {
                        mask.set(x, y, true);
                    }
                }
            }
        }
        mask
    }

    fn decode_quad(
        &self,
        gray: &GrayImageView<'_>,
        quad: [Pt2; 4],
        residual: f64,
    ) -> Option<MarkerDetection> {
        let bits = self.params.dictionary.marker_size;
        let cells = bits + 2;
        let c = cells as f64;
        let canon = [
            Pt2::new(0.0, 0.0),
            Pt2::new(c, 0.0),
            Pt2::new(c, c),
            Pt2::new(0.0, c),
        ];
        let h = homography_from_4pt(&canon, &quad)?;

        let values = sample_cells(gray, &h, cells, self.params.inset_frac);
        let thr = threshold_samples(gray, &h, cells);
        let (code, border_score) = decode_samples(&values, thr, cells, bits);
        if border_score < self.params.min_border_score {
            return None;
        }

        let m = self.matcher.match_code(code)?;
        let ham_pen = 1.0 - m.hamming as f64 / self.matcher.bit_count() as f64;
        let confidence =
            (border_score * ham_pen / (1.0 + residual / self.params.residual_scale_px))
                .clamp(0.0, 1.0);

        let r = m.rotation as usize;
        let corners = [0, 1, 2, 3].map(|i| quad[(r + i) % 4]);
        Some(MarkerDetection {
            id: m.id,
            corners,
            center: h.apply(Pt2::new(0.5 * c, 0.5 * c)),
            rotation: m.rotation,
            hamming: m.hamming,
            border_score,
            residual_px: residual,
            confidence,
        })
    }
}

/// Bilinear sample with pixel `i` centered at `i + 0.5`.
#[inline]
fn sample_at_center(gray: &GrayImageView<'_>, p: Pt2) -> f64 {
    sample_bilinear(gray, p.x - 0.5, p.y - 0.5)
}

/// Mean of five bilinear samples per cell (center plus four inset diagonals).
fn sample_cells(gray: &GrayImageView<'_>, h: &Homography, cells: usize, inset: f64) -> Vec<f64> {
    let d = 0.5 * (0.5 - inset).max(0.0);
    let offsets = [(0.0, 0.0), (-d, -d), (d, -d), (d, d), (-d, d)];
    let mut out = Vec::with_capacity(cells * cells);
    for cy in 0..cells {
        for cx in 0..cells {
            let (u, v) = (cx as f64 + 0.5, cy as f64 + 0.5);
            let sum: f64 = offsets
                .iter()
                .map(|&(du, dv)| {
                    let q = h.apply(Pt2::new(u + du, v + dv));
                    sample_at_center(gray, q)
                })
                .sum();
            out.push(sum / offsets.len() as f64);
        }
    }
    out
}

/// Otsu threshold over a grid three times finer than the cell grid.
fn threshold_samples(gray: &GrayImageView<'_>, h: &Homography, cells: usize) -> f64 {
    const SUBDIV: usize = 3;
    let n = cells * SUBDIV;
    let step = cells as f64 / n as f64;
    let mut hist = Histogram::new();
    for ty in 0..n {
        for tx in 0..n {
            let q = h.apply(Pt2::new((tx as f64 + 0.5) * step, (ty as f64 + 0.5) * step));
            hist.push(sample_at_center(gray, q).round().clamp(0.0, 255.0) as u8);
        }
    }
    hist.otsu() as f64
}

/// Inner bits (black = 1, row-major) and the black fraction of the border ring.
fn decode_samples(values: &[f64], thr: f64, cells: usize, bits: usize) -> (u64, f64) {
    let mut code = 0u64;
    let mut border_ok = 0u32;
    let mut border_total = 0u32;
    for cy in 0..cells {
        for cx in 0..cells {
            let black = values[cy * cells + cx] < thr;
            let border = cx == 0 || cy == 0 || cx + 1 == cells || cy + 1 == cells;
            if border {
                border_total += 1;
                border_ok += black as u32;
            } else if black {
                code |= 1u64 << ((cy - 1) * bits + (cx - 1));
            }
        }
    }
    (code, border_ok as f64 / border_total.max(1) as f64)
}

/// Four extreme silhouette points ordered clockwise (image y down), pushed
/// half a pixel diagonal outwards from the pixel centers.
fn fit_quad(points: &[Pt2], center: Pt2, min_side: f64) -> Option<[Pt2; 4]> {
    let far = |from: Pt2| {
        points
            .iter()
            .copied()
            .max_by(|a, b| (*a - from).norm_squared().total_cmp(&(*b - from).norm_squared()))
    };
    let p0 = far(center)?;
    let p1 = far(p0)?;
    let axis = p1 - p0;
    let len = axis.norm();
    if len < min_side {
        return None;
    }
    let signed = |p: &Pt2| (axis.x * (p.y - p0.y) - axis.y * (p.x - p0.x)) / len;
    let p2 = points
        .iter()
        .copied()
        .max_by(|a, b| signed(a).total_cmp(&signed(b)))?;
    let p3 = points
        .iter()
        .copied()
        .min_by(|a, b| signed(a).total_cmp(&signed(b)))?;
    let min_height = 0.25 * min_side;
    if signed(&p2) < min_height || -signed(&p3) < min_height {
        return None;
    }

    let mut quad = [p0, p2, p1, p3];
    quad.sort_by(|a, b| {
        let ta = (a.y - center.y).atan2(a.x - center.x);
        let tb = (b.y - center.y).atan2(b.x - center.x);
        ta.total_cmp(&tb)
    });
    for q in &mut quad {
        let dir = *q - center;
        let n = dir.norm();
        if n > 1e-9 {
            *q += dir * (std::f64::consts::FRAC_1_SQRT_2 / n);
        }
    }
    is_convex(&quad).then_some(quad)
}

fn is_convex(q: &[Pt2; 4]) -> bool {
    let mut sign = 0.0f64;
    for i in 0..4 {
        let a = q[(i + 1) % 4] - q[i];
        let b = q[(i + 2) % 4] - q[(i + 1) % 4];
        let cross = a.x * b.y - a.y * b.x;
        if cross.abs() < 1e-9 {
            return false;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    true
}

fn quad_area(q: &[Pt2; 4]) -> f64 {
    let mut a = 0.0;
    for i in 0..4 {
        let (p, n) = (q[i], q[(i + 1) % 4]);
        a += p.x * n.y - n.x * p.y;
    }
    0.5 * a.abs()
}

fn mean_edge_distance(points: &[Pt2], q: &[Pt2; 4]) -> f64 {
    if points.is_empty() {
        return f64::INFINITY;
    }
    let total: f64 = points
        .iter()
        .map(|p| {
            (0..4)
                .map(|i| point_segment_distance(*p, q[i], q[(i + 1) % 4]))
                .fold(f64::INFINITY, f64::min)
        })
        .sum();
    total / points.len() as f64
}

fn point_segment_distance(p: Pt2, a: Pt2, b: Pt2) -> f64 {
    let ab = b - a;
    let t = ((p - a).dot(&ab) / ab.norm_squared().max(1e-12)).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// Camera-frame marker center from the corner homography and the printed side.
fn marker_center_3d(corners: &[Pt2; 4], length_m: f64, model: &CameraModel) -> Option<Pt3> {
    let h = 0.5 * length_m;
    let object = [
        Pt2::new(-h, -h),
        Pt2::new(h, -h),
        Pt2::new(h, h),
        Pt2::new(-h, h),
    ];
    let normalized = corners.map(|c| {
        let n = model.undistort_pixel(c);
        Pt2::new(n.x, n.y)
    });
    let hom = homography_from_4pt(&object, &normalized)?;
    let pose = planar_pose_from_homography(&Mat3::identity(), &hom.h)?;
    let t = pose.translation.vector;
    Some(Pt3::new(t.x, t.y, t.z))
}

fn dedup_by_id_keep_best(mut dets: Vec<MarkerDetection>) -> Vec<MarkerDetection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence).then(a.id.cmp(&b.id)));
    let mut seen = HashSet::new();
    dets.retain(|d| seen.insert(d.id));
    dets.sort_by_key(|d| d.id);
    dets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::rotate_code_u64;
    use crate::Dictionary;
    use approx::assert_relative_eq;
    use robot_tracker_core::synthetic::{render_marker, square_corners, WHITE};
    use robot_tracker_core::{CameraId, CameraIntrinsics, ColorImage};
    use std::time::Duration;

    fn detector() -> ArucoDetector {
        ArucoDetector::new(ArucoParams {
            dictionary: Dictionary::generate("t", 4, 12, 4),
            ..ArucoParams::default()
        })
        .expect("detector")
    }

    fn scene(id: usize, center: Pt2, side: f64, angle: f64) -> ColorImage {
        let det = detector();
        let code = det.params.dictionary.codes[id];
        let mut img = ColorImage::filled(200, 160, WHITE).expect("image");
        assert!(render_marker(
            &mut img,
            code,
            4,
            square_corners(center, side, angle)
        ));
        img
    }

    #[test]
    fn decodes_axis_aligned_marker() {
        let img = scene(5, Pt2::new(100.0, 80.0), 60.0, 0.0);
        let gray = img.to_gray();
        let dets = detector().detect_markers(&gray.view(), &[PixelRect::full(200, 160)]);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.id, 5);
        assert_eq!(d.hamming, 0);
        assert_eq!(d.rotation, 0);
        assert_relative_eq!(d.center.x, 100.0, epsilon = 0.5);
        assert_relative_eq!(d.center.y, 80.0, epsilon = 0.5);
        assert_relative_eq!(d.corners[0].x, 70.0, epsilon = 1.0);
        assert_relative_eq!(d.corners[0].y, 50.0, epsilon = 1.0);
        assert!(d.confidence > 0.6, "confidence {}", d.confidence);
    }

    #[test]
    fn rotated_marker_reports_pattern_corner_order() {
        let angle = 0.4;
        let img = scene(2, Pt2::new(100.0, 80.0), 64.0, angle);
        let gray = img.to_gray();
        let dets = detector().detect_markers(&gray.view(), &[PixelRect::full(200, 160)]);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].id, 2);
        assert_relative_eq!(dets[0].angle(), angle, epsilon = 0.06);
    }

    #[test]
    fn quarter_turned_pattern_is_matched_with_rotation() {
        let det = detector();
        let code = rotate_code_u64(det.params.dictionary.codes[7], 4, 1);
        let mut img = ColorImage::filled(200, 160, WHITE).expect("image");
        render_marker(&mut img, code, 4, square_corners(Pt2::new(90.0, 70.0), 60.0, 0.0));
        let gray = img.to_gray();
        let dets = det.detect_markers(&gray.view(), &[PixelRect::full(200, 160)]);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].id, 7);
        assert_eq!(dets[0].rotation, 1);
        // the printed pattern's first corner now sits at the top-right
        assert_relative_eq!(dets[0].corners[0].x, 120.0, epsilon = 1.0);
        assert_relative_eq!(dets[0].corners[0].y, 40.0, epsilon = 1.0);
    }

    #[test]
    fn marker_outside_regions_is_ignored() {
        let img = scene(1, Pt2::new(60.0, 60.0), 50.0, 0.0);
        let gray = img.to_gray();
        let roi = PixelRect {
            x: 120,
            y: 0,
            width: 80,
            height: 160,
        };
        assert!(detector().detect_markers(&gray.view(), &[roi]).is_empty());
    }

    #[test]
    fn marker_length_recovers_depth() {
        let k = CameraIntrinsics {
            fx: 400.0,
            fy: 400.0,
            cx: 100.0,
            cy: 80.0,
            skew: 0.0,
        };
        // 0.1 m marker at 0.8 m renders as 50 px.
        let img = scene(3, Pt2::new(100.0, 80.0), 50.0, 0.0);
        let frame = Frame::new(CameraId(0), Duration::ZERO, img)
            .with_intrinsics(CameraModel::pinhole(k));
        let gray = frame.color().to_gray();
        let det = ArucoDetector::new(ArucoParams {
            dictionary: Dictionary::generate("t", 4, 12, 4),
            marker_length_m: Some(0.1),
            ..ArucoParams::default()
        })
        .expect("detector");
        let obs = det.detect(&frame, &gray.view(), &[PixelRect::full(200, 160)]);
        assert_eq!(obs.len(), 1);
        let p = obs[0].point_3d.expect("3d point");
        assert_relative_eq!(p.z, 0.8, epsilon = 0.03);
        assert_relative_eq!(p.x, 0.0, epsilon = 0.01);
        assert_eq!(obs[0].target_hint, Some(TargetId(3)));
    }
}
