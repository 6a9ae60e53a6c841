use crate::{Mat3, Pt2};
use nalgebra::{DMatrix, SMatrix, SVector, Vector3};

/// Plane-to-plane projective map, `dst ~ H * src`, normalized so `H[2,2] = 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Mat3,
}

impl Homography {
    pub fn new(h: Mat3) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Mat3::identity())
    }

    #[inline]
    pub fn apply(&self, p: Pt2) -> Pt2 {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Pt2::new(v[0] / v[2], v[1] / v[2])
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

/// Translate to the centroid and scale so the mean distance is `sqrt(2)`.
fn normalize_points(pts: &[Pt2]) -> (Vec<Pt2>, Mat3) {
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Mat3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);

    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Pt2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn finish(hn: Mat3, t_src: Mat3, t_dst: Mat3) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Homography::new(h / s))
}

/// Estimate `H` such that `dst ~ H * src` from `N >= 4` correspondences.
///
/// Exactly four points use the direct 8x8 solve; more use the normalized DLT.
pub fn estimate_homography(src: &[Pt2], dst: &[Pt2]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }
    if src.len() == 4 {
        let s: &[Pt2; 4] = src.try_into().ok()?;
        let d: &[Pt2; 4] = dst.try_into().ok()?;
        return homography_from_4pt(s, d);
    }

    let (s, ts) = normalize_points(src);
    let (d, td) = normalize_points(dst);

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for k in 0..n {
        let (x, y) = (s[k].x, s[k].y);
        let (u, v) = (d[k].x, d[k].y);

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // Null vector of A: last row of V^T.
    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let last = vt.nrows().checked_sub(1)?;
    let h = vt.row(last);
    let hn = Mat3::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);

    finish(hn, ts, td)
}

/// `dst ~ H * src` from exactly four correspondences, with `h33 = 1`.
///
/// Corner order must be consistent between `src` and `dst`.
pub fn homography_from_4pt(src: &[Pt2; 4], dst: &[Pt2; 4]) -> Option<Homography> {
    let (s, ts) = normalize_points(src);
    let (d, td) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for k in 0..4 {
        let (x, y) = (s[k].x, s[k].y);
        let (u, v) = (d[k].x, d[k].y);

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = r0 + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Mat3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
    finish(hn, ts, td)
}
