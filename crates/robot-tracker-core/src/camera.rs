use crate::{Mat3, Pt2, Pt3, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

impl CameraIntrinsics {
    pub fn k_matrix(&self) -> Mat3 {
        Mat3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Read intrinsics from an upper-triangular camera matrix.
    pub fn from_k_matrix(k: &Mat3) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
            skew: k[(0, 1)],
        }
    }

    #[inline]
    pub fn normalized_to_pixel(&self, n: Vec2) -> Pt2 {
        Pt2::new(
            self.fx * n.x + self.skew * n.y + self.cx,
            self.fy * n.y + self.cy,
        )
    }

    #[inline]
    pub fn pixel_to_normalized(&self, p: Pt2) -> Vec2 {
        let y = (p.y - self.cy) / self.fy;
        let x = (p.x - self.cx - self.skew * y) / self.fx;
        Vec2::new(x, y)
    }

    pub fn is_valid(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.fx > 0.0
            && self.fy > 0.0
    }
}

/// Brown-Conrady radial (`k1, k2, k3`) and tangential (`p1, p2`) distortion,
/// applied in normalized image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady5 {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl BrownConrady5 {
    const UNDISTORT_ITERS: usize = 10;

    /// Coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
    pub fn from_opencv(d: [f64; 5]) -> Self {
        Self {
            k1: d[0],
            k2: d[1],
            p1: d[2],
            p2: d[3],
            k3: d[4],
        }
    }

    pub fn to_opencv(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn distort(&self, n: Vec2) -> Vec2 {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xy = x * y;
        let x_tan = 2.0 * self.p1 * xy + self.p2 * (r2 + 2.0 * x * x);
        let y_tan = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * xy;
        Vec2::new(x * radial + x_tan, y * radial + y_tan)
    }

    /// Fixed-point inversion of [`distort`](Self::distort).
    pub fn undistort(&self, n_dist: Vec2) -> Vec2 {
        let mut n = n_dist;
        for _ in 0..Self::UNDISTORT_ITERS {
            n -= self.distort(n) - n_dist;
        }
        n
    }
}

/// Full lens model: intrinsics plus distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    #[serde(default)]
    pub distortion: BrownConrady5,
}

impl CameraModel {
    pub fn new(intrinsics: CameraIntrinsics, distortion: BrownConrady5) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    pub fn pinhole(intrinsics: CameraIntrinsics) -> Self {
        Self::new(intrinsics, BrownConrady5::default())
    }

    /// Project a camera-frame point to pixels. `None` behind the camera.
    pub fn project(&self, p: &Pt3) -> Option<Pt2> {
        if p.z <= 1e-12 {
            return None;
        }
        let n = Vec2::new(p.x / p.z, p.y / p.z);
        Some(self.intrinsics.normalized_to_pixel(self.distortion.distort(n)))
    }

    /// Undistorted normalized coordinates of a pixel.
    pub fn undistort_pixel(&self, p: Pt2) -> Vec2 {
        self.distortion
            .undistort(self.intrinsics.pixel_to_normalized(p))
    }

    /// Unit viewing ray through a pixel, in the camera frame.
    pub fn ray(&self, p: Pt2) -> Vec3 {
        let n = self.undistort_pixel(p);
        Vec3::new(n.x, n.y, 1.0).normalize()
    }

    /// Camera-frame point at pixel `p` with depth `z` measured along the optical axis.
    pub fn backproject(&self, p: Pt2, z: f64) -> Pt3 {
        let n = self.undistort_pixel(p);
        Pt3::new(n.x * z, n.y * z, z)
    }
}
