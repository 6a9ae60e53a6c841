use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use nalgebra::UnitQuaternion;
use robot_tracker_core::{CameraId, CameraModel, Iso3, Pt2, Pt3, Vec3};
use serde::{Deserialize, Serialize};

use crate::{CalibrationError, CalibrationParams, ExtrinsicCalibration, IntrinsicCalibration};

/// Calibration of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub model: CameraModel,
    /// `None` until an extrinsic run covered this camera with its current model.
    pub robot_from_camera: Option<Iso3>,
    pub intrinsic_residual_px: f64,
    pub extrinsic_residual_px: Option<f64>,
}

impl CameraCalibration {
    pub fn new(model: CameraModel) -> Self {
        Self {
            model,
            robot_from_camera: None,
            intrinsic_residual_px: 0.0,
            extrinsic_residual_px: None,
        }
    }

    pub fn residual_px(&self) -> f64 {
        self.intrinsic_residual_px
            .max(self.extrinsic_residual_px.unwrap_or(0.0))
    }
}

/// How usable a set is for coordinate lift.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationHealth {
    Valid,
    /// Usable, but older than `max_age` or with a residual above
    /// `stale_residual_px`. Poses are flagged degraded.
    Stale,
    /// Missing the reference extrinsics or above the acceptance threshold.
    Invalid,
}

impl fmt::Display for CalibrationHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationHealth::Valid => "valid",
            CalibrationHealth::Stale => "stale",
            CalibrationHealth::Invalid => "invalid",
        })
    }
}

/// Immutable snapshot of every camera's calibration.
///
/// The rig frame is the camera frame of `reference`. A new calibration run
/// produces a new set; sets are never edited in place once published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSet {
    pub reference: Option<CameraId>,
    pub cameras: BTreeMap<CameraId, CameraCalibration>,
    pub timestamp: SystemTime,
    /// Worst per-camera RMS reprojection error, px.
    pub residual_error: f64,
}

impl Default for CalibrationSet {
    fn default() -> Self {
        Self {
            reference: None,
            cameras: BTreeMap::new(),
            timestamp: SystemTime::UNIX_EPOCH,
            residual_error: 0.0,
        }
    }
}

impl CalibrationSet {
    /// Build a set from known models, e.g. configured intrinsics overrides.
    pub fn from_models(models: impl IntoIterator<Item = (CameraId, CameraModel)>) -> Self {
        let mut set = Self {
            cameras: models
                .into_iter()
                .map(|(id, m)| (id, CameraCalibration::new(m)))
                .collect(),
            timestamp: SystemTime::now(),
            ..Self::default()
        };
        set.update_residual();
        set
    }

    fn update_residual(&mut self) {
        self.residual_error = self
            .cameras
            .values()
            .map(CameraCalibration::residual_px)
            .fold(0.0, f64::max);
    }

    /// Copy with `camera`'s lens model replaced. The camera's extrinsics are
    /// dropped because they were solved with the old model.
    pub fn with_intrinsics(&self, calib: &IntrinsicCalibration, timestamp: SystemTime) -> Self {
        let mut next = self.clone();
        if let Some(old) = next.cameras.get(&calib.camera) {
            if old.robot_from_camera.is_some() {
                log::warn!(
                    "{}: intrinsics replaced, extrinsics must be recalibrated",
                    calib.camera
                );
            }
        }
        next.cameras.insert(
            calib.camera,
            CameraCalibration {
                model: calib.model,
                robot_from_camera: None,
                intrinsic_residual_px: calib.rms_px,
                extrinsic_residual_px: None,
            },
        );
        next.timestamp = timestamp;
        next.update_residual();
        next
    }

    /// Copy with the solved camera-to-robot transforms applied.
    ///
    /// The existing reference is kept when the solve covered it; otherwise the
    /// solve's reference becomes the rig frame.
    pub fn with_extrinsics(
        &self,
        calib: &ExtrinsicCalibration,
        timestamp: SystemTime,
    ) -> Result<Self, CalibrationError> {
        let mut next = self.clone();
        for (&camera, ext) in &calib.cameras {
            let entry = next
                .cameras
                .get_mut(&camera)
                .ok_or(CalibrationError::UnknownCamera(camera))?;
            entry.robot_from_camera = Some(ext.robot_from_camera);
            entry.extrinsic_residual_px = Some(ext.rms_px);
        }
        let keep = next
            .reference
            .is_some_and(|r| next.robot_from_camera(r).is_some());
        if !keep {
            next.reference = Some(calib.reference);
        }
        next.timestamp = timestamp;
        next.update_residual();
        Ok(next)
    }

    /// Usable for coordinate lift: the reference has extrinsics and the
    /// residual is below `threshold_px`.
    pub fn is_valid(&self, threshold_px: f64) -> bool {
        self.robot_from_reference().is_some() && self.residual_error < threshold_px
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.timestamp).unwrap_or(Duration::ZERO)
    }

    pub fn health(&self, params: &CalibrationParams, now: SystemTime) -> CalibrationHealth {
        if !self.is_valid(params.max_reprojection_error_px) {
            CalibrationHealth::Invalid
        } else if self.age(now) > params.max_age() || self.residual_error > params.stale_residual_px
        {
            CalibrationHealth::Stale
        } else {
            CalibrationHealth::Valid
        }
    }

    pub fn camera(&self, camera: CameraId) -> Option<&CameraCalibration> {
        self.cameras.get(&camera)
    }

    pub fn model(&self, camera: CameraId) -> Option<&CameraModel> {
        self.cameras.get(&camera).map(|c| &c.model)
    }

    pub fn robot_from_camera(&self, camera: CameraId) -> Option<Iso3> {
        self.cameras.get(&camera)?.robot_from_camera
    }

    pub fn robot_from_reference(&self) -> Option<Iso3> {
        self.robot_from_camera(self.reference?)
    }

    /// `rig_from_camera`: `camera`'s frame expressed in the reference camera frame.
    pub fn rig_from_camera(&self, camera: CameraId) -> Option<Iso3> {
        Some(self.robot_from_reference()?.inverse() * self.robot_from_camera(camera)?)
    }

    /// Re-express a camera-frame point in the rig frame.
    pub fn to_rig(&self, camera: CameraId, p_camera: &Pt3) -> Option<Pt3> {
        Some(self.rig_from_camera(camera)? * p_camera)
    }

    /// Rig-frame point to the robot frame.
    pub fn lift_point(&self, p_rig: &Pt3) -> Option<Pt3> {
        Some(self.robot_from_reference()? * p_rig)
    }

    /// Robot-frame point to the rig frame; inverse of [`lift_point`](Self::lift_point).
    pub fn unlift_point(&self, p_robot: &Pt3) -> Option<Pt3> {
        Some(self.robot_from_reference()?.inverse_transform_point(p_robot))
    }

    /// Intersect the viewing ray of `pixel` with the robot-frame plane
    /// `z = plane_z`. `None` when the ray is parallel to or points away from
    /// the plane.
    pub fn lift_image_point(&self, camera: CameraId, pixel: Pt2, plane_z: f64) -> Option<Pt3> {
        let calib = self.cameras.get(&camera)?;
        let robot_from_camera = calib.robot_from_camera?;
        let dir: Vec3 = robot_from_camera.rotation * calib.model.ray(pixel);
        let origin = Pt3::from(robot_from_camera.translation.vector);
        if dir.z.abs() < 1e-12 {
            return None;
        }
        let t = (plane_z - origin.z) / dir.z;
        if t <= 0.0 {
            return None;
        }
        Some(origin + dir * t)
    }

    /// Pixel of a rig-frame point in `camera`.
    pub fn project_rig_point(&self, camera: CameraId, p_rig: &Pt3) -> Option<Pt2> {
        let camera_from_rig = self.rig_from_camera(camera)?.inverse();
        self.model(camera)?.project(&(camera_from_rig * p_rig))
    }

    /// Robot-frame orientation of an in-plane rotation `theta` measured about
    /// `camera`'s optical axis.
    pub fn robot_orientation(&self, camera: CameraId, theta: f64) -> Option<UnitQuaternion<f64>> {
        let robot_from_camera = self.robot_from_camera(camera)?;
        Some(robot_from_camera.rotation * UnitQuaternion::from_axis_angle(&Vec3::z_axis(), theta))
    }

    /// Metres covered by one pixel of `camera` at the depth of `p_robot`.
    pub fn metres_per_pixel(&self, camera: CameraId, p_robot: &Pt3) -> Option<f64> {
        let calib = self.cameras.get(&camera)?;
        let depth = calib.robot_from_camera?.inverse_transform_point(p_robot).z;
        let k = &calib.model.intrinsics;
        let f = 0.5 * (k.fx + k.fy);
        (depth > 0.0 && f > 0.0).then_some(depth / f)
    }
}
