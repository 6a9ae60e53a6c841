//! Camera-to-robot extrinsics through a shared reference target.

use std::collections::BTreeMap;

use nalgebra::DVector;
use robot_tracker_core::{
    average_isometries, estimate_homography, planar_pose_from_homography, CameraId, CameraModel,
    Iso3, Mat3, Pt2,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::intrinsic::{
    check_correspondences, pose_from_slice, pose_to_vec, push_view_residuals, rms,
};
use crate::refine::{levenberg_marquardt, LmOptions};
use crate::{CalibrationError, CalibrationParams, CancelToken};

/// One camera's view of the planar reference target while the target sits at
/// a known robot-frame pose.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicView {
    pub camera: CameraId,
    /// Pose of the target plane in the robot frame.
    pub robot_from_target: Iso3,
    /// Target-plane coordinates, metres, `z = 0`.
    pub target_points: Vec<Pt2>,
    pub pixel_points: Vec<Pt2>,
}

/// Solved transform of one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraExtrinsic {
    pub robot_from_camera: Iso3,
    pub rms_px: f64,
    pub views: usize,
}

/// Accepted extrinsic solve over every camera that saw the reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicCalibration {
    /// First camera in view order; its frame becomes the rig frame unless the
    /// active set already has a reference.
    pub reference: CameraId,
    pub cameras: BTreeMap<CameraId, CameraExtrinsic>,
}

/// `camera_from_target` of one view from its undistorted normalized points,
/// refined on pixel reprojection error.
fn view_pose(
    model: &CameraModel,
    view: &ExtrinsicView,
    cancel: &CancelToken,
) -> Result<Iso3, CalibrationError> {
    let normalized: Vec<Pt2> = view
        .pixel_points
        .iter()
        .map(|p| Pt2::from(model.undistort_pixel(*p)))
        .collect();
    let h = estimate_homography(&view.target_points, &normalized)
        .ok_or(CalibrationError::Degenerate("target homography estimation failed"))?;
    let initial = planar_pose_from_homography(&Mat3::identity(), &h.h)
        .ok_or(CalibrationError::Degenerate("target pose recovery failed"))?;

    let residuals = |x: &DVector<f64>| {
        let mut out = Vec::with_capacity(2 * view.target_points.len());
        push_view_residuals(
            &mut out,
            model,
            &pose_from_slice(x.as_slice()),
            &view.target_points,
            &view.pixel_points,
        );
        DVector::from_vec(out)
    };
    let (x, _) = levenberg_marquardt(
        residuals,
        DVector::from_row_slice(&pose_to_vec(&initial)),
        &[true; 6],
        LmOptions::default(),
        cancel,
    )?;
    Ok(pose_from_slice(x.as_slice()))
}

/// Solve `robot_from_camera` for every camera in `views`.
///
/// Each view yields `camera_from_target`; with the target's known robot-frame
/// pose this gives one `robot_from_camera` estimate per view, and the estimates
/// of a camera are averaged. Cameras are never chained through each other, so
/// errors do not accumulate with camera count. `models` supplies the lens model
/// of every camera.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(views = views.len()))
)]
pub fn calibrate_extrinsics(
    views: &[ExtrinsicView],
    models: &BTreeMap<CameraId, CameraModel>,
    params: &CalibrationParams,
    cancel: &CancelToken,
) -> Result<ExtrinsicCalibration, CalibrationError> {
    let Some(reference) = views.first().map(|v| v.camera) else {
        return Err(CalibrationError::NotEnoughViews {
            required: params.min_extrinsic_views.max(1),
            got: 0,
        });
    };

    let mut per_camera: BTreeMap<CameraId, Vec<&ExtrinsicView>> = BTreeMap::new();
    for v in views {
        check_correspondences(&v.target_points, &v.pixel_points)?;
        per_camera.entry(v.camera).or_default().push(v);
    }

    let mut cameras = BTreeMap::new();
    for (&camera, camera_views) in &per_camera {
        let required = params.min_extrinsic_views.max(1);
        if camera_views.len() < required {
            return Err(CalibrationError::NotEnoughViews {
                required,
                got: camera_views.len(),
            });
        }
        let model = models
            .get(&camera)
            .ok_or(CalibrationError::UnknownCamera(camera))?;

        let mut estimates = Vec::with_capacity(camera_views.len());
        for view in camera_views {
            cancel.check()?;
            let camera_from_target = view_pose(model, view, cancel)?;
            estimates.push(view.robot_from_target * camera_from_target.inverse());
        }
        let robot_from_camera = average_isometries(&estimates)
            .ok_or(CalibrationError::Degenerate("could not average camera poses"))?;

        let camera_from_robot = robot_from_camera.inverse();
        let mut residuals = Vec::new();
        for view in camera_views {
            push_view_residuals(
                &mut residuals,
                model,
                &(camera_from_robot * view.robot_from_target),
                &view.target_points,
                &view.pixel_points,
            );
        }
        let rms_px = rms(&residuals);
        if !params.accepts_rms(rms_px) {
            log::warn!(
                "{camera}: extrinsic rms {rms_px:.3} px is not below {:.3} px",
                params.max_reprojection_error_px
            );
            return Err(CalibrationError::ExtrinsicCalibrationFailed {
                camera,
                rms_px,
                threshold_px: params.max_reprojection_error_px,
            });
        }
        let t = robot_from_camera.translation.vector;
        log::info!(
            "{camera}: robot_from_camera t=({:.4}, {:.4}, {:.4}) m, rms {rms_px:.3} px, {} views",
            t.x,
            t.y,
            t.z,
            camera_views.len()
        );
        cameras.insert(
            camera,
            CameraExtrinsic {
                robot_from_camera,
                rms_px,
                views: camera_views.len(),
            },
        );
    }

    Ok(ExtrinsicCalibration { reference, cameras })
}

#[cfg(test)]
pub(crate) mod synthetic {
    use super::*;
    use nalgebra::{Rotation3, Translation3};
    use robot_tracker_core::{CameraIntrinsics, Pt3};

    pub fn model() -> CameraModel {
        CameraModel::pinhole(CameraIntrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        })
    }

    /// Cameras above a table looking down (`-z` in the robot frame).
    pub fn robot_from_camera(camera: CameraId) -> Iso3 {
        let down = Rotation3::from_euler_angles(std::f64::consts::PI, 0.0, 0.0);
        let x = 0.3 * camera.0 as f64 - 0.15;
        Iso3::from_parts(
            Translation3::new(x, 0.05, 1.2),
            (down * Rotation3::from_euler_angles(0.0, -x * 0.5, 0.02)).into(),
        )
    }

    pub fn target_points() -> Vec<Pt2> {
        let mut pts = Vec::new();
        for j in 0..5 {
            for i in 0..5 {
                pts.push(Pt2::new(i as f64 * 0.04 - 0.08, j as f64 * 0.04 - 0.08));
            }
        }
        pts
    }

    pub fn robot_from_target(k: usize) -> Iso3 {
        Iso3::from_parts(
            Translation3::new(0.02 * k as f64, -0.01 * k as f64, 0.1),
            Rotation3::from_euler_angles(0.05 * k as f64, -0.04, 0.3 * k as f64).into(),
        )
    }

    pub fn views(cameras: &[CameraId], poses: usize) -> Vec<ExtrinsicView> {
        let model = model();
        let mut out = Vec::new();
        for k in 0..poses {
            let robot_from_target = robot_from_target(k);
            for &camera in cameras {
                let camera_from_target = robot_from_camera(camera).inverse() * robot_from_target;
                let target_points = target_points();
                let pixel_points = target_points
                    .iter()
                    .filter_map(|p| model.project(&(camera_from_target * Pt3::new(p.x, p.y, 0.0))))
                    .collect();
                out.push(ExtrinsicView {
                    camera,
                    robot_from_target,
                    target_points,
                    pixel_points,
                });
            }
        }
        out
    }

    pub fn models(cameras: &[CameraId]) -> BTreeMap<CameraId, CameraModel> {
        cameras.iter().map(|&c| (c, model())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::*;
    use super::*;
    use approx::assert_relative_eq;
    use robot_tracker_core::rotation_angle_between;

    #[test]
    fn recovers_each_camera_through_the_shared_target() {
        let cams = [CameraId(1), CameraId(0)];
        let calib = calibrate_extrinsics(
            &views(&cams, 3),
            &models(&cams),
            &CalibrationParams::default(),
            &CancelToken::new(),
        )
        .expect("extrinsics");
        assert_eq!(calib.reference, CameraId(1));
        for cam in cams {
            let got = &calib.cameras[&cam];
            let gt = robot_from_camera(cam);
            assert_eq!(got.views, 3);
            assert!(got.rms_px < 1e-3, "{cam}: {}", got.rms_px);
            assert_relative_eq!(
                got.robot_from_camera.translation.vector,
                gt.translation.vector,
                epsilon = 1e-5
            );
            assert!(rotation_angle_between(&got.robot_from_camera, &gt) < 1e-5);
        }
    }

    #[test]
    fn camera_without_model_is_unknown() {
        let views = views(&[CameraId(0), CameraId(2)], 1);
        let res = calibrate_extrinsics(
            &views,
            &models(&[CameraId(0)]),
            &CalibrationParams::default(),
            &CancelToken::new(),
        );
        assert_eq!(res, Err(CalibrationError::UnknownCamera(CameraId(2))));
    }

    #[test]
    fn wrong_reference_pose_fails_the_residual_check() {
        let cams = [CameraId(0)];
        let mut views = views(&cams, 2);
        // second capture claims the target moved 5 cm when it did not
        views[1].robot_from_target =
            nalgebra::Translation3::new(0.05, 0.0, 0.0) * views[1].robot_from_target;
        let res = calibrate_extrinsics(
            &views,
            &models(&cams),
            &CalibrationParams::default(),
            &CancelToken::new(),
        );
        assert!(matches!(
            res,
            Err(CalibrationError::ExtrinsicCalibrationFailed { camera: CameraId(0), .. })
        ));
    }

    #[test]
    fn empty_input_needs_views() {
        let res = calibrate_extrinsics(
            &[],
            &BTreeMap::new(),
            &CalibrationParams::default(),
            &CancelToken::new(),
        );
        assert!(matches!(res, Err(CalibrationError::NotEnoughViews { got: 0, .. })));
    }
}
