//! Planar-pattern intrinsic calibration.
//!
//! 1. One homography per view, board plane to pixels.
//! 2. Zhang's closed form for `K` from the homographies.
//! 3. Alternating linear fits: distortion from the residuals of the current
//!    homographies, then `K` again from homographies of undistorted pixels.
//! 4. Joint Levenberg-Marquardt refinement of intrinsics, distortion and board
//!    poses on pixel reprojection error.

use nalgebra::{DMatrix, DVector, SVector, Translation3, UnitQuaternion};
use robot_tracker_core::{
    estimate_homography, planar_pose_from_homography, BrownConrady5, CameraId, CameraIntrinsics,
    CameraModel, Iso3, Mat3, Pt2, Pt3, Vec3,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::refine::{levenberg_marquardt, LmOptions};
use crate::{CalibrationError, CalibrationParams, CancelToken, DistortionFitOptions};

/// One view of a planar pattern: board coordinates (metres, `z = 0`) and the
/// matching detected pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicView {
    pub board_points: Vec<Pt2>,
    pub pixel_points: Vec<Pt2>,
}

impl IntrinsicView {
    pub fn new(board_points: Vec<Pt2>, pixel_points: Vec<Pt2>) -> Self {
        Self {
            board_points,
            pixel_points,
        }
    }

    pub fn len(&self) -> usize {
        self.board_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.board_points.is_empty()
    }
}

/// Accepted intrinsic solve for one camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    pub camera: CameraId,
    pub model: CameraModel,
    /// RMS pixel reprojection error over all views.
    pub rms_px: f64,
    pub view_rms_px: Vec<f64>,
    /// `camera_from_board` per view.
    pub board_poses: Vec<Iso3>,
}

pub(crate) fn check_correspondences(
    board: &[Pt2],
    pixels: &[Pt2],
) -> Result<(), CalibrationError> {
    if board.len() != pixels.len() {
        return Err(CalibrationError::Degenerate(
            "board and pixel point counts differ",
        ));
    }
    if board.len() < 4 {
        return Err(CalibrationError::Degenerate(
            "a view needs at least 4 correspondences",
        ));
    }
    Ok(())
}

fn v_ij(h: &Mat3, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Zhang's closed-form camera matrix from `>= 3` plane-to-image homographies.
pub fn zhang_intrinsics(homographies: &[Mat3]) -> Result<CameraIntrinsics, CalibrationError> {
    if homographies.len() < 3 {
        return Err(CalibrationError::NotEnoughViews {
            required: 3,
            got: homographies.len(),
        });
    }

    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        v.row_mut(2 * k).copy_from(&v12.transpose());
        v.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    // b is the right singular vector of the smallest singular value
    let svd = v.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or(CalibrationError::Degenerate("svd of the Zhang system failed"))?;
    let (min_idx, _) = svd.singular_values.argmin();
    let b = v_t.row(min_idx);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    let denom_norm = b11 * b11 + b22 * b22;
    if denom_norm <= 0.0 || denom.abs() / denom_norm <= 1e-12 {
        return Err(CalibrationError::Degenerate("homographies do not constrain K"));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda.signum() != b11.signum() {
        return Err(CalibrationError::Degenerate("inconsistent scale in Zhang solve"));
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let k = CameraIntrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
        skew: gamma,
    };
    if !k.is_valid() {
        return Err(CalibrationError::Degenerate("non-finite intrinsics"));
    }
    Ok(k)
}

/// Linear least-squares Brown-Conrady fit from homography residuals.
///
/// `homographies[i]` maps board points of view `i` to *undistorted* pixels for
/// the current `k`; the residual between observed and ideal normalized
/// coordinates is regressed on the distortion basis.
pub fn fit_distortion(
    k: &CameraIntrinsics,
    views: &[IntrinsicView],
    homographies: &[Mat3],
    opts: DistortionFitOptions,
) -> Result<BrownConrady5, CalibrationError> {
    let n_params = 2 + usize::from(!opts.fix_k3) + if opts.fix_tangential { 0 } else { 2 };
    let n_points: usize = views.iter().map(IntrinsicView::len).sum();
    if 2 * n_points < n_params {
        return Err(CalibrationError::Degenerate("too few points for a distortion fit"));
    }

    let mut a = DMatrix::<f64>::zeros(2 * n_points, n_params);
    let mut rhs = DVector::<f64>::zeros(2 * n_points);
    let mut max_r2: f64 = 0.0;
    let mut row = 0;
    for (view, h) in views.iter().zip(homographies) {
        for (b, px) in view.board_points.iter().zip(&view.pixel_points) {
            let ideal = h * Vec3::new(b.x, b.y, 1.0);
            let ideal = Pt2::new(ideal.x / ideal.z, ideal.y / ideal.z);
            let n = k.pixel_to_normalized(ideal);
            let obs = k.pixel_to_normalized(*px);
            let (x, y) = (n.x, n.y);
            let r2 = x * x + y * y;
            max_r2 = max_r2.max(r2);

            let mut col = 0;
            for power in [r2, r2 * r2] {
                a[(row, col)] = x * power;
                a[(row + 1, col)] = y * power;
                col += 1;
            }
            if !opts.fix_k3 {
                a[(row, col)] = x * r2 * r2 * r2;
                a[(row + 1, col)] = y * r2 * r2 * r2;
                col += 1;
            }
            if !opts.fix_tangential {
                a[(row, col)] = 2.0 * x * y;
                a[(row + 1, col)] = r2 + 2.0 * y * y;
                a[(row, col + 1)] = r2 + 2.0 * x * x;
                a[(row + 1, col + 1)] = 2.0 * x * y;
            }
            rhs[row] = obs.x - n.x;
            rhs[row + 1] = obs.y - n.y;
            row += 2;
        }
    }
    if max_r2 < 1e-6 {
        return Err(CalibrationError::Degenerate(
            "points too close to the principal point for a distortion fit",
        ));
    }

    let coeffs = a
        .svd(true, true)
        .solve(&rhs, 1e-10)
        .map_err(|_| CalibrationError::Degenerate("distortion least squares failed"))?;

    let mut it = coeffs.iter().copied();
    let mut next = || it.next().unwrap_or(0.0);
    let k1 = next();
    let k2 = next();
    let k3 = if opts.fix_k3 { 0.0 } else { next() };
    let (p1, p2) = if opts.fix_tangential {
        (0.0, 0.0)
    } else {
        (next(), next())
    };
    Ok(BrownConrady5 { k1, k2, k3, p1, p2 })
}

fn view_homographies(
    views: &[IntrinsicView],
    pixels: impl Fn(&IntrinsicView) -> Vec<Pt2>,
) -> Result<Vec<Mat3>, CalibrationError> {
    views
        .iter()
        .map(|v| {
            estimate_homography(&v.board_points, &pixels(v))
                .map(|h| h.h)
                .ok_or(CalibrationError::Degenerate("board homography estimation failed"))
        })
        .collect()
}

fn undistorted_pixels(model: &CameraModel, view: &IntrinsicView) -> Vec<Pt2> {
    view.pixel_points
        .iter()
        .map(|p| {
            model
                .intrinsics
                .normalized_to_pixel(model.undistort_pixel(*p))
        })
        .collect()
}

pub(crate) fn pose_to_vec(pose: &Iso3) -> [f64; 6] {
    let r = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    [r.x, r.y, r.z, t.x, t.y, t.z]
}

pub(crate) fn pose_from_slice(v: &[f64]) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(v[3], v[4], v[5]),
        UnitQuaternion::from_scaled_axis(Vec3::new(v[0], v[1], v[2])),
    )
}

/// Pixel residuals of one view; points behind the camera get a large residual.
pub(crate) fn push_view_residuals(
    out: &mut Vec<f64>,
    model: &CameraModel,
    camera_from_board: &Iso3,
    board: &[Pt2],
    pixels: &[Pt2],
) {
    const BEHIND: f64 = 1e3;
    for (b, px) in board.iter().zip(pixels) {
        let pc = camera_from_board * Pt3::new(b.x, b.y, 0.0);
        match model.project(&pc) {
            Some(p) => {
                out.push(p.x - px.x);
                out.push(p.y - px.y);
            }
            None => {
                out.push(BEHIND);
                out.push(BEHIND);
            }
        }
    }
}

pub(crate) fn rms(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    // two residuals per point
    (residuals.iter().map(|r| r * r).sum::<f64>() / (residuals.len() / 2).max(1) as f64).sqrt()
}

const INTRINSIC_PARAMS: usize = 9;

fn pack(model: &CameraModel, poses: &[Iso3]) -> DVector<f64> {
    let k = &model.intrinsics;
    let d = &model.distortion;
    let mut x = vec![k.fx, k.fy, k.cx, k.cy, d.k1, d.k2, d.k3, d.p1, d.p2];
    for p in poses {
        x.extend_from_slice(&pose_to_vec(p));
    }
    DVector::from_vec(x)
}

fn unpack_model(x: &DVector<f64>, skew: f64) -> CameraModel {
    CameraModel::new(
        CameraIntrinsics {
            fx: x[0],
            fy: x[1],
            cx: x[2],
            cy: x[3],
            skew,
        },
        BrownConrady5 {
            k1: x[4],
            k2: x[5],
            k3: x[6],
            p1: x[7],
            p2: x[8],
        },
    )
}

fn unpack_pose(x: &DVector<f64>, view: usize) -> Iso3 {
    let start = INTRINSIC_PARAMS + 6 * view;
    pose_from_slice(&x.as_slice()[start..start + 6])
}

/// Estimate the lens model of `camera` from views of a planar pattern.
///
/// Fails with [`CalibrationError::IntrinsicCalibrationFailed`] when the final
/// RMS reprojection error is not below `params.max_reprojection_error_px`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(camera = %camera, views = views.len()))
)]
pub fn calibrate_intrinsics(
    camera: CameraId,
    views: &[IntrinsicView],
    params: &CalibrationParams,
    cancel: &CancelToken,
) -> Result<IntrinsicCalibration, CalibrationError> {
    let required = params.min_intrinsic_views.max(3);
    if views.len() < required {
        return Err(CalibrationError::NotEnoughViews {
            required,
            got: views.len(),
        });
    }
    for v in views {
        check_correspondences(&v.board_points, &v.pixel_points)?;
    }

    let fix_skew = |mut k: CameraIntrinsics| {
        if params.zero_skew {
            k.skew = 0.0;
        }
        k
    };

    cancel.check()?;
    let mut homographies = view_homographies(views, |v| v.pixel_points.clone())?;
    let mut k = fix_skew(zhang_intrinsics(&homographies)?);
    let mut distortion = BrownConrady5::default();
    log::debug!(
        "{camera}: closed-form fx={:.1} fy={:.1} cx={:.1} cy={:.1}",
        k.fx,
        k.fy,
        k.cx,
        k.cy
    );

    for iter in 0..params.refine_iterations {
        cancel.check()?;
        distortion = fit_distortion(&k, views, &homographies, params.distortion)?;
        let model = CameraModel::new(k, distortion);
        homographies = view_homographies(views, |v| undistorted_pixels(&model, v))?;
        match zhang_intrinsics(&homographies) {
            Ok(next) => k = fix_skew(next),
            Err(e) => {
                log::warn!("{camera}: stopping linear refinement at iteration {iter}: {e}");
                break;
            }
        }
    }

    let model = CameraModel::new(k, distortion);
    let mut poses = Vec::with_capacity(views.len());
    for v in views {
        cancel.check()?;
        let h = estimate_homography(&v.board_points, &undistorted_pixels(&model, v))
            .ok_or(CalibrationError::Degenerate("board homography estimation failed"))?;
        let pose = planar_pose_from_homography(&k.k_matrix(), &h.h)
            .ok_or(CalibrationError::Degenerate("board pose recovery failed"))?;
        poses.push(pose);
    }

    let skew = k.skew;
    let residuals = |x: &DVector<f64>| {
        let model = unpack_model(x, skew);
        let mut out = Vec::new();
        for (i, v) in views.iter().enumerate() {
            let pose = unpack_pose(x, i);
            push_view_residuals(&mut out, &model, &pose, &v.board_points, &v.pixel_points);
        }
        DVector::from_vec(out)
    };
    let mut free = vec![true; INTRINSIC_PARAMS + 6 * views.len()];
    free[6] = !params.distortion.fix_k3;
    free[7] = !params.distortion.fix_tangential;
    free[8] = !params.distortion.fix_tangential;

    let (x, report) = levenberg_marquardt(
        residuals,
        pack(&model, &poses),
        &free,
        LmOptions::default(),
        cancel,
    )?;
    log::debug!(
        "{camera}: refinement {} evaluations, cost {:.3e} -> {:.3e}",
        report.evaluations,
        report.initial_cost,
        report.final_cost
    );

    let model = unpack_model(&x, skew);
    if !model.intrinsics.is_valid() {
        return Err(CalibrationError::Degenerate("refinement diverged"));
    }
    let board_poses: Vec<Iso3> = (0..views.len()).map(|i| unpack_pose(&x, i)).collect();

    let mut all = Vec::new();
    let mut view_rms_px = Vec::with_capacity(views.len());
    for (v, pose) in views.iter().zip(&board_poses) {
        let mut r = Vec::new();
        push_view_residuals(&mut r, &model, pose, &v.board_points, &v.pixel_points);
        view_rms_px.push(rms(&r));
        all.extend(r);
    }
    let rms_px = rms(&all);

    if !params.accepts_rms(rms_px) {
        log::warn!(
            "{camera}: intrinsic rms {rms_px:.3} px is not below {:.3} px",
            params.max_reprojection_error_px
        );
        return Err(CalibrationError::IntrinsicCalibrationFailed {
            camera,
            rms_px,
            threshold_px: params.max_reprojection_error_px,
        });
    }
    log::info!(
        "{camera}: intrinsics fx={:.2} fy={:.2} cx={:.2} cy={:.2}, rms {rms_px:.3} px",
        model.intrinsics.fx,
        model.intrinsics.fy,
        model.intrinsics.cx,
        model.intrinsics.cy
    );

    Ok(IntrinsicCalibration {
        camera,
        model,
        rms_px,
        view_rms_px,
        board_poses,
    })
}
