use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which Brown-Conrady coefficients the linear distortion fit estimates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistortionFitOptions {
    /// Keep `k3 = 0`; the sixth-order term is poorly constrained by a few views.
    pub fix_k3: bool,
    /// Keep `p1 = p2 = 0`.
    pub fix_tangential: bool,
}

impl Default for DistortionFitOptions {
    fn default() -> Self {
        Self {
            fix_k3: true,
            fix_tangential: false,
        }
    }
}

/// Calibration solve and acceptance configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    /// Solves and sets are accepted only strictly below this RMS
    /// reprojection error.
    pub max_reprojection_error_px: f64,
    /// Minimum pattern views for an intrinsic solve.
    pub min_intrinsic_views: usize,
    /// Minimum reference-target views per camera for an extrinsic solve.
    pub min_extrinsic_views: usize,
    /// Distortion / intrinsics alternations after the initial closed form.
    pub refine_iterations: usize,
    pub distortion: DistortionFitOptions,
    pub zero_skew: bool,
    /// Older sets are reported as stale.
    pub max_age_s: f64,
    /// Sets with a residual above this are reported as stale.
    pub stale_residual_px: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            max_reprojection_error_px: 1.0,
            min_intrinsic_views: 3,
            min_extrinsic_views: 1,
            refine_iterations: 3,
            distortion: DistortionFitOptions::default(),
            zero_skew: true,
            max_age_s: 7.0 * 24.0 * 3600.0,
            stale_residual_px: 0.75,
        }
    }
}

impl CalibrationParams {
    pub fn max_age(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_age_s.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Same rule as [`CalibrationSet::is_valid`](crate::CalibrationSet::is_valid);
    /// NaN is never accepted.
    pub fn accepts_rms(&self, rms_px: f64) -> bool {
        rms_px < self.max_reprojection_error_px
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let p: CalibrationParams = serde_json::from_str(
            r#"{"max_reprojection_error_px":0.5,"distortion":{"fix_k3":false}}"#,
        )
        .expect("json");
        assert_eq!(p.max_reprojection_error_px, 0.5);
        assert!(!p.distortion.fix_k3);
        assert!(!p.distortion.fix_tangential);
        assert_eq!(p.min_intrinsic_views, 3);
    }

    #[test]
    fn rms_at_the_threshold_is_rejected() {
        let p = CalibrationParams::default();
        assert!(p.accepts_rms(0.999));
        assert!(!p.accepts_rms(p.max_reprojection_error_px));
        assert!(!p.accepts_rms(f64::NAN));
    }
}
