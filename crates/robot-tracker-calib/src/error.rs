use robot_tracker_core::CameraId;

/// Why a calibration run produced no new [`CalibrationSet`](crate::CalibrationSet).
///
/// Every variant is recoverable: the previously accepted set stays active.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error(
        "intrinsic calibration of {camera} failed: rms {rms_px:.3} px, limit {threshold_px:.3} px"
    )]
    IntrinsicCalibrationFailed {
        camera: CameraId,
        rms_px: f64,
        threshold_px: f64,
    },
    #[error(
        "extrinsic calibration of {camera} failed: rms {rms_px:.3} px, limit {threshold_px:.3} px"
    )]
    ExtrinsicCalibrationFailed {
        camera: CameraId,
        rms_px: f64,
        threshold_px: f64,
    },
    #[error("need at least {required} views, got {got}")]
    NotEnoughViews { required: usize, got: usize },
    #[error("degenerate calibration input: {0}")]
    Degenerate(&'static str),
    #[error("camera {0} has no intrinsic calibration")]
    UnknownCamera(CameraId),
    #[error("calibration cancelled")]
    Cancelled,
}
