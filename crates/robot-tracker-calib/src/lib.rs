//! Calibration engine: lens models, camera-to-robot transforms and the
//! coordinate lift from camera observations into the robot frame.
//!
//! Calibration is an on-demand operation. Solves run outside the pipeline
//! cycle and publish a complete [`CalibrationSet`] through
//! [`CalibrationStore`]; a failed or cancelled solve leaves the previously
//! accepted set active.
//!
//! ```no_run
//! use robot_tracker_calib::{CalibrationParams, CalibrationStore, CancelToken};
//! use robot_tracker_core::Pt3;
//!
//! let store = CalibrationStore::default();
//! let params = CalibrationParams::default();
//! let set = store.load();
//! if set.is_valid(params.max_reprojection_error_px) {
//!     let robot = set.lift_point(&Pt3::new(0.0, 0.0, 1.0));
//!     println!("{robot:?}");
//! }
//! # let _ = CancelToken::new();
//! ```

mod cancel;
mod error;
mod extrinsic;
mod intrinsic;
mod params;
mod refine;
mod set;
mod store;

pub use cancel::CancelToken;
pub use error::CalibrationError;
pub use extrinsic::{calibrate_extrinsics, CameraExtrinsic, ExtrinsicCalibration, ExtrinsicView};
pub use intrinsic::{
    calibrate_intrinsics, fit_distortion, zhang_intrinsics, IntrinsicCalibration, IntrinsicView,
};
pub use params::{CalibrationParams, DistortionFitOptions};
pub use set::{CalibrationHealth, CalibrationSet, CameraCalibration};
pub use store::CalibrationStore;
