//! Region-of-interest management and Kalman track filtering.
//!
//! - [`RoiManager`] keeps one search window per `(target, camera)` pair,
//!   re-centred on every match with a speed-dependent margin and dropped after
//!   repeated misses.
//! - [`TrackFilter`] owns every [`Track`], keyed by [`TargetId`]. One
//!   [`TrackFilter::step`] per pipeline cycle predicts all tracks to the cycle
//!   time, associates the cycle's [`Measurement`]s and fuses them.
//!
//! Tracks and windows only refer to each other through target ids.
//!
//! [`TargetId`]: robot_tracker_core::TargetId

mod filter;
mod kalman;
mod params;
mod roi;
mod track;

pub use filter::{Association, StepReport, TrackFilter};
pub use kalman::{wrap_angle, KalmanState, StateCovariance, StateVector};
pub use params::{
    KalmanParams, MeasurementNoise, MotionNoise, RoiParams, TrackConfigError, TrackParams,
};
pub use roi::{Roi, RoiManager};
pub use track::{Measurement, Track, TrackFrame, TrackStatus};
