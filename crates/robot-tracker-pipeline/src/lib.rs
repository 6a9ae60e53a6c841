//! Multi-camera acquisition and the per-tick tracking cycle.
//!
//! [`Pipeline::run_cycle`] drives one fixed cycle:
//! 1. request a frame from every camera's [`FrameSource`] worker and join
//!    with a bounded wait ([`MultiCameraAcquirer`]);
//! 2. keep the frames that agree in time ([`align_frames`]);
//! 3. detect fiducials per camera, restricted to that camera's search windows;
//! 4. feed every observation of the cycle into one
//!    [`TrackFilter::step`](robot_tracker_track::TrackFilter::step);
//! 5. lift each Confirmed track into the robot frame through the active
//!    calibration and publish a [`PoseUpdate`] to the [`PoseSink`].
//!
//! Nothing in the cycle is fatal. A cycle without usable frames is skipped
//! and counted by the [`HealthMonitor`]; only a structurally invalid
//! [`TrackerConfig`] stops [`Pipeline::new`].
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use robot_tracker_calib::CalibrationStore;
//! use robot_tracker_core::CameraId;
//! use robot_tracker_pipeline::{FrameSource, Pipeline, ReplaySource, TrackerConfig, VecSink};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackerConfig::with_cameras([CameraId(0)]);
//! let sources: Vec<Box<dyn FrameSource>> = vec![Box::new(ReplaySource::new(CameraId(0)))];
//! let mut pipeline = Pipeline::new(config, sources, CalibrationStore::default(), VecSink::new())?;
//! let summary = pipeline.run(&AtomicBool::new(false));
//! println!("{} cycles, {} poses", summary.cycles, summary.poses);
//! # Ok(())
//! # }
//! ```

mod acquisition;
mod config;
mod health;
mod pipeline;
mod sink;

pub use acquisition::{
    align_frames, Acquisition, AcquisitionError, AcquisitionParams, FrameSource,
    MultiCameraAcquirer, ReplaySource,
};
pub use config::{CameraEntry, ConfigError, PipelineParams, TrackerConfig};
pub use health::{HealthMonitor, HealthStatus};
pub use pipeline::{CycleReport, Pipeline, PipelineError, RunSummary};
pub use sink::{ChannelSink, PoseSink, PoseUpdate, SinkClosed, VecSink};
