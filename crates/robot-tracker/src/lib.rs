//! High-level facade crate for the `robot-tracker-*` workspace.
//!
//! This crate provides:
//! - stable, convenient re-exports of the subsystem crates
//! - (feature `image`) [`replay::ImageSequenceSource`], a frame source that
//!   plays a directory of PNG/JPEG images as one camera
//! - (feature `cli`) the `robot-tracker` binary with `check-config`,
//!   `calibrate-intrinsics`, `calibrate-extrinsics` and `replay` commands.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use robot_tracker::calib::CalibrationStore;
//! use robot_tracker::core::CameraId;
//! use robot_tracker::pipeline::{FrameSource, Pipeline, TrackerConfig, VecSink};
//! use robot_tracker::replay::ImageSequenceSource;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let camera = CameraId(0);
//! let source = ImageSequenceSource::from_dir(camera, "frames/cam0".as_ref(), 30.0)?;
//! let sources: Vec<Box<dyn FrameSource>> = vec![Box::new(source)];
//!
//! let mut config = TrackerConfig::with_cameras([camera]);
//! config.pipeline.pace = false;
//! let mut pipeline = Pipeline::new(config, sources, CalibrationStore::default(), VecSink::new())?;
//! let summary = pipeline.run(&AtomicBool::new(false));
//! println!("{} cycles, {} poses", summary.cycles, summary.poses);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `robot_tracker::core`: frames, observations, images, camera model, homographies.
//! - `robot_tracker::fiducial`: ArUco, reflective and LED detection.
//! - `robot_tracker::track`: search windows and the Kalman track filter.
//! - `robot_tracker::calib`: intrinsic/extrinsic calibration and the calibration store.
//! - `robot_tracker::pipeline`: acquisition, the tracking cycle and pose output.
//! - `robot_tracker::replay` (feature `image`): image-sequence frame source.

pub use robot_tracker_calib as calib;
pub use robot_tracker_core as core;
pub use robot_tracker_fiducial as fiducial;
pub use robot_tracker_pipeline as pipeline;
pub use robot_tracker_track as track;

pub use robot_tracker_calib::{CalibrationSet, CalibrationStore};
pub use robot_tracker_core::{CameraId, Frame, Modality, Observation, TargetId};
pub use robot_tracker_fiducial::{DetectorParams, FiducialDetector};
pub use robot_tracker_pipeline::{Pipeline, PoseSink, PoseUpdate, TrackerConfig};
pub use robot_tracker_track::{TrackFilter, TrackStatus};

#[cfg(feature = "image")]
pub mod replay;
