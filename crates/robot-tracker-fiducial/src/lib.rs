//! Multi-modal fiducial detection.
//!
//! Three modalities share one observation contract:
//! - square ArUco-style markers decoded against a data-driven [`Dictionary`],
//! - retro-reflective blobs (bright, unsaturated, round),
//! - coloured LEDs matched against named HSV presets.
//!
//! [`FiducialDetector`] runs every enabled modality, restricted to the active
//! regions of interest (or the whole frame when none are given), and lifts
//! observations to 3D when the frame carries depth. An empty result is normal
//! under occlusion.
//!
//! ```no_run
//! use robot_tracker_fiducial::{DetectorParams, FiducialDetector};
//! # fn run(frame: &robot_tracker_core::Frame) -> Result<(), Box<dyn std::error::Error>> {
//! let mut detector = FiducialDetector::new(DetectorParams::default())?;
//! for obs in detector.detect_all(frame, &[]) {
//!     println!("{} at {:?}", obs.modality, obs.centroid);
//! }
//! # Ok(())
//! # }
//! ```

mod aruco;
mod components;
mod detector;
mod dictionary;
mod led;
mod matcher;
mod params;
mod reflective;
mod threshold;

pub use aruco::{ArucoDetector, MarkerDetection};
pub use detector::{DetectionStats, FiducialDetector, ModalityDetector};
pub use dictionary::Dictionary;
pub use led::LedDetector;
pub use matcher::{rotate_code_u64, Match, Matcher};
pub use params::{
    ArucoParams, DetectorConfigError, DetectorParams, LedParams, LedPreset, ReflectiveParams,
};
pub use reflective::ReflectiveDetector;

pub(crate) use detector::search_extent;
