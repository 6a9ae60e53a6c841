//! Core types and utilities for multi-camera pose tracking.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! depend on any camera driver, detector or filter implementation. It provides:
//! - identifiers (`CameraId`, `TargetId`) and the timestamped [`Frame`] contract,
//! - lightweight image containers (color, grayscale, depth) and [`PixelRect`],
//! - the per-detection [`Observation`] record shared by detector and tracker,
//! - the pinhole + Brown-Conrady [`CameraModel`],
//! - homography estimation (4-point and normalized DLT) and planar pose recovery,
//! - static [`WorkspaceRegion`]s bounding where targets are searched,
//! - a minimal logger.

mod camera;
mod frame;
mod homography;
mod image;
mod logger;
mod observation;
mod pose;
mod region;
pub mod synthetic;

pub use camera::{BrownConrady5, CameraIntrinsics, CameraModel};
pub use frame::{CameraId, Frame};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{
    rgb_to_hsv, sample_bilinear, ColorImage, DepthMap, GrayImage, GrayImageView, ImageBufferError,
    PixelRect,
};
pub use observation::{Modality, Observation, TargetId};
pub use pose::{average_isometries, planar_pose_from_homography, rotation_angle_between};
pub use region::WorkspaceRegion;

#[cfg(feature = "tracing")]
pub use logger::init_tracing;
pub use logger::init_with_level;

/// Scalar type used for all geometry.
pub type Real = f64;
/// 2D point in pixels or normalized coordinates.
pub type Pt2 = nalgebra::Point2<Real>;
/// 3D point in metres.
pub type Pt3 = nalgebra::Point3<Real>;
pub type Vec2 = nalgebra::Vector2<Real>;
pub type Vec3 = nalgebra::Vector3<Real>;
pub type Mat3 = nalgebra::Matrix3<Real>;
/// Rigid transform. `Iso3` named `a_from_b` maps points expressed in `b` into `a`.
pub type Iso3 = nalgebra::Isometry3<Real>;
