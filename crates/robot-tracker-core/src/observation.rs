use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CameraId, Pt2, Pt3};

/// Stable target identifier. For ArUco targets this is the marker id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Detection modality that produced an observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    ArucoMarker,
    ReflectiveBlob,
    Led,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::ArucoMarker, Modality::ReflectiveBlob, Modality::Led];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::ArucoMarker => "aruco",
            Modality::ReflectiveBlob => "reflective",
            Modality::Led => "led",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fiducial detection in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Identity carried by the fiducial itself (decoded marker id, LED preset).
    pub target_hint: Option<TargetId>,
    pub modality: Modality,
    /// Centroid in pixels.
    pub centroid: Pt2,
    /// 3D point in the source camera frame, metres.
    pub point_3d: Option<Pt3>,
    /// In-plane rotation in radians, when the fiducial has one.
    pub orientation: Option<f64>,
    /// Ordered marker corners in pixels (ArUco only).
    pub corners: Option<[Pt2; 4]>,
    /// Characteristic size in pixels (square root of the blob or marker area).
    pub size_px: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub camera_id: CameraId,
    pub timestamp: Duration,
}

impl Observation {
    pub fn new(
        modality: Modality,
        centroid: Pt2,
        confidence: f64,
        camera_id: CameraId,
        timestamp: Duration,
    ) -> Self {
        Self {
            target_hint: None,
            modality,
            centroid,
            point_3d: None,
            orientation: None,
            corners: None,
            size_px: 0.0,
            confidence: confidence.clamp(0.0, 1.0),
            camera_id,
            timestamp,
        }
    }

    pub fn with_target_hint(mut self, id: TargetId) -> Self {
        self.target_hint = Some(id);
        self
    }

    pub fn with_point_3d(mut self, p: Pt3) -> Self {
        self.point_3d = Some(p);
        self
    }

    pub fn with_orientation(mut self, theta: f64) -> Self {
        self.orientation = Some(theta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let o = Observation::new(
            Modality::Led,
            Pt2::new(1.0, 2.0),
            1.7,
            CameraId(0),
            Duration::ZERO,
        );
        assert_eq!(o.confidence, 1.0);
    }

    #[test]
    fn modality_serializes_snake_case() {
        let s = serde_json::to_string(&Modality::ReflectiveBlob).expect("json");
        assert_eq!(s, "\"reflective_blob\"");
        assert_eq!(Modality::ArucoMarker.to_string(), "aruco");
    }
}
