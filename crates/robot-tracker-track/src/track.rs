use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use robot_tracker_core::{CameraId, Modality, Observation, Pt2, Pt3, TargetId, Vec3};
use serde::{Deserialize, Serialize};

use crate::KalmanState;

/// Coordinate frame a track's state lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrackFrame {
    /// Pixel coordinates of one camera.
    Image(CameraId),
    /// Metric coordinates of the rig (the reference camera's frame).
    Rig,
}

impl TrackFrame {
    pub fn spatial_dims(self) -> usize {
        match self {
            TrackFrame::Image(_) => 2,
            TrackFrame::Rig => 3,
        }
    }
}

impl fmt::Display for TrackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackFrame::Image(cam) => write!(f, "image({cam})"),
            TrackFrame::Rig => f.write_str("rig"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackStatus {
    Tentative,
    Confirmed,
    Lost,
}

/// An observation expressed in a track frame, ready for association.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub frame: TrackFrame,
    /// Pixels (with `z = 0`) for image frames, metres for the rig frame.
    pub position: Vec3,
    pub orientation: Option<f64>,
    pub modality: Modality,
    pub target_hint: Option<TargetId>,
    pub confidence: f64,
    pub camera_id: CameraId,
    /// Pixel centroid in the source camera, used to refresh search windows.
    pub centroid: Pt2,
    pub timestamp: Duration,
}

impl Measurement {
    /// Image-frame measurement of the observation's own camera.
    pub fn image(obs: &Observation) -> Self {
        Self {
            frame: TrackFrame::Image(obs.camera_id),
            position: Vec3::new(obs.centroid.x, obs.centroid.y, 0.0),
            orientation: obs.orientation,
            modality: obs.modality,
            target_hint: obs.target_hint,
            confidence: obs.confidence,
            camera_id: obs.camera_id,
            centroid: obs.centroid,
            timestamp: obs.timestamp,
        }
    }

    /// Rig-frame measurement. `point` and `orientation` must already be
    /// expressed in the rig frame.
    pub fn rig(obs: &Observation, point: Pt3, orientation: Option<f64>) -> Self {
        Self {
            frame: TrackFrame::Rig,
            position: point.coords,
            orientation,
            ..Self::image(obs)
        }
    }
}

/// One tracked target.
#[derive(Clone, Debug)]
pub struct Track {
    pub(crate) id: TargetId,
    pub(crate) frame: TrackFrame,
    pub(crate) state: KalmanState,
    pub(crate) status: TrackStatus,
    pub(crate) hits: u32,
    pub(crate) ever_confirmed: bool,
    /// The id came from a detector hint and must match later hints.
    pub(crate) labelled: bool,
    pub(crate) created: Duration,
    pub(crate) last_update: Duration,
    pub(crate) last_predict: Duration,
    pub(crate) lost_since: Option<Duration>,
    pub(crate) cameras: BTreeSet<CameraId>,
}

impl Track {
    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn frame(&self) -> TrackFrame {
        self.frame
    }

    pub fn status(&self) -> TrackStatus {
        self.status
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == TrackStatus::Confirmed
    }

    pub fn state(&self) -> &KalmanState {
        &self.state
    }

    /// Consecutive associated cycles (reset by a miss while Tentative).
    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn is_labelled(&self) -> bool {
        self.labelled
    }

    pub fn created(&self) -> Duration {
        self.created
    }

    pub fn last_update(&self) -> Duration {
        self.last_update
    }

    pub fn lost_since(&self) -> Option<Duration> {
        self.lost_since
    }

    pub fn position(&self) -> Vec3 {
        self.state.position()
    }

    pub fn velocity(&self) -> Vec3 {
        self.state.velocity()
    }

    pub fn orientation(&self) -> f64 {
        self.state.orientation()
    }

    /// Root of the summed position variances, in track-frame units.
    pub fn position_sigma(&self) -> f64 {
        self.state.position_variance().max(0.0).sqrt()
    }

    /// Cameras that contributed at least one associated observation.
    pub fn cameras(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.cameras.iter().copied()
    }

    pub fn seen_by(&self, camera: CameraId) -> bool {
        match self.frame {
            TrackFrame::Image(c) => c == camera,
            TrackFrame::Rig => self.cameras.contains(&camera),
        }
    }
}
