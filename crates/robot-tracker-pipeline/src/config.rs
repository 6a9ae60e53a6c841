//! Top-level configuration consumed by [`Pipeline::new`](crate::Pipeline::new).

use std::collections::BTreeSet;
use std::time::Duration;

use robot_tracker_calib::CalibrationParams;
use robot_tracker_core::{CameraId, CameraModel, WorkspaceRegion};
use robot_tracker_fiducial::{DetectorConfigError, DetectorParams};
use robot_tracker_track::{RoiParams, TrackConfigError, TrackParams};
use serde::{Deserialize, Serialize};

use crate::AcquisitionParams;

/// Structurally invalid configuration. The only fatal error class.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no camera entries configured")]
    NoCameras,
    #[error("camera {0} is listed more than once")]
    DuplicateCamera(CameraId),
    #[error("every configured camera is disabled")]
    NoEnabledCamera,
    #[error("camera {0} is enabled but no frame source was supplied")]
    MissingSource(CameraId),
    #[error("frame source for {0} has no enabled camera entry")]
    UnknownSource(CameraId),
    #[error("intrinsics override of {0} is not a valid camera model")]
    InvalidIntrinsics(CameraId),
    #[error("workspace region of {0} is empty or malformed")]
    InvalidWorkspace(CameraId),
    #[error("parameter `{name}` is out of range: {value}")]
    Invalid { name: &'static str, value: f64 },
    #[error("parameter `{name}` is not a representable duration: {value} s")]
    DurationOutOfRange { name: &'static str, value: f64 },
    #[error(transparent)]
    Detector(#[from] DetectorConfigError),
    #[error(transparent)]
    Track(#[from] TrackConfigError),
}

/// One physical camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraEntry {
    pub id: CameraId,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Used instead of the calibration set's model, and attached to frames
    /// that arrive without intrinsics.
    #[serde(default)]
    pub intrinsics_override: Option<CameraModel>,
    /// Part of the image where targets can appear. Searches are clipped to
    /// it and observations outside it are dropped.
    #[serde(default)]
    pub workspace: Option<WorkspaceRegion>,
}

fn enabled_default() -> bool {
    true
}

impl CameraEntry {
    pub fn new(id: CameraId) -> Self {
        Self {
            id,
            enabled: true,
            intrinsics_override: None,
            workspace: None,
        }
    }
}

/// Cycle scheduling and output policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub cycle_rate_hz: f64,
    /// Sleep to the next tick in [`Pipeline::run`](crate::Pipeline::run);
    /// replay runs usually disable it.
    pub pace: bool,
    /// Consecutive skipped cycles before the pipeline reports degraded health.
    pub degraded_after: u32,
    /// Robot-frame height of the plane image-frame tracks are lifted onto, m.
    pub working_plane_z: f64,
}

impl PipelineParams {
    /// Time between cycle ticks.
    pub fn cycle_period(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.cycle_rate_hz).unwrap_or(Duration::MAX)
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            cycle_rate_hz: 30.0,
            pace: true,
            degraded_after: 10,
            working_plane_z: 0.0,
        }
    }
}

/// Everything the core consumes. Loading and persisting it is up to the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub cameras: Vec<CameraEntry>,
    pub detector: DetectorParams,
    pub tracking: TrackParams,
    pub roi: RoiParams,
    pub calibration: CalibrationParams,
    pub acquisition: AcquisitionParams,
    pub pipeline: PipelineParams,
}

impl TrackerConfig {
    pub fn with_cameras(ids: impl IntoIterator<Item = CameraId>) -> Self {
        Self {
            cameras: ids.into_iter().map(CameraEntry::new).collect(),
            ..Self::default()
        }
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraEntry> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraEntry> + '_ {
        self.cameras.iter().filter(|c| c.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen = BTreeSet::new();
        for c in &self.cameras {
            if !seen.insert(c.id) {
                return Err(ConfigError::DuplicateCamera(c.id));
            }
            if let Some(model) = &c.intrinsics_override {
                if !model.intrinsics.is_valid() {
                    return Err(ConfigError::InvalidIntrinsics(c.id));
                }
            }
            if c.workspace.as_ref().is_some_and(|w| !w.is_valid()) {
                return Err(ConfigError::InvalidWorkspace(c.id));
            }
        }
        if self.enabled_cameras().next().is_none() {
            return Err(ConfigError::NoEnabledCamera);
        }

        self.detector.validate()?;
        self.tracking.validate()?;
        self.roi.validate()?;

        let positive = |name, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid { name, value })
            }
        };
        let seconds = |name, value: f64| match Duration::try_from_secs_f64(value) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::DurationOutOfRange { name, value }),
        };
        let rate = self.pipeline.cycle_rate_hz;
        positive("pipeline.cycle_rate_hz", rate)?;
        seconds("pipeline.cycle_rate_hz", 1.0 / rate)?;
        positive("acquisition.join_timeout_s", self.acquisition.join_timeout_s)?;
        seconds("acquisition.join_timeout_s", self.acquisition.join_timeout_s)?;
        positive(
            "calibration.max_reprojection_error_px",
            self.calibration.max_reprojection_error_px,
        )?;
        positive("calibration.max_age_s", self.calibration.max_age_s)?;
        seconds("calibration.max_age_s", self.calibration.max_age_s)?;
        let tolerance = self.acquisition.sync_tolerance_s;
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(ConfigError::Invalid {
                name: "acquisition.sync_tolerance_s",
                value: tolerance,
            });
        }
        seconds("acquisition.sync_tolerance_s", tolerance)?;
        if !self.pipeline.working_plane_z.is_finite() {
            return Err(ConfigError::Invalid {
                name: "pipeline.working_plane_z",
                value: self.pipeline.working_plane_z,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robot_tracker_core::CameraIntrinsics;

    #[test]
    fn camera_list_is_required_and_unique() {
        assert_eq!(TrackerConfig::default().validate(), Err(ConfigError::NoCameras));

        let dup = TrackerConfig::with_cameras([CameraId(0), CameraId(1), CameraId(0)]);
        assert_eq!(dup.validate(), Err(ConfigError::DuplicateCamera(CameraId(0))));

        let mut off = TrackerConfig::with_cameras([CameraId(0)]);
        off.cameras[0].enabled = false;
        assert_eq!(off.validate(), Err(ConfigError::NoEnabledCamera));

        TrackerConfig::with_cameras([CameraId(0), CameraId(1)])
            .validate()
            .expect("two cameras");
    }

    #[test]
    fn subsystem_errors_surface_through_config() {
        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.tracking.confirm_hits = 0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Track(TrackConfigError::ZeroConfirmHits))
        );

        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.pipeline.cycle_rate_hz = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { name: "pipeline.cycle_rate_hz", .. })
        ));

        let mut cfg = TrackerConfig::with_cameras([CameraId(2)]);
        cfg.cameras[0].intrinsics_override = Some(CameraModel::pinhole(CameraIntrinsics {
            fx: -1.0,
            fy: 500.0,
            cx: 0.0,
            cy: 0.0,
            skew: 0.0,
        }));
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidIntrinsics(CameraId(2))));
    }

    #[test]
    fn durations_that_do_not_fit_are_rejected_at_startup() {
        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.tracking.lost_timeout_s = 1e20;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Track(TrackConfigError::DurationOutOfRange { .. }))
        ));

        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.acquisition.join_timeout_s = 1e20;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange {
                name: "acquisition.join_timeout_s",
                value: 1e20
            })
        );

        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.pipeline.cycle_rate_hz = 1e-30;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange { name: "pipeline.cycle_rate_hz", .. })
        ));

        let mut cfg = TrackerConfig::with_cameras([CameraId(0)]);
        cfg.calibration.max_age_s = f64::MAX;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DurationOutOfRange { name: "calibration.max_age_s", .. })
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: TrackerConfig = serde_json::from_str(
            r#"{ "cameras": [{ "id": 3 }, { "id": 4, "enabled": false }],
                 "roi": { "miss_threshold": 5 } }"#,
        )
        .expect("parse");
        assert!(cfg.cameras[0].enabled);
        assert!(!cfg.cameras[1].enabled);
        assert_eq!(cfg.roi.miss_threshold, 5);
        assert_eq!(cfg.roi.full_frame_interval, RoiParams::default().full_frame_interval);
        assert_eq!(cfg.pipeline.degraded_after, 10);
        cfg.validate().expect("valid");
    }

    #[test]
    fn workspace_regions_are_parsed_and_checked() {
        let cfg: TrackerConfig = serde_json::from_str(
            r#"{ "cameras": [{ "id": 0, "workspace":
                 { "shape": "polygon", "vertices": [[0, 0], [100, 0], [50, 80]] } }] }"#,
        )
        .expect("parse");
        assert!(matches!(
            cfg.cameras[0].workspace,
            Some(WorkspaceRegion::Polygon { .. })
        ));
        cfg.validate().expect("valid");

        let mut bad = TrackerConfig::with_cameras([CameraId(0), CameraId(1)]);
        bad.cameras[1].workspace = Some(WorkspaceRegion::Circle {
            center: robot_tracker_core::Pt2::new(10.0, 10.0),
            radius: -1.0,
        });
        assert_eq!(bad.validate(), Err(ConfigError::InvalidWorkspace(CameraId(1))));
    }
}
