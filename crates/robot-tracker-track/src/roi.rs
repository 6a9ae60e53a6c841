//! Per-target, per-camera search windows.

use std::collections::BTreeMap;
use std::time::Duration;

use robot_tracker_core::{CameraId, PixelRect, Pt2, TargetId};

use crate::{RoiParams, TrackConfigError};

/// Search window of one target on one camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Roi {
    pub target_id: TargetId,
    pub camera_id: CameraId,
    /// Always inside the camera's frame.
    pub region: PixelRect,
    pub expiry: Duration,
    pub misses: u32,
}

/// Windows keyed by `(target, camera)`; no references into tracks.
#[derive(Clone, Debug)]
pub struct RoiManager {
    params: RoiParams,
    rois: BTreeMap<(TargetId, CameraId), Roi>,
    frame_sizes: BTreeMap<CameraId, (usize, usize)>,
}

impl RoiManager {
    pub fn new(params: RoiParams) -> Result<Self, TrackConfigError> {
        params.validate()?;
        Ok(Self {
            params,
            rois: BTreeMap::new(),
            frame_sizes: BTreeMap::new(),
        })
    }

    pub fn params(&self) -> &RoiParams {
        &self.params
    }

    /// Frame size used to clip windows of `camera`. Changing it drops the
    /// camera's windows.
    pub fn set_frame_size(&mut self, camera: CameraId, width: usize, height: usize) {
        if self.frame_sizes.insert(camera, (width, height)) != Some((width, height)) {
            self.clear_camera(camera);
        }
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn get(&self, target: TargetId, camera: CameraId) -> Option<&Roi> {
        self.rois.get(&(target, camera))
    }

    pub fn rois_for(&self, camera: CameraId) -> impl Iterator<Item = &Roi> + '_ {
        self.rois.values().filter(move |r| r.camera_id == camera)
    }

    pub fn regions_for(&self, camera: CameraId) -> Vec<PixelRect> {
        self.rois_for(camera).map(|r| r.region).collect()
    }

    /// Record the outcome for one target on one camera.
    ///
    /// A match re-centres the window on `new_center` with a half-size that
    /// grows with `speed_px_per_s`. A miss increments the miss counter and
    /// drops the window at the configured threshold, so the detector falls
    /// back to a full-frame search for that target.
    pub fn update(
        &mut self,
        target: TargetId,
        camera: CameraId,
        new_center: Pt2,
        matched: bool,
        speed_px_per_s: f64,
        now: Duration,
    ) {
        let key = (target, camera);
        if !matched {
            let threshold = self.params.miss_threshold;
            if let Some(roi) = self.rois.get_mut(&key) {
                roi.misses += 1;
                if roi.misses >= threshold {
                    log::debug!("roi {target}@{camera} dropped after {threshold} misses");
                    self.rois.remove(&key);
                }
            }
            return;
        }

        let Some(&(w, h)) = self.frame_sizes.get(&camera) else {
            log::debug!("roi {target}@{camera}: frame size unknown");
            return;
        };
        let half = self.params.half_size(speed_px_per_s);
        match PixelRect::around(new_center, half, w, h) {
            Some(region) => {
                self.rois.insert(
                    key,
                    Roi {
                        target_id: target,
                        camera_id: camera,
                        region,
                        expiry: now.saturating_add(self.params.ttl()),
                        misses: 0,
                    },
                );
            }
            None => {
                self.rois.remove(&key);
            }
        }
    }

    /// Drop windows whose expiry is before `now`. Returns how many were dropped.
    pub fn expire(&mut self, now: Duration) -> usize {
        let before = self.rois.len();
        self.rois.retain(|_, r| r.expiry >= now);
        before - self.rois.len()
    }

    pub fn remove_target(&mut self, target: TargetId) {
        self.rois.retain(|&(t, _), _| t != target);
    }

    pub fn clear_camera(&mut self, camera: CameraId) {
        self.rois.retain(|&(_, c), _| c != camera);
    }

    pub fn clear(&mut self) {
        self.rois.clear();
    }
}
