use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nalgebra::UnitQuaternion;
use robot_tracker_calib::{CalibrationHealth, CalibrationSet, CalibrationStore};
use robot_tracker_core::{
    CameraId, Frame, Observation, PixelRect, Pt2, Pt3, TargetId, WorkspaceRegion,
};
use robot_tracker_fiducial::{DetectionStats, FiducialDetector};
use robot_tracker_track::{Measurement, RoiManager, StepReport, Track, TrackFilter, TrackFrame};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    align_frames, AcquisitionError, ConfigError, FrameSource, HealthMonitor, HealthStatus,
    MultiCameraAcquirer, PoseSink, PoseUpdate, TrackerConfig,
};

/// Horizon used to turn a rig-frame velocity into a pixel speed for ROI sizing.
const ROI_SPEED_HORIZON_S: f64 = 0.05;

/// Startup failure of [`Pipeline::new`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

/// Outcome of one [`Pipeline::run_cycle`].
#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Newest aligned frame timestamp; `None` for a skipped cycle.
    pub timestamp: Option<Duration>,
    pub skipped: bool,
    /// Every requested camera reported end of stream.
    pub exhausted: bool,
    /// Cameras whose frames were processed.
    pub cameras: Vec<CameraId>,
    /// Cameras searched over the whole frame.
    pub full_frame: Vec<CameraId>,
    pub acquisition_errors: Vec<AcquisitionError>,
    pub observations: usize,
    pub step: StepReport,
    pub poses: usize,
    pub calibration: Option<CalibrationHealth>,
    pub health: HealthStatus,
}

/// Totals of a [`Pipeline::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: u64,
    pub skipped: u64,
    pub observations: u64,
    pub poses: u64,
    pub health: HealthStatus,
}

/// The per-tick acquire, detect, associate, filter, lift and emit cycle.
///
/// Track and ROI state are owned here and mutated only by
/// [`run_cycle`](Self::run_cycle). Cycles never overlap: the calibration set is
/// read once per cycle from the shared [`CalibrationStore`], so a concurrent
/// calibration swap only affects the next cycle.
pub struct Pipeline<S: PoseSink> {
    config: TrackerConfig,
    acquirer: MultiCameraAcquirer,
    detector: FiducialDetector,
    filter: TrackFilter,
    rois: RoiManager,
    store: CalibrationStore,
    sink: S,
    health: HealthMonitor,
    cycle: u64,
    calibration_health: Option<CalibrationHealth>,
    sink_closed: bool,
}

impl<S: PoseSink> Pipeline<S> {
    /// Validate `config`, match `sources` to enabled cameras and start one
    /// capture worker per camera.
    ///
    /// Sources of disabled cameras are dropped. An enabled camera without a
    /// source, or a source without a camera entry, is a configuration error.
    pub fn new(
        config: TrackerConfig,
        sources: Vec<Box<dyn FrameSource>>,
        store: CalibrationStore,
        sink: S,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let mut provided = BTreeSet::new();
        let mut active = Vec::with_capacity(sources.len());
        for source in sources {
            let id = source.camera_id();
            match config.camera(id) {
                None => return Err(ConfigError::UnknownSource(id).into()),
                Some(entry) if !entry.enabled => {
                    log::info!("{id}: disabled, frame source ignored");
                }
                Some(_) => {
                    if !provided.insert(id) {
                        return Err(ConfigError::DuplicateCamera(id).into());
                    }
                    active.push(source);
                }
            }
        }
        if let Some(missing) = config
            .enabled_cameras()
            .map(|c| c.id)
            .find(|id| !provided.contains(id))
        {
            return Err(ConfigError::MissingSource(missing).into());
        }

        let detector = FiducialDetector::new(config.detector.clone()).map_err(ConfigError::from)?;
        let filter = TrackFilter::new(config.tracking.clone()).map_err(ConfigError::from)?;
        let rois = RoiManager::new(config.roi.clone()).map_err(ConfigError::from)?;
        let acquirer = MultiCameraAcquirer::new(active, config.acquisition.clone())?;
        let health = HealthMonitor::new(config.pipeline.degraded_after);
        log::info!(
            "pipeline ready: {} camera(s) at {:.1} Hz",
            provided.len(),
            config.pipeline.cycle_rate_hz
        );

        Ok(Self {
            config,
            acquirer,
            detector,
            filter,
            rois,
            store,
            sink,
            health,
            cycle: 0,
            calibration_health: None,
            sink_closed: false,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn filter(&self) -> &TrackFilter {
        &self.filter
    }

    pub fn rois(&self) -> &RoiManager {
        &self.rois
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn detection_stats(&self) -> &DetectionStats {
        self.detector.stats()
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Stop the capture workers and hand back the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Run one complete cycle. Never fails: faults degrade the cycle instead.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(cycle = self.cycle))
    )]
    pub fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.cycle;
        self.cycle += 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let acquisition = self.acquirer.acquire();
        report.exhausted = acquisition.all_exhausted();
        report.acquisition_errors = acquisition.errors;
        for e in &report.acquisition_errors {
            if !matches!(e, AcquisitionError::Exhausted { .. }) {
                log::debug!("cycle {cycle}: {e}");
            }
        }

        let calibration = self.store.load();
        let frames: Vec<Frame> = acquisition
            .frames
            .into_iter()
            .map(|f| self.attach_intrinsics(f, &calibration))
            .collect();
        let (frames, misaligned) = align_frames(frames, self.config.acquisition.sync_tolerance());
        report.acquisition_errors.extend(misaligned);

        let Some(now) = frames.iter().map(Frame::timestamp).max() else {
            report.skipped = true;
            if report.acquisition_errors.is_empty() {
                report.acquisition_errors.push(AcquisitionError::NoFrames);
            }
            self.health.record_skip();
            report.health = self.health.status();
            return report;
        };
        report.timestamp = Some(now);

        let calibration_health = calibration.health(&self.config.calibration, SystemTime::now());
        self.note_calibration(calibration_health);
        report.calibration = Some(calibration_health);

        let mut observations = Vec::new();
        for frame in &frames {
            let camera = frame.camera_id();
            self.rois.set_frame_size(camera, frame.width(), frame.height());
            let regions = if self.needs_full_frame(camera, cycle) {
                report.full_frame.push(camera);
                Vec::new()
            } else {
                self.rois.regions_for(camera)
            };
            report.cameras.push(camera);
            let workspace = self.config.camera(camera).and_then(|c| c.workspace.as_ref());
            let regions = match workspace {
                None => regions,
                Some(ws) => match clip_to_workspace(&regions, ws, frame.width(), frame.height()) {
                    Some(clipped) => clipped,
                    None => {
                        log::trace!("{camera}: search regions miss the workspace");
                        continue;
                    }
                },
            };
            let found = self.detector.detect_all(frame, &regions);
            observations.extend(
                found
                    .into_iter()
                    .filter(|o| workspace.is_none_or(|ws| ws.contains(o.centroid))),
            );
        }
        report.observations = observations.len();

        let measurements: Vec<Measurement> = observations
            .iter()
            .map(|obs| measurement(&calibration, obs))
            .collect();
        report.step = self.filter.step(&measurements, now);

        self.update_rois(&report.step, &report.cameras, &calibration, now);

        if calibration_health != CalibrationHealth::Invalid {
            report.poses = self.emit_poses(&calibration, calibration_health, now);
        }

        self.health.record_success();
        report.health = self.health.status();
        log::debug!(
            "cycle {cycle}: {} frame(s), {} observation(s), {} track(s), {} pose(s)",
            report.cameras.len(),
            report.observations,
            self.filter.len(),
            report.poses
        );
        report
    }

    /// Run cycles at `cycle_rate_hz` until `stop` is set or every camera is
    /// exhausted.
    pub fn run(&mut self, stop: &AtomicBool) -> RunSummary {
        let period = self.config.pipeline.cycle_period();
        let mut summary = RunSummary::default();
        let mut next_tick = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            let report = self.run_cycle();
            if report.exhausted {
                log::info!("all cameras exhausted after {} cycle(s)", summary.cycles);
                break;
            }
            summary.cycles += 1;
            summary.skipped += u64::from(report.skipped);
            summary.observations += report.observations as u64;
            summary.poses += report.poses as u64;

            if self.config.pipeline.pace {
                let now = Instant::now();
                next_tick = next_tick.checked_add(period).unwrap_or(now);
                if next_tick > now {
                    thread::sleep(next_tick - now);
                } else {
                    // overran the tick; do not try to catch up
                    next_tick = now;
                }
            }
        }
        summary.health = self.health.status();
        summary
    }

    fn attach_intrinsics(&self, frame: Frame, calibration: &CalibrationSet) -> Frame {
        let camera = frame.camera_id();
        if let Some(model) = self.config.camera(camera).and_then(|c| c.intrinsics_override) {
            return frame.with_intrinsics(model);
        }
        if frame.intrinsics().is_some() {
            return frame;
        }
        match calibration.model(camera) {
            Some(model) => frame.with_intrinsics(*model),
            None => frame,
        }
    }

    /// Search the whole frame on the periodic discovery cycle, or when a
    /// live track seen by `camera` has no window there.
    fn needs_full_frame(&self, camera: CameraId, cycle: u64) -> bool {
        let interval = u64::from(self.config.roi.full_frame_interval);
        if interval > 0 && cycle % interval == 0 {
            return true;
        }
        let mut any_track = false;
        for track in self.filter.tracks().filter(|t| t.seen_by(camera)) {
            any_track = true;
            if self.rois.get(track.id(), camera).is_none() {
                return true;
            }
        }
        !any_track
    }

    fn update_rois(
        &mut self,
        step: &StepReport,
        cameras: &[CameraId],
        calibration: &CalibrationSet,
        now: Duration,
    ) {
        let mut refreshed: BTreeMap<(TargetId, CameraId), Pt2> = BTreeMap::new();
        for a in &step.associations {
            refreshed.entry((a.target, a.camera)).or_insert(a.centroid);
        }
        for (&(target, camera), &centroid) in &refreshed {
            let speed = self
                .filter
                .track(target)
                .map(|t| pixel_speed(t, camera, calibration))
                .unwrap_or(0.0);
            self.rois.update(target, camera, centroid, true, speed, now);
        }

        let mut missed = Vec::new();
        for track in self.filter.tracks() {
            for &camera in cameras {
                let key = (track.id(), camera);
                if track.seen_by(camera) && !refreshed.contains_key(&key) {
                    missed.push(key);
                }
            }
        }
        for (target, camera) in missed {
            self.rois.update(target, camera, Pt2::origin(), false, 0.0, now);
        }

        for &id in &step.deleted {
            self.rois.remove_target(id);
        }
        self.rois.expire(now);
    }

    fn emit_poses(
        &mut self,
        calibration: &CalibrationSet,
        health: CalibrationHealth,
        now: Duration,
    ) -> usize {
        let plane_z = self.config.pipeline.working_plane_z;
        let updates: Vec<PoseUpdate> = self
            .filter
            .confirmed()
            .filter_map(|track| {
                let lifted = lift_track(track, calibration, plane_z);
                if lifted.is_none() {
                    log::debug!("track {}: no robot-frame pose in {}", track.id(), track.frame());
                }
                let (position, orientation, uncertainty) = lifted?;
                Some(PoseUpdate {
                    target_id: track.id(),
                    position,
                    orientation,
                    uncertainty,
                    cycle_timestamp: now,
                    degraded: health == CalibrationHealth::Stale,
                })
            })
            .collect();

        let mut published = 0;
        for update in updates {
            match self.sink.publish(update) {
                Ok(()) => published += 1,
                Err(e) => {
                    if !self.sink_closed {
                        log::warn!("{e}; pose updates are dropped");
                        self.sink_closed = true;
                    }
                    break;
                }
            }
        }
        published
    }

    fn note_calibration(&mut self, health: CalibrationHealth) {
        if self.calibration_health == Some(health) {
            return;
        }
        match health {
            CalibrationHealth::Invalid => {
                log::warn!("no valid calibration, pose output suppressed")
            }
            CalibrationHealth::Stale => {
                log::warn!("calibration is stale, poses are flagged degraded")
            }
            CalibrationHealth::Valid => log::info!("calibration valid"),
        }
        self.calibration_health = Some(health);
    }
}

/// Rig-frame measurement when the observation has a 3D point and its camera
/// has extrinsics, image-frame otherwise. The in-plane angle only carries over
/// to the rig frame from the reference camera.
fn measurement(calibration: &CalibrationSet, obs: &Observation) -> Measurement {
    let rig_point = obs
        .point_3d
        .and_then(|p| calibration.to_rig(obs.camera_id, &p));
    match rig_point {
        Some(p) => {
            let orientation = obs
                .orientation
                .filter(|_| calibration.reference == Some(obs.camera_id));
            Measurement::rig(obs, p, orientation)
        }
        None => Measurement::image(obs),
    }
}

/// Track speed in `camera`'s pixels per second.
fn pixel_speed(track: &Track, camera: CameraId, calibration: &CalibrationSet) -> f64 {
    match track.frame() {
        TrackFrame::Image(_) => track.velocity().xy().norm(),
        TrackFrame::Rig => {
            let p = Pt3::from(track.position());
            let ahead = p + track.velocity() * ROI_SPEED_HORIZON_S;
            match (
                calibration.project_rig_point(camera, &p),
                calibration.project_rig_point(camera, &ahead),
            ) {
                (Some(a), Some(b)) => (b - a).norm() / ROI_SPEED_HORIZON_S,
                _ => 0.0,
            }
        }
    }
}

/// Robot-frame position, orientation and one-sigma uncertainty (m).
fn lift_track(
    track: &Track,
    calibration: &CalibrationSet,
    plane_z: f64,
) -> Option<(Pt3, UnitQuaternion<f64>, f64)> {
    let state = track.position();
    match track.frame() {
        TrackFrame::Rig => {
            let reference = calibration.reference?;
            let position = calibration.lift_point(&Pt3::from(state))?;
            let orientation = calibration.robot_orientation(reference, track.orientation())?;
            Some((position, orientation, track.position_sigma()))
        }
        TrackFrame::Image(camera) => {
            let pixel = Pt2::new(state.x, state.y);
            let position = calibration.lift_image_point(camera, pixel, plane_z)?;
            let orientation = calibration.robot_orientation(camera, track.orientation())?;
            let scale = calibration.metres_per_pixel(camera, &position)?;
            Some((position, orientation, track.position_sigma() * scale))
        }
    }
}

/// Clip search regions to the workspace bounds. An empty `regions` (full
/// frame) becomes the bounds themselves. `None` when nothing is left.
fn clip_to_workspace(
    regions: &[PixelRect],
    workspace: &WorkspaceRegion,
    width: usize,
    height: usize,
) -> Option<Vec<PixelRect>> {
    let bounds = workspace.bounding_rect(width, height)?;
    if regions.is_empty() {
        return Some(vec![bounds]);
    }
    let clipped: Vec<PixelRect> = regions.iter().filter_map(|r| r.intersection(&bounds)).collect();
    (!clipped.is_empty()).then_some(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraEntry, ReplaySource, VecSink};
    use robot_tracker_core::synthetic::{fill_disk, WHITE};
    use robot_tracker_core::{ColorImage, Modality};
    use robot_tracker_track::TrackConfigError;

    fn blank(cam: u32, ms: u64) -> Frame {
        Frame::new(
            CameraId(cam),
            Duration::from_millis(ms),
            ColorImage::filled(64, 48, [0, 0, 0]).expect("image"),
        )
    }

    fn config(cams: &[u32]) -> TrackerConfig {
        let mut cfg = TrackerConfig::with_cameras(cams.iter().map(|&c| CameraId(c)));
        cfg.acquisition.join_timeout_s = 1.0;
        cfg.pipeline.pace = false;
        cfg.pipeline.degraded_after = 2;
        cfg
    }

    fn replay(cam: u32, frames: usize) -> Box<dyn FrameSource> {
        Box::new(ReplaySource::from_frames(
            CameraId(cam),
            (0..frames).map(|i| blank(cam, 33 * i as u64)),
        ))
    }

    #[test]
    fn sources_must_match_enabled_cameras() {
        let store = CalibrationStore::default();
        let missing = Pipeline::new(
            config(&[0, 1]),
            vec![replay(0, 1)],
            store.clone(),
            VecSink::new(),
        );
        assert!(matches!(
            missing,
            Err(PipelineError::Config(ConfigError::MissingSource(CameraId(1))))
        ));

        let unknown = Pipeline::new(
            config(&[0]),
            vec![replay(0, 1), replay(5, 1)],
            store.clone(),
            VecSink::new(),
        );
        assert!(matches!(
            unknown,
            Err(PipelineError::Config(ConfigError::UnknownSource(CameraId(5))))
        ));

        let mut cfg = config(&[0]);
        cfg.cameras.push(CameraEntry {
            enabled: false,
            ..CameraEntry::new(CameraId(1))
        });
        Pipeline::new(cfg, vec![replay(0, 1), replay(1, 1)], store, VecSink::new())
            .expect("disabled camera's source is ignored");
    }

    #[test]
    fn oversized_timeouts_fail_at_construction() {
        let mut cfg = config(&[0]);
        cfg.tracking.lost_timeout_s = 1e20;
        let res = Pipeline::new(
            cfg,
            vec![replay(0, 1)],
            CalibrationStore::default(),
            VecSink::new(),
        );
        assert!(matches!(
            res,
            Err(PipelineError::Config(ConfigError::Track(
                TrackConfigError::DurationOutOfRange { .. }
            )))
        ));
    }

    #[test]
    fn empty_frames_run_without_observations_and_exhaust() {
        let mut p = Pipeline::new(
            config(&[0]),
            vec![replay(0, 2)],
            CalibrationStore::default(),
            VecSink::new(),
        )
        .expect("pipeline");
        let first = p.run_cycle();
        assert!(!first.skipped);
        assert_eq!(first.full_frame, vec![CameraId(0)]);
        assert_eq!(first.observations, 0);
        assert_eq!(first.calibration, Some(CalibrationHealth::Invalid));
        p.run_cycle();
        let end = p.run_cycle();
        assert!(end.skipped && end.exhausted);
    }

    #[test]
    fn run_stops_when_sources_are_exhausted() {
        let mut p = Pipeline::new(
            config(&[0, 1]),
            vec![replay(0, 3), replay(1, 3)],
            CalibrationStore::default(),
            VecSink::new(),
        )
        .expect("pipeline");
        let summary = p.run(&AtomicBool::new(false));
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.health, HealthStatus::Healthy);
    }

    #[test]
    fn stop_flag_prevents_any_cycle() {
        let mut p = Pipeline::new(
            config(&[0]),
            vec![replay(0, 3)],
            CalibrationStore::default(),
            VecSink::new(),
        )
        .expect("pipeline");
        let summary = p.run(&AtomicBool::new(true));
        assert_eq!(summary.cycles, 0);
    }

    #[test]
    fn observation_without_calibration_stays_in_the_image_frame() {
        let obs = Observation::new(
            Modality::ReflectiveBlob,
            Pt2::new(10.0, 20.0),
            0.9,
            CameraId(0),
            Duration::ZERO,
        )
        .with_point_3d(Pt3::new(0.0, 0.0, 1.0));
        let m = measurement(&CalibrationSet::default(), &obs);
        assert_eq!(m.frame, TrackFrame::Image(CameraId(0)));
    }

    fn two_blobs(cam: u32) -> Frame {
        let mut img = ColorImage::filled(160, 120, [0, 0, 0]).expect("image");
        fill_disk(&mut img, Pt2::new(30.0, 30.0), 9.0, WHITE);
        fill_disk(&mut img, Pt2::new(120.0, 80.0), 9.0, WHITE);
        Frame::new(CameraId(cam), Duration::ZERO, img)
    }

    fn observations_with(workspace: Option<WorkspaceRegion>) -> usize {
        let mut cfg = config(&[0]);
        cfg.detector.aruco.enabled = false;
        cfg.detector.led.enabled = false;
        cfg.cameras[0].workspace = workspace;
        let source = ReplaySource::from_frames(CameraId(0), [two_blobs(0)]);
        let mut p = Pipeline::new(
            cfg,
            vec![Box::new(source)],
            CalibrationStore::default(),
            VecSink::new(),
        )
        .expect("pipeline");
        let report = p.run_cycle();
        assert_eq!(report.cameras, vec![CameraId(0)]);
        report.observations
    }

    #[test]
    fn workspace_limits_search_and_observations() {
        assert_eq!(observations_with(None), 2);

        let circle = WorkspaceRegion::Circle {
            center: Pt2::new(30.0, 30.0),
            radius: 25.0,
        };
        assert_eq!(observations_with(Some(circle)), 1);

        // bounding box covers both blobs, the triangle only the first
        let triangle = WorkspaceRegion::Polygon {
            vertices: vec![Pt2::new(0.0, 0.0), Pt2::new(150.0, 0.0), Pt2::new(0.0, 110.0)],
        };
        assert_eq!(observations_with(Some(triangle)), 1);

        let elsewhere = WorkspaceRegion::Rectangle(PixelRect {
            x: 60,
            y: 0,
            width: 30,
            height: 30,
        });
        assert_eq!(observations_with(Some(elsewhere)), 0);
    }

    #[test]
    fn workspace_clipping_of_search_regions() {
        let ws = WorkspaceRegion::Rectangle(PixelRect {
            x: 10,
            y: 10,
            width: 20,
            height: 20,
        });
        assert_eq!(
            clip_to_workspace(&[], &ws, 64, 48),
            Some(vec![PixelRect {
                x: 10,
                y: 10,
                width: 20,
                height: 20
            }])
        );
        let roi = PixelRect {
            x: 25,
            y: 0,
            width: 20,
            height: 20,
        };
        assert_eq!(
            clip_to_workspace(&[roi], &ws, 64, 48),
            Some(vec![PixelRect {
                x: 25,
                y: 10,
                width: 5,
                height: 10
            }])
        );
        let far = PixelRect {
            x: 40,
            y: 30,
            width: 5,
            height: 5,
        };
        assert_eq!(clip_to_workspace(&[far], &ws, 64, 48), None);
    }
}
