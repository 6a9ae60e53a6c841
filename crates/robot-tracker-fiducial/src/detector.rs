//! Unified multi-modal detection entry point.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use robot_tracker_core::{Frame, Modality, Observation, PixelRect};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    ArucoDetector, ArucoParams, DetectorConfigError, DetectorParams, LedDetector, LedParams,
    ReflectiveDetector, ReflectiveParams,
};

/// Closed set of detection modalities behind one interface.
#[derive(Clone, Debug)]
pub enum ModalityDetector {
    Aruco(ArucoDetector),
    Reflective(ReflectiveDetector),
    Led(LedDetector),
}

impl ModalityDetector {
    pub fn modality(&self) -> Modality {
        match self {
            ModalityDetector::Aruco(_) => Modality::ArucoMarker,
            ModalityDetector::Reflective(_) => Modality::ReflectiveBlob,
            ModalityDetector::Led(_) => Modality::Led,
        }
    }

    /// Run this modality on `regions` (already clipped to the frame).
    pub fn detect(&self, frame: &Frame, regions: &[PixelRect]) -> Vec<Observation> {
        match self {
            ModalityDetector::Aruco(d) => {
                let gray = frame.color().to_gray();
                d.detect(frame, &gray.view(), regions)
            }
            ModalityDetector::Reflective(d) => d.detect(frame, regions),
            ModalityDetector::Led(d) => d.detect(frame, regions),
        }
    }
}

/// Running detection statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionStats {
    pub frames: u64,
    pub total_detections: u64,
    pub aruco: u64,
    pub reflective: u64,
    pub led: u64,
    pub last_detection_time: Duration,
    /// Exponential moving average with weight [`DetectionStats::SMOOTHING`].
    pub avg_detection_time: Duration,
}

impl DetectionStats {
    pub const SMOOTHING: f64 = 0.1;

    pub fn record(&mut self, observations: &[Observation], elapsed: Duration) {
        self.frames += 1;
        self.total_detections += observations.len() as u64;
        for o in observations {
            match o.modality {
                Modality::ArucoMarker => self.aruco += 1,
                Modality::ReflectiveBlob => self.reflective += 1,
                Modality::Led => self.led += 1,
            }
        }
        self.last_detection_time = elapsed;
        self.avg_detection_time = if self.frames == 1 {
            elapsed
        } else {
            self.avg_detection_time.mul_f64(1.0 - Self::SMOOTHING)
                + elapsed.mul_f64(Self::SMOOTHING)
        };
    }

    pub fn count(&self, modality: Modality) -> u64 {
        match modality {
            Modality::ArucoMarker => self.aruco,
            Modality::ReflectiveBlob => self.reflective,
            Modality::Led => self.led,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Runs every enabled modality over a frame.
///
/// Modalities disabled in the configuration are still built when their
/// parameters allow it, so they can be switched on at runtime.
#[derive(Clone, Debug)]
pub struct FiducialDetector {
    detectors: Vec<ModalityDetector>,
    disabled: BTreeSet<Modality>,
    depth_window: usize,
    stats: DetectionStats,
}

impl FiducialDetector {
    pub fn new(params: DetectorParams) -> Result<Self, DetectorConfigError> {
        params.validate()?;
        let mut this = Self {
            detectors: Vec::new(),
            disabled: BTreeSet::new(),
            depth_window: params.depth_window,
            stats: DetectionStats::default(),
        };

        let enabled = params.aruco.enabled;
        let aruco = ArucoParams {
            enabled: true,
            ..params.aruco
        };
        this.install(
            Modality::ArucoMarker,
            enabled,
            ArucoDetector::new(aruco).map(ModalityDetector::Aruco),
        )?;

        let enabled = params.reflective.enabled;
        let reflective = ReflectiveParams {
            enabled: true,
            ..params.reflective
        };
        let built = reflective
            .validate()
            .map(|()| ModalityDetector::Reflective(ReflectiveDetector::new(reflective)));
        this.install(Modality::ReflectiveBlob, enabled, built)?;

        let enabled = params.led.enabled;
        let led = LedParams {
            enabled: true,
            ..params.led
        };
        let built = led
            .validate()
            .map(|()| ModalityDetector::Led(LedDetector::new(led)));
        this.install(Modality::Led, enabled, built)?;

        if this.modalities().next().is_none() {
            log::warn!("fiducial detector built with every modality disabled");
        }
        Ok(this)
    }

    fn install(
        &mut self,
        modality: Modality,
        enabled: bool,
        built: Result<ModalityDetector, DetectorConfigError>,
    ) -> Result<(), DetectorConfigError> {
        match built {
            Ok(detector) => {
                if !enabled {
                    self.disabled.insert(modality);
                }
                self.detectors.push(detector);
                Ok(())
            }
            Err(e) if enabled => Err(e),
            Err(e) => {
                log::debug!("{modality:?} unavailable for runtime enabling: {e}");
                Ok(())
            }
        }
    }

    /// Enabled modalities, in detection order.
    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.active().map(ModalityDetector::modality)
    }

    pub fn is_enabled(&self, modality: Modality) -> bool {
        self.modalities().any(|m| m == modality)
    }

    /// Switch a modality on or off. Returns `false` when the modality has no
    /// usable detector, which happens when its parameters are invalid.
    pub fn set_enabled(&mut self, modality: Modality, enabled: bool) -> bool {
        if !self.detectors.iter().any(|d| d.modality() == modality) {
            log::warn!("cannot toggle {modality:?}: no valid detector configured");
            return false;
        }
        let changed = if enabled {
            self.disabled.remove(&modality)
        } else {
            self.disabled.insert(modality)
        };
        if changed {
            log::info!(
                "{modality:?} detection {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        true
    }

    fn active(&self) -> impl Iterator<Item = &ModalityDetector> + '_ {
        self.detectors
            .iter()
            .filter(|d| !self.disabled.contains(&d.modality()))
    }

    pub fn stats(&self) -> &DetectionStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Lazy detection: one modality pass runs each time the iterator needs
    /// more items. An empty `rois` slice searches the whole frame.
    ///
    /// Observations get a camera-frame 3D point from the depth map when the
    /// frame carries depth and intrinsics and the detector did not provide one.
    pub fn detect<'a>(
        &'a self,
        frame: &'a Frame,
        rois: &[PixelRect],
    ) -> impl Iterator<Item = Observation> + 'a {
        let regions = search_regions(rois, frame.width(), frame.height());
        let window = self.depth_window;
        self.active()
            .flat_map(move |d| d.detect(frame, &regions))
            .map(move |o| lift_with_depth(o, frame, window))
    }

    /// Collect all observations and record timing statistics.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip_all,
            fields(camera = %frame.camera_id(), rois = rois.len())
        )
    )]
    pub fn detect_all(&mut self, frame: &Frame, rois: &[PixelRect]) -> Vec<Observation> {
        let started = Instant::now();
        let out: Vec<Observation> = self.detect(frame, rois).collect();
        self.stats.record(&out, started.elapsed());
        log::debug!(
            "{}: {} observations in {:.2} ms",
            frame.camera_id(),
            out.len(),
            self.stats.last_detection_time.as_secs_f64() * 1e3
        );
        out
    }
}

/// Clip `rois` to the frame; empty input means the full frame.
pub(crate) fn search_regions(rois: &[PixelRect], width: usize, height: usize) -> Vec<PixelRect> {
    if rois.is_empty() {
        return vec![PixelRect::full(width, height)];
    }
    rois.iter()
        .filter_map(|r| {
            let x1 = (r.right() as usize).min(width);
            let y1 = (r.bottom() as usize).min(height);
            let (x0, y0) = (r.x as usize, r.y as usize);
            (x0 < x1 && y0 < y1).then(|| PixelRect {
                x: x0 as u32,
                y: y0 as u32,
                width: (x1 - x0) as u32,
                height: (y1 - y0) as u32,
            })
        })
        .collect()
}

/// Bounding box of `regions` grown by `pad`, clipped to the frame.
pub(crate) fn search_extent(
    regions: &[PixelRect],
    pad: u32,
    width: usize,
    height: usize,
) -> Option<PixelRect> {
    let x0 = regions.iter().map(|r| r.x).min()?.saturating_sub(pad);
    let y0 = regions.iter().map(|r| r.y).min()?.saturating_sub(pad);
    let x1 = (regions.iter().map(|r| r.right()).max()? + pad).min(width as u32);
    let y1 = (regions.iter().map(|r| r.bottom()).max()? + pad).min(height as u32);
    (x0 < x1 && y0 < y1).then(|| PixelRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

fn lift_with_depth(mut obs: Observation, frame: &Frame, window: usize) -> Observation {
    if obs.point_3d.is_some() {
        return obs;
    }
    let (Some(depth), Some(model)) = (frame.depth(), frame.intrinsics()) else {
        return obs;
    };
    if let Some(z) = depth.median_around(obs.centroid, window) {
        obs.point_3d = Some(model.backproject(obs.centroid, z as f64));
    }
    obs
}
