//! Image-sequence replay through the [`FrameSource`] contract.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{CameraId, ColorImage, Frame, ImageBufferError};
use crate::pipeline::{AcquisitionError, FrameSource};

#[cfg(feature = "tracing")]
use tracing::instrument;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Errors produced while setting up a replay source.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no PNG or JPEG images in {0}")]
    Empty(PathBuf),

    #[error("frame rate must be positive and finite, got {0}")]
    InvalidFrameRate(f64),
}

/// Convert an `image::RgbImage` into the lightweight `robot-tracker-core` type.
pub fn color_image(img: &::image::RgbImage) -> Result<ColorImage, ImageBufferError> {
    ColorImage::from_raw(img.width() as usize, img.height() as usize, img.as_raw().clone())
}

/// Plays image files of one camera in order.
///
/// Frame `i` is stamped `i / fps` seconds, so sequences of several cameras
/// recorded at the same rate stay aligned. An unreadable file is reported as
/// [`AcquisitionError::Unavailable`] for that cycle only.
#[derive(Clone, Debug)]
pub struct ImageSequenceSource {
    camera: CameraId,
    paths: VecDeque<PathBuf>,
    period: Duration,
    index: u32,
}

impl ImageSequenceSource {
    pub fn new(
        camera: CameraId,
        paths: impl IntoIterator<Item = PathBuf>,
        fps: f64,
    ) -> Result<Self, ReplayError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(ReplayError::InvalidFrameRate(fps));
        }
        let period = Duration::try_from_secs_f64(1.0 / fps)
            .map_err(|_| ReplayError::InvalidFrameRate(fps))?;
        Ok(Self {
            camera,
            paths: paths.into_iter().collect(),
            period,
            index: 0,
        })
    }

    /// Every PNG/JPEG file in `dir`, sorted by file name.
    pub fn from_dir(camera: CameraId, dir: &Path, fps: f64) -> Result<Self, ReplayError> {
        let io = |source| ReplayError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)));
            if is_image && path.is_file() {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(ReplayError::Empty(dir.to_path_buf()));
        }
        paths.sort();
        log::info!("{camera}: {} image(s) from {}", paths.len(), dir.display());
        Self::new(camera, paths, fps)
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }

    fn load(&self, path: &Path) -> Result<ColorImage, String> {
        let img = ::image::open(path).map_err(|e| e.to_string())?.to_rgb8();
        color_image(&img).map_err(|e| e.to_string())
    }
}

impl FrameSource for ImageSequenceSource {
    fn camera_id(&self) -> CameraId {
        self.camera
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(camera = %self.camera, index = self.index))
    )]
    fn capture(&mut self) -> Result<Frame, AcquisitionError> {
        let Some(path) = self.paths.pop_front() else {
            return Err(AcquisitionError::Exhausted {
                camera: self.camera,
            });
        };
        let timestamp = self
            .period
            .checked_mul(self.index)
            .unwrap_or(Duration::MAX);
        self.index += 1;
        match self.load(&path) {
            Ok(img) => Ok(Frame::new(self.camera, timestamp, img)),
            Err(reason) => {
                log::warn!("{}: {}: {reason}", self.camera, path.display());
                Err(AcquisitionError::Unavailable {
                    camera: self.camera,
                    reason: format!("{}: {reason}", path.display()),
                })
            }
        }
    }
}
