use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CameraModel, ColorImage, DepthMap, ImageBufferError};

/// Stable camera identifier as configured.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// One timestamped capture from a single camera.
///
/// `timestamp` is read from a monotonic clock shared by all sources of one
/// pipeline. A frame is immutable once built.
#[derive(Clone, Debug)]
pub struct Frame {
    camera_id: CameraId,
    timestamp: Duration,
    color: ColorImage,
    depth: Option<DepthMap>,
    intrinsics: Option<CameraModel>,
}

impl Frame {
    pub fn new(camera_id: CameraId, timestamp: Duration, color: ColorImage) -> Self {
        Self {
            camera_id,
            timestamp,
            color,
            depth: None,
            intrinsics: None,
        }
    }

    /// Attach a depth map registered to the color image.
    pub fn with_depth(mut self, depth: DepthMap) -> Result<Self, ImageBufferError> {
        let color = (self.color.width(), self.color.height());
        let dims = (depth.width(), depth.height());
        if color != dims {
            return Err(ImageBufferError::SizeMismatch { color, depth: dims });
        }
        self.depth = Some(depth);
        Ok(self)
    }

    pub fn with_intrinsics(mut self, model: CameraModel) -> Self {
        self.intrinsics = Some(model);
        self
    }

    #[inline]
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    #[inline]
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    #[inline]
    pub fn color(&self) -> &ColorImage {
        &self.color
    }

    #[inline]
    pub fn depth(&self) -> Option<&DepthMap> {
        self.depth.as_ref()
    }

    #[inline]
    pub fn intrinsics(&self) -> Option<&CameraModel> {
        self.intrinsics.as_ref()
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.color.width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.color.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_must_match_color_size() {
        let color = ColorImage::filled(8, 6, [0, 0, 0]).expect("color");
        let frame = Frame::new(CameraId(2), Duration::from_millis(40), color);

        let bad = DepthMap::from_raw(4, 3, vec![1.0; 12]).expect("depth");
        assert!(matches!(
            frame.clone().with_depth(bad),
            Err(ImageBufferError::SizeMismatch { .. })
        ));

        let good = DepthMap::from_raw(8, 6, vec![1.0; 48]).expect("depth");
        let frame = frame.with_depth(good).expect("matching depth");
        assert!(frame.depth().is_some());
        assert_eq!(frame.camera_id().to_string(), "cam2");
    }
}
