//! Retro-reflective marker detection.

use robot_tracker_core::{rgb_to_hsv, Frame, Modality, Observation, PixelRect};

use crate::components::{label_components, Mask};
use crate::{search_extent, ReflectiveParams};

#[derive(Clone, Debug)]
pub struct ReflectiveDetector {
    params: ReflectiveParams,
}

impl ReflectiveDetector {
    pub fn new(params: ReflectiveParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ReflectiveParams {
        &self.params
    }

    /// Bright low-saturation blobs, closed, filtered by area and circularity.
    ///
    /// Confidence is the blob's circularity.
    pub fn detect(&self, frame: &Frame, regions: &[PixelRect]) -> Vec<Observation> {
        let p = &self.params;
        let img = frame.color();
        let (w, h) = (img.width(), img.height());

        let raw = Mask::from_regions(w, h, regions, |x, y| p.accepts(rgb_to_hsv(img.pixel(x, y))));
        let pad = (p.closing_kernel / 2 * p.closing_iterations) as u32;
        let Some(work) = search_extent(regions, pad, w, h) else {
            return Vec::new();
        };
        let mask = raw.close(p.closing_kernel, p.closing_iterations, work);
        log::trace!(
            "reflective mask on {}: {} px after closing",
            frame.camera_id(),
            mask.count()
        );

        let min_area = p.min_area.max(1.0).ceil() as usize;
        label_components(&mask, min_area)
            .into_iter()
            .filter(|c| c.area() as f64 <= p.max_area)
            .filter_map(|c| {
                let circularity = c.circularity();
                if circularity < p.min_circularity {
                    return None;
                }
                let mut obs = Observation::new(
                    Modality::ReflectiveBlob,
                    c.centroid(),
                    circularity,
                    frame.camera_id(),
                    frame.timestamp(),
                );
                obs.size_px = (c.area() as f64).sqrt();
                Some(obs)
            })
            .collect()
    }
}
