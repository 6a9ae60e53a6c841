//! Coloured LED detection.

use robot_tracker_core::{rgb_to_hsv, Frame, Modality, Observation, PixelRect};

use crate::components::{label_components, Mask};
use crate::{LedParams, LedPreset};

#[derive(Clone, Debug)]
pub struct LedDetector {
    params: LedParams,
}

impl LedDetector {
    pub fn new(params: LedParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LedParams {
        &self.params
    }

    /// One pass per colour preset. Confidence is the mean colour-match
    /// strength over the blob.
    pub fn detect(&self, frame: &Frame, regions: &[PixelRect]) -> Vec<Observation> {
        let img = frame.color();
        let (w, h) = (img.width(), img.height());
        // HSV once per covered pixel, shared by all presets.
        let mut hsv = vec![[0u8; 3]; w * h];
        for r in regions {
            for y in r.y as usize..(r.bottom() as usize).min(h) {
                for x in r.x as usize..(r.right() as usize).min(w) {
                    hsv[y * w + x] = rgb_to_hsv(img.pixel(x, y));
                }
            }
        }

        let min_area = self.params.min_area.max(1.0).ceil() as usize;
        let mut out = Vec::new();
        for preset in &self.params.presets {
            let mask = Mask::from_regions(w, h, regions, |x, y| {
                preset.strength(hsv[y * w + x]).is_some()
            });
            for comp in label_components(&mask, min_area) {
                let strength = mean_strength(preset, &hsv, w, &comp.pixels);
                let mut obs = Observation::new(
                    Modality::Led,
                    comp.centroid(),
                    strength,
                    frame.camera_id(),
                    frame.timestamp(),
                );
                obs.target_hint = preset.target;
                obs.size_px = (comp.area() as f64).sqrt();
                out.push(obs);
            }
        }
        out
    }
}

fn mean_strength(preset: &LedPreset, hsv: &[[u8; 3]], width: usize, pixels: &[(u32, u32)]) -> f64 {
    if pixels.is_empty() {
        return 0.0;
    }
    let sum: f64 = pixels
        .iter()
        .filter_map(|&(x, y)| preset.strength(hsv[y as usize * width + x as usize]))
        .sum();
    sum / pixels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use robot_tracker_core::synthetic::{fill_disk, BLACK};
    use robot_tracker_core::{CameraId, ColorImage, Pt2, TargetId};
    use std::time::Duration;

    #[test]
    fn presets_assign_identity_and_strength() {
        let mut img = ColorImage::filled(120, 80, BLACK).expect("image");
        fill_disk(&mut img, Pt2::new(30.0, 40.0), 6.0, [0, 255, 0]);
        fill_disk(&mut img, Pt2::new(90.0, 40.0), 6.0, [0, 0, 128]);
        let params = LedParams {
            presets: vec![
                LedPreset::new("green", [40, 80]).with_target(TargetId(11)),
                LedPreset::new("blue", [100, 130]),
            ],
            ..LedParams::default()
        };
        let frame = Frame::new(CameraId(0), Duration::ZERO, img);
        let obs = LedDetector::new(params).detect(&frame, &[PixelRect::full(120, 80)]);
        assert_eq!(obs.len(), 2);

        let green = &obs[0];
        assert_eq!(green.target_hint, Some(TargetId(11)));
        assert_relative_eq!(green.centroid.x, 30.0, epsilon = 0.3);
        assert_relative_eq!(green.confidence, 1.0, epsilon = 1e-9);

        let blue = &obs[1];
        assert_eq!(blue.target_hint, None);
        // hue 120 sits 5 units off the window centre, value 128/255
        assert!(blue.confidence < 0.5 && blue.confidence > 0.4, "{}", blue.confidence);
    }

    #[test]
    fn dark_scene_yields_nothing() {
        let img = ColorImage::filled(40, 40, [5, 5, 5]).expect("image");
        let frame = Frame::new(CameraId(0), Duration::ZERO, img);
        let obs = LedDetector::new(LedParams::default()).detect(&frame, &[PixelRect::full(40, 40)]);
        assert!(obs.is_empty());
    }
}
