//! Detector configuration.

use robot_tracker_core::TargetId;
use serde::{Deserialize, Serialize};

use crate::Dictionary;

/// Invalid detector configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DetectorConfigError {
    #[error("ArUco dictionary '{0}' has no codes")]
    EmptyDictionary(String),
    #[error("ArUco marker size {marker_size} implies {bits} bits (at most 64 supported)")]
    DictionaryTooLarge { marker_size: usize, bits: usize },
    #[error("invalid HSV range for {what}: lower {lower:?} exceeds upper {upper:?}")]
    InvalidHsvRange {
        what: String,
        lower: [u8; 3],
        upper: [u8; 3],
    },
    #[error("invalid area bounds: min {min} > max {max}")]
    InvalidAreaBounds { min: f64, max: f64 },
    #[error("parameter `{name}` out of range: {value}")]
    OutOfRange { name: &'static str, value: f64 },
}

fn check_range(
    name: &'static str,
    value: f64,
    lo: f64,
    hi: f64,
) -> Result<(), DetectorConfigError> {
    if value.is_finite() && value >= lo && value <= hi {
        Ok(())
    } else {
        Err(DetectorConfigError::OutOfRange { name, value })
    }
}

/// ArUco marker detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArucoParams {
    pub enabled: bool,
    pub dictionary: Dictionary,
    /// Maximum accepted Hamming distance. Clamped to the dictionary's
    /// correction capability.
    pub max_hamming: u8,
    /// Smallest accepted marker side, in pixels.
    pub min_side_px: f64,
    /// Largest accepted marker side as a fraction of the image's larger dimension.
    pub max_side_frac: f64,
    /// Minimum intensity spread (max - min) inside a search region.
    pub min_contrast: u8,
    /// Fraction of a cell ignored near its edges when sampling bits.
    pub inset_frac: f64,
    /// Required fraction of black border cells.
    pub min_border_score: f64,
    /// Silhouette-to-quad residual (px) at which confidence is halved.
    pub residual_scale_px: f64,
    /// Candidates with a larger residual (px) are rejected.
    pub max_residual_px: f64,
    /// Printed marker side in metres. Enables depth-free 3D recovery.
    pub marker_length_m: Option<f64>,
}

impl Default for ArucoParams {
    fn default() -> Self {
        Self {
            enabled: true,
            dictionary: Dictionary::default(),
            max_hamming: 1,
            min_side_px: 12.0,
            max_side_frac: 0.8,
            min_contrast: 40,
            inset_frac: 0.15,
            min_border_score: 0.85,
            residual_scale_px: 1.5,
            max_residual_px: 3.0,
            marker_length_m: None,
        }
    }
}

impl ArucoParams {
    pub fn validate(&self) -> Result<(), DetectorConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.dictionary.is_empty() {
            return Err(DetectorConfigError::EmptyDictionary(
                self.dictionary.name.clone(),
            ));
        }
        let bits = self.dictionary.bit_count();
        if bits == 0 || bits > 64 {
            return Err(DetectorConfigError::DictionaryTooLarge {
                marker_size: self.dictionary.marker_size,
                bits,
            });
        }
        check_range("aruco.min_side_px", self.min_side_px, 4.0, f64::MAX)?;
        check_range("aruco.max_side_frac", self.max_side_frac, 0.01, 1.0)?;
        check_range("aruco.inset_frac", self.inset_frac, 0.0, 0.4)?;
        check_range("aruco.min_border_score", self.min_border_score, 0.0, 1.0)?;
        check_range("aruco.residual_scale_px", self.residual_scale_px, 1e-6, f64::MAX)?;
        check_range("aruco.max_residual_px", self.max_residual_px, 0.0, f64::MAX)?;
        if let Some(len) = self.marker_length_m {
            check_range("aruco.marker_length_m", len, 1e-6, f64::MAX)?;
        }
        Ok(())
    }

    /// Hamming threshold actually used for matching.
    pub fn effective_max_hamming(&self) -> u8 {
        self.max_hamming.min(self.dictionary.max_correction_bits)
    }
}

/// Retro-reflective marker detection (bright, unsaturated blobs).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectiveParams {
    pub enabled: bool,
    /// Inclusive HSV bounds, OpenCV 8-bit scale (`H` in `0..=180`).
    pub hsv_lower: [u8; 3],
    pub hsv_upper: [u8; 3],
    /// Closing kernel diameter in pixels.
    pub closing_kernel: usize,
    pub closing_iterations: usize,
    pub min_area: f64,
    pub max_area: f64,
    pub min_circularity: f64,
}

impl Default for ReflectiveParams {
    fn default() -> Self {
        Self {
            enabled: true,
            hsv_lower: [0, 0, 200],
            hsv_upper: [180, 30, 255],
            closing_kernel: 5,
            closing_iterations: 2,
            min_area: 50.0,
            max_area: 5000.0,
            min_circularity: 0.7,
        }
    }
}

impl ReflectiveParams {
    pub fn validate(&self) -> Result<(), DetectorConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if (0..3).any(|i| self.hsv_lower[i] > self.hsv_upper[i]) {
            return Err(DetectorConfigError::InvalidHsvRange {
                what: "reflective".into(),
                lower: self.hsv_lower,
                upper: self.hsv_upper,
            });
        }
        if self.min_area > self.max_area || self.min_area < 0.0 {
            return Err(DetectorConfigError::InvalidAreaBounds {
                min: self.min_area,
                max: self.max_area,
            });
        }
        check_range("reflective.min_circularity", self.min_circularity, 0.0, 1.0)
    }

    #[inline]
    pub(crate) fn accepts(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| hsv[i] >= self.hsv_lower[i] && hsv[i] <= self.hsv_upper[i])
    }
}

/// Named LED colour window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedPreset {
    pub name: String,
    /// Inclusive hue window `[lo, hi]` (0..180). `lo > hi` wraps through red.
    pub hue: [u8; 2],
    #[serde(default = "LedPreset::default_saturation")]
    pub saturation: [u8; 2],
    #[serde(default = "LedPreset::default_value")]
    pub value: [u8; 2],
    /// Identity assigned to blobs of this colour.
    #[serde(default)]
    pub target: Option<TargetId>,
}

impl LedPreset {
    fn default_saturation() -> [u8; 2] {
        [50, 255]
    }

    fn default_value() -> [u8; 2] {
        [50, 255]
    }

    pub fn new(name: &str, hue: [u8; 2]) -> Self {
        Self {
            name: name.to_string(),
            hue,
            saturation: Self::default_saturation(),
            value: Self::default_value(),
            target: None,
        }
    }

    pub fn with_target(mut self, id: TargetId) -> Self {
        self.target = Some(id);
        self
    }

    fn hue_half_width(&self) -> f64 {
        let [lo, hi] = self.hue;
        let span = if lo <= hi {
            (hi - lo) as f64
        } else {
            (180 - lo as u16 + hi as u16) as f64
        };
        (0.5 * span).max(0.5)
    }

    fn hue_center(&self) -> f64 {
        let [lo, hi] = self.hue;
        let c = lo as f64 + self.hue_half_width();
        if lo <= hi {
            c
        } else {
            c % 180.0
        }
    }

    /// Colour-match strength in `[0, 1]`, or `None` outside the window.
    ///
    /// Strength decays from 1 at the hue centre to 0.5 at the window edge and
    /// is scaled by brightness.
    pub fn strength(&self, hsv: [u8; 3]) -> Option<f64> {
        let [h, s, v] = hsv;
        if s < self.saturation[0] || s > self.saturation[1] {
            return None;
        }
        if v < self.value[0] || v > self.value[1] {
            return None;
        }
        let [lo, hi] = self.hue;
        let inside = if lo <= hi {
            h >= lo && h <= hi
        } else {
            h >= lo || h <= hi
        };
        if !inside {
            return None;
        }
        let d = (h as f64 - self.hue_center()).abs();
        let d = d.min(180.0 - d);
        let hue_match = 1.0 - 0.5 * (d / self.hue_half_width()).min(1.0);
        Some(hue_match * v as f64 / 255.0)
    }
}

/// Coloured LED detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedParams {
    pub enabled: bool,
    pub presets: Vec<LedPreset>,
    pub min_area: f64,
}

impl Default for LedParams {
    fn default() -> Self {
        Self {
            enabled: true,
            presets: vec![
                LedPreset::new("red", [170, 10]),
                LedPreset::new("green", [40, 80]),
                LedPreset::new("blue", [100, 130]),
            ],
            min_area: 20.0,
        }
    }
}

impl LedParams {
    pub fn validate(&self) -> Result<(), DetectorConfigError> {
        if !self.enabled {
            return Ok(());
        }
        for p in &self.presets {
            let bad_hue = p.hue[0] > 180 || p.hue[1] > 180;
            let bad_sv = p.saturation[0] > p.saturation[1] || p.value[0] > p.value[1];
            if bad_hue || bad_sv {
                return Err(DetectorConfigError::InvalidHsvRange {
                    what: format!("led preset '{}'", p.name),
                    lower: [p.hue[0], p.saturation[0], p.value[0]],
                    upper: [p.hue[1], p.saturation[1], p.value[1]],
                });
            }
        }
        check_range("led.min_area", self.min_area, 0.0, f64::MAX)
    }
}

/// Configuration of every modality plus shared settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub aruco: ArucoParams,
    pub reflective: ReflectiveParams,
    pub led: LedParams,
    /// Half-size of the window used for the median depth lookup.
    pub depth_window: usize,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            aruco: ArucoParams::default(),
            reflective: ReflectiveParams::default(),
            led: LedParams::default(),
            depth_window: 2,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorConfigError> {
        self.aruco.validate()?;
        self.reflective.validate()?;
        self.led.validate()
    }
}
