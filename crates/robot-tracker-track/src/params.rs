//! Filter, association and ROI configuration.

use std::time::Duration;

use robot_tracker_core::Modality;
use serde::{Deserialize, Serialize};

/// Invalid tracking configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrackConfigError {
    #[error("parameter `{name}` must be positive and finite, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("confirm_hits must be at least 1")]
    ZeroConfirmHits,
    #[error("miss_threshold must be at least 1")]
    ZeroMissThreshold,
    #[error("roi min_half_size {min} exceeds max_half_size {max}")]
    RoiBounds { min: f64, max: f64 },
    #[error("parameter `{name}` is not a representable duration: {value} s")]
    DurationOutOfRange { name: &'static str, value: f64 },
}

fn positive(name: &'static str, value: f64) -> Result<(), TrackConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TrackConfigError::NotPositive { name, value })
    }
}

fn seconds(name: &'static str, value: f64) -> Result<(), TrackConfigError> {
    positive(name, value)?;
    Duration::try_from_secs_f64(value)
        .map(|_| ())
        .map_err(|_| TrackConfigError::DurationOutOfRange { name, value })
}

fn saturating_secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// White-noise acceleration model for one kind of track frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionNoise {
    /// Linear acceleration σ (px/s² for image tracks, m/s² for rig tracks).
    pub accel_sigma: f64,
    /// Velocity σ assigned at track birth.
    pub initial_velocity_sigma: f64,
}

/// Measurement precision of one modality.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementNoise {
    /// Position σ of an image-frame measurement, px.
    pub pixel_sigma: f64,
    /// Position σ of a rig-frame measurement, m.
    pub metric_sigma: f64,
    /// In-plane orientation σ, rad. Only used when the detector reports one.
    pub orientation_sigma: f64,
}

/// Process and measurement noise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanParams {
    pub image_motion: MotionNoise,
    pub rig_motion: MotionNoise,
    /// Angular acceleration σ, rad/s².
    pub angular_accel_sigma: f64,
    pub initial_orientation_sigma: f64,
    pub initial_angular_rate_sigma: f64,
    pub aruco: MeasurementNoise,
    pub reflective: MeasurementNoise,
    pub led: MeasurementNoise,
}

impl Default for KalmanParams {
    fn default() -> Self {
        Self {
            image_motion: MotionNoise {
                accel_sigma: 1500.0,
                initial_velocity_sigma: 300.0,
            },
            rig_motion: MotionNoise {
                accel_sigma: 2.0,
                initial_velocity_sigma: 0.5,
            },
            angular_accel_sigma: 10.0,
            initial_orientation_sigma: std::f64::consts::PI,
            initial_angular_rate_sigma: 2.0,
            aruco: MeasurementNoise {
                pixel_sigma: 0.8,
                metric_sigma: 0.002,
                orientation_sigma: 0.03,
            },
            reflective: MeasurementNoise {
                pixel_sigma: 1.5,
                metric_sigma: 0.004,
                orientation_sigma: 0.5,
            },
            led: MeasurementNoise {
                pixel_sigma: 3.0,
                metric_sigma: 0.008,
                orientation_sigma: 0.5,
            },
        }
    }
}

impl KalmanParams {
    pub fn noise_for(&self, modality: Modality) -> &MeasurementNoise {
        match modality {
            Modality::ArucoMarker => &self.aruco,
            Modality::ReflectiveBlob => &self.reflective,
            Modality::Led => &self.led,
        }
    }

    pub fn validate(&self) -> Result<(), TrackConfigError> {
        positive("kalman.image_motion.accel_sigma", self.image_motion.accel_sigma)?;
        positive(
            "kalman.image_motion.initial_velocity_sigma",
            self.image_motion.initial_velocity_sigma,
        )?;
        positive("kalman.rig_motion.accel_sigma", self.rig_motion.accel_sigma)?;
        positive(
            "kalman.rig_motion.initial_velocity_sigma",
            self.rig_motion.initial_velocity_sigma,
        )?;
        positive("kalman.angular_accel_sigma", self.angular_accel_sigma)?;
        positive("kalman.initial_orientation_sigma", self.initial_orientation_sigma)?;
        positive(
            "kalman.initial_angular_rate_sigma",
            self.initial_angular_rate_sigma,
        )?;
        for m in Modality::ALL {
            let n = self.noise_for(m);
            positive("kalman.pixel_sigma", n.pixel_sigma)?;
            positive("kalman.metric_sigma", n.metric_sigma)?;
            positive("kalman.orientation_sigma", n.orientation_sigma)?;
        }
        Ok(())
    }
}

/// Track lifecycle and association.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackParams {
    pub kalman: KalmanParams,
    /// Consecutive associated cycles needed to confirm a track (birth included).
    pub confirm_hits: u32,
    /// Minimum confidence for an unmatched observation to seed a track.
    pub birth_confidence: f64,
    /// Euclidean association gate for image tracks, px.
    pub gate_radius_px: f64,
    /// Euclidean association gate for rig tracks, m.
    pub gate_radius_m: f64,
    /// Time without association after which a track becomes Lost, s.
    pub lost_timeout_s: f64,
    /// Time a Lost track is kept for re-acquisition, s.
    pub retention_window_s: f64,
    /// First id handed to tracks born without a target hint.
    pub auto_id_base: u32,
}

impl Default for TrackParams {
    fn default() -> Self {
        Self {
            kalman: KalmanParams::default(),
            confirm_hits: 3,
            birth_confidence: 0.5,
            gate_radius_px: 50.0,
            gate_radius_m: 0.1,
            lost_timeout_s: 0.5,
            retention_window_s: 2.0,
            auto_id_base: 1000,
        }
    }
}

impl TrackParams {
    pub fn lost_timeout(&self) -> Duration {
        saturating_secs(self.lost_timeout_s)
    }

    pub fn retention_window(&self) -> Duration {
        saturating_secs(self.retention_window_s)
    }

    pub fn validate(&self) -> Result<(), TrackConfigError> {
        self.kalman.validate()?;
        if self.confirm_hits == 0 {
            return Err(TrackConfigError::ZeroConfirmHits);
        }
        positive("track.gate_radius_px", self.gate_radius_px)?;
        positive("track.gate_radius_m", self.gate_radius_m)?;
        seconds("track.lost_timeout_s", self.lost_timeout_s)?;
        seconds("track.retention_window_s", self.retention_window_s)
    }
}

/// Search-window policy.
///
/// The half-size of a refreshed window is
/// `base_half_size_px + velocity_gain_s * speed_px_per_s`, clamped to
/// `[min_half_size_px, max_half_size_px]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiParams {
    pub base_half_size_px: f64,
    /// Seconds of predicted motion added to the margin.
    pub velocity_gain_s: f64,
    pub min_half_size_px: f64,
    pub max_half_size_px: f64,
    /// Consecutive misses after which a window is dropped.
    pub miss_threshold: u32,
    /// A window not refreshed for this long is dropped, s.
    pub ttl_s: f64,
    /// Every n-th cycle searches the whole frame regardless of windows.
    pub full_frame_interval: u32,
}

impl Default for RoiParams {
    fn default() -> Self {
        Self {
            base_half_size_px: 40.0,
            velocity_gain_s: 0.1,
            min_half_size_px: 24.0,
            max_half_size_px: 200.0,
            miss_threshold: 3,
            ttl_s: 0.5,
            full_frame_interval: 15,
        }
    }
}

impl RoiParams {
    pub fn ttl(&self) -> Duration {
        saturating_secs(self.ttl_s)
    }

    pub fn half_size(&self, speed_px_per_s: f64) -> f64 {
        let speed = if speed_px_per_s.is_finite() {
            speed_px_per_s.abs()
        } else {
            0.0
        };
        (self.base_half_size_px + self.velocity_gain_s * speed)
            .clamp(self.min_half_size_px, self.max_half_size_px)
    }

    pub fn validate(&self) -> Result<(), TrackConfigError> {
        positive("roi.base_half_size_px", self.base_half_size_px)?;
        positive("roi.min_half_size_px", self.min_half_size_px)?;
        seconds("roi.ttl_s", self.ttl_s)?;
        if self.min_half_size_px > self.max_half_size_px {
            return Err(TrackConfigError::RoiBounds {
                min: self.min_half_size_px,
                max: self.max_half_size_px,
            });
        }
        if self.miss_threshold == 0 {
            return Err(TrackConfigError::ZeroMissThreshold);
        }
        if !(self.velocity_gain_s.is_finite() && self.velocity_gain_s >= 0.0) {
            return Err(TrackConfigError::NotPositive {
                name: "roi.velocity_gain_s",
                value: self.velocity_gain_s,
            });
        }
        Ok(())
    }
}
