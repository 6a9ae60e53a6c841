//! Constant-velocity Kalman filter over position and in-plane orientation.
//!
//! State: `[x, y, z, vx, vy, vz, θ, ω]`.
//!
//! Image-frame tracks use two spatial axes (pixels); `z` and `vz` then keep
//! zero variance and are never observed. Rig-frame tracks use all three axes
//! (metres).
//!
//! Prediction uses the discrete white-noise acceleration model per axis:
//!
//! ```text
//!        ┌ dt⁴/4  dt³/2 ┐
//! Q = σ² │              │
//!        └ dt³/2  dt²   ┘
//! ```
//!
//! Measurements are applied as independent scalar updates in Joseph form, so
//! several sources observed in one cycle simply chain.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use robot_tracker_core::Vec3;

use crate::{KalmanParams, MeasurementNoise, MotionNoise};

pub type StateVector = SVector<f64, 8>;
pub type StateCovariance = SMatrix<f64, 8, 8>;

const THETA: usize = 6;
const OMEGA: usize = 7;

/// Wrap an angle to `(-π, π]`.
pub fn wrap_angle(a: f64) -> f64 {
    use std::f64::consts::PI;
    let w = (a + PI).rem_euclid(2.0 * PI) - PI;
    if w <= -PI {
        w + 2.0 * PI
    } else {
        w
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KalmanState {
    x: StateVector,
    p: StateCovariance,
    dims: usize,
    accel_var: f64,
    angular_accel_var: f64,
}

impl KalmanState {
    /// Initialise from a first measurement. Velocity starts at zero with the
    /// configured birth uncertainty.
    pub fn new(
        position: Vec3,
        orientation: Option<f64>,
        dims: usize,
        motion: &MotionNoise,
        params: &KalmanParams,
        noise: &MeasurementNoise,
    ) -> Self {
        let dims = dims.clamp(2, 3);
        let pos_var = if dims == 2 {
            noise.pixel_sigma.powi(2)
        } else {
            noise.metric_sigma.powi(2)
        };
        let mut x = StateVector::zeros();
        let mut p = StateCovariance::zeros();
        for i in 0..dims {
            x[i] = position[i];
            p[(i, i)] = pos_var;
            p[(i + 3, i + 3)] = motion.initial_velocity_sigma.powi(2);
        }
        match orientation {
            Some(theta) => {
                x[THETA] = wrap_angle(theta);
                p[(THETA, THETA)] = noise.orientation_sigma.powi(2);
            }
            None => p[(THETA, THETA)] = params.initial_orientation_sigma.powi(2),
        }
        p[(OMEGA, OMEGA)] = params.initial_angular_rate_sigma.powi(2);
        Self {
            x,
            p,
            dims,
            accel_var: motion.accel_sigma.powi(2),
            angular_accel_var: params.angular_accel_sigma.powi(2),
        }
    }

    /// Number of spatial axes carried by this filter (2 or 3).
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn state(&self) -> &StateVector {
        &self.x
    }

    pub fn covariance(&self) -> &StateCovariance {
        &self.p
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x[0], self.x[1], self.x[2])
    }

    pub fn velocity(&self) -> Vec3 {
        Vec3::new(self.x[3], self.x[4], self.x[5])
    }

    pub fn speed(&self) -> f64 {
        self.velocity().norm()
    }

    pub fn orientation(&self) -> f64 {
        self.x[THETA]
    }

    pub fn angular_rate(&self) -> f64 {
        self.x[OMEGA]
    }

    pub fn covariance_trace(&self) -> f64 {
        self.p.trace()
    }

    /// Sum of position variances over the carried axes.
    pub fn position_variance(&self) -> f64 {
        (0..self.dims).map(|i| self.p[(i, i)]).sum()
    }

    /// Propagate by `dt_secs`. Non-positive steps are ignored.
    pub fn predict(&mut self, dt_secs: f64) {
        if !(dt_secs > 0.0 && dt_secs.is_finite()) {
            return;
        }
        let mut f = StateCovariance::identity();
        for i in 0..3 {
            f[(i, i + 3)] = dt_secs;
        }
        f[(THETA, OMEGA)] = dt_secs;

        self.x = f * self.x;
        self.x[THETA] = wrap_angle(self.x[THETA]);
        self.p = f * self.p * f.transpose() + self.process_noise(dt_secs);
        self.symmetrize();
    }

    fn process_noise(&self, dt: f64) -> StateCovariance {
        let (dt2, dt3, dt4) = (dt * dt, dt * dt * dt, dt * dt * dt * dt);
        let mut q = StateCovariance::zeros();
        let mut block = |pos: usize, vel: usize, var: f64| {
            q[(pos, pos)] = 0.25 * dt4 * var;
            q[(pos, vel)] = 0.5 * dt3 * var;
            q[(vel, pos)] = 0.5 * dt3 * var;
            q[(vel, vel)] = dt2 * var;
        };
        for i in 0..self.dims {
            block(i, i + 3, self.accel_var);
        }
        block(THETA, OMEGA, self.angular_accel_var);
        q
    }

    /// Apply one position (and optional orientation) measurement.
    ///
    /// Returns `false` if any scalar update was skipped because its
    /// innovation variance was not positive.
    pub fn update(
        &mut self,
        position: &Vec3,
        orientation: Option<f64>,
        noise: &MeasurementNoise,
    ) -> bool {
        let r = self.position_noise_var(noise);
        let mut ok = true;
        for i in 0..self.dims {
            let innovation = position[i] - self.x[i];
            ok &= self.update_scalar(i, innovation, r);
        }
        if let Some(theta) = orientation {
            let innovation = wrap_angle(theta - self.x[THETA]);
            ok &= self.update_scalar(THETA, innovation, noise.orientation_sigma.powi(2));
            self.x[THETA] = wrap_angle(self.x[THETA]);
        }
        ok
    }

    /// Joseph-form update of a single directly observed state component.
    fn update_scalar(&mut self, idx: usize, innovation: f64, r: f64) -> bool {
        let ph: StateVector = self.p.column(idx).into_owned();
        let s = ph[idx] + r;
        if !(s > 0.0 && s.is_finite()) {
            return false;
        }
        let k = ph / s;
        self.x += k * innovation;

        let mut a = StateCovariance::identity();
        a.set_column(idx, &(StateVector::ith(idx, 1.0) - k));
        self.p = a * self.p * a.transpose() + k * k.transpose() * r;
        self.symmetrize();
        true
    }

    /// Squared Mahalanobis distance of a position measurement to the
    /// predicted position, using the carried axes only.
    pub fn mahalanobis_sq(&self, position: &Vec3, noise: &MeasurementNoise) -> f64 {
        let r = self.position_noise_var(noise);
        let mut s = Matrix3::identity();
        let mut y = Vector3::zeros();
        for i in 0..self.dims {
            y[i] = position[i] - self.x[i];
            for j in 0..self.dims {
                s[(i, j)] = self.p[(i, j)];
            }
            s[(i, i)] += r;
        }
        match s.try_inverse() {
            Some(s_inv) => (y.transpose() * s_inv * y)[(0, 0)],
            None => f64::INFINITY,
        }
    }

    /// Euclidean distance between a measurement and the predicted position.
    pub fn distance(&self, position: &Vec3) -> f64 {
        (0..self.dims)
            .map(|i| (position[i] - self.x[i]).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn position_noise_var(&self, noise: &MeasurementNoise) -> f64 {
        if self.dims == 2 {
            noise.pixel_sigma.powi(2)
        } else {
            noise.metric_sigma.powi(2)
        }
    }

    fn symmetrize(&mut self) {
        self.p = 0.5 * (self.p + self.p.transpose());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn image_state() -> (KalmanState, KalmanParams) {
        let params = KalmanParams::default();
        let s = KalmanState::new(
            Vec3::new(100.0, 50.0, 0.0),
            None,
            2,
            &params.image_motion,
            &params,
            &params.aruco,
        );
        (s, params)
    }

    fn min_eigenvalue(p: &StateCovariance) -> f64 {
        p.symmetric_eigenvalues().min()
    }

    #[test]
    fn wrap_angle_range() {
        use std::f64::consts::PI;
        assert_relative_eq!(wrap_angle(3.0 * PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(-PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_angle(0.5), 0.5);
        assert_relative_eq!(wrap_angle(-0.5 - 2.0 * PI), -0.5, epsilon = 1e-12);
    }

    #[test]
    fn prediction_moves_with_velocity_and_inflates_covariance() {
        let (mut s, params) = image_state();
        s.update(&Vec3::new(110.0, 50.0, 0.0), None, &params.aruco);
        let before = s.covariance_trace();
        s.predict(0.1);
        assert!(s.covariance_trace() >= before);
        s.predict(0.0);
        s.predict(-1.0);
        assert_relative_eq!(s.position()[2], 0.0);
        assert_eq!(s.covariance()[(2, 2)], 0.0);
    }

    #[test]
    fn update_shrinks_trace_and_keeps_psd() {
        let (mut s, params) = image_state();
        for k in 1..20 {
            s.predict(0.033);
            let before = s.covariance_trace();
            let z = Vec3::new(100.0 + 3.0 * k as f64, 50.0 - k as f64, 0.0);
            assert!(s.update(&z, Some(0.2), &params.aruco));
            assert!(s.covariance_trace() <= before + 1e-9);
            assert!(min_eigenvalue(s.covariance()) > -1e-9);
        }
        // 3 px / 33 ms ≈ 91 px/s
        assert_relative_eq!(s.velocity()[0], 3.0 / 0.033, epsilon = 10.0);
        assert!(s.velocity()[1] < 0.0);
        assert_relative_eq!(s.orientation(), 0.2, epsilon = 0.02);
    }

    #[test]
    fn orientation_innovation_wraps() {
        let (mut s, params) = image_state();
        s.update(&Vec3::new(100.0, 50.0, 0.0), Some(3.1), &params.aruco);
        s.update(&Vec3::new(100.0, 50.0, 0.0), Some(-3.1), &params.aruco);
        assert!(s.orientation().abs() > 3.0, "{}", s.orientation());
    }

    #[test]
    fn mahalanobis_prefers_certain_axis() {
        let (s, params) = image_state();
        let near = s.mahalanobis_sq(&Vec3::new(101.0, 50.0, 0.0), &params.aruco);
        let far = s.mahalanobis_sq(&Vec3::new(110.0, 50.0, 0.0), &params.aruco);
        assert!(near < far);
        assert_relative_eq!(s.distance(&Vec3::new(103.0, 54.0, 7.0)), 5.0);
    }

    #[test]
    fn rig_filter_uses_three_axes() {
        let params = KalmanParams::default();
        let mut s = KalmanState::new(
            Vec3::new(0.1, 0.2, 1.0),
            None,
            3,
            &params.rig_motion,
            &params,
            &params.reflective,
        );
        s.predict(0.05);
        s.update(&Vec3::new(0.1, 0.2, 1.01), None, &params.reflective);
        assert!(s.position()[2] > 1.0);
        assert_eq!(s.dims(), 3);
        assert!(s.position_variance() < 3.0 * 0.004f64.powi(2));
    }
}
