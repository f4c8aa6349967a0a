//! Constant-velocity Kalman filter over pose and velocity.
//!
//! The 12-dimensional state is `(rx, ry, rz, tx, ty, tz, ωx, ωy, ωz,
//! vx, vy, vz)`. Prediction integrates pose by velocity over Δt with
//! process noise derived from the configured maximum accelerations;
//! correction fuses a 6-DoF pose measurement, optionally extended with a
//! linear-velocity hint from an external source.

use nalgebra::{SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::math::normalize_angle;
use crate::core::types::Pose6D;

type State = SVector<f64, 12>;
type StateCov = SMatrix<f64, 12, 12>;

/// Operating mode of the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    /// Pose measurements only.
    MotionModel,
    /// Pose measurements plus an external linear-velocity hint.
    MotionModelWithVelocity,
}

/// Noise tuning for the motion filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionFilterConfig {
    /// Largest expected linear acceleration, m/s².
    pub max_velocity_accel: f64,

    /// Largest expected angular acceleration, rad/s².
    pub max_angle_accel: f64,

    /// Variance of the pose measurement, applied per component.
    pub measurement_variance: f64,

    /// Variance of the external velocity hint, per component.
    pub velocity_measurement_variance: f64,

    /// Initial pose variance per component.
    pub initial_pose_variance: f64,

    /// Initial velocity variance per component.
    pub initial_velocity_variance: f64,
}

impl Default for MotionFilterConfig {
    fn default() -> Self {
        Self {
            max_velocity_accel: 5.0,
            max_angle_accel: 1.0,
            measurement_variance: 1e-4,
            velocity_measurement_variance: 1e-2,
            initial_pose_variance: 1e-6,
            initial_velocity_variance: 1.0,
        }
    }
}

/// 12-state constant-velocity pose filter.
#[derive(Debug, Clone)]
pub struct MotionFilter {
    config: MotionFilterConfig,
    mode: FilterMode,
    state: State,
    covariance: StateCov,
    previous_time: Option<f64>,
    n_measures: usize,
}

impl MotionFilter {
    pub fn new(config: MotionFilterConfig, mode: FilterMode) -> Self {
        let mut covariance = StateCov::zeros();
        for i in 0..6 {
            covariance[(i, i)] = config.initial_pose_variance;
            covariance[(i + 6, i + 6)] = config.initial_velocity_variance;
        }
        Self {
            config,
            mode,
            state: State::zeros(),
            covariance,
            previous_time: None,
            n_measures: 0,
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Number of measurements fused so far.
    pub fn measure_count(&self) -> usize {
        self.n_measures
    }

    /// Full state vector.
    pub fn state(&self) -> State {
        self.state
    }

    /// Pose part of the state.
    pub fn pose(&self) -> Pose6D {
        Pose6D::new(
            self.state[0],
            self.state[1],
            self.state[2],
            self.state[3],
            self.state[4],
            self.state[5],
        )
    }

    /// Linear velocity part of the state, m/s.
    pub fn linear_velocity(&self) -> Vector3<f64> {
        Vector3::new(self.state[9], self.state[10], self.state[11])
    }

    /// Reinitialize state and covariance, dropping time history.
    pub fn reset(&mut self, state: State, covariance: StateCov) {
        self.state = state;
        self.covariance = covariance;
        self.previous_time = None;
        self.n_measures = 0;
    }

    /// Integrate the state to time `t` (seconds).
    ///
    /// The first call only latches the time base.
    pub fn predict(&mut self, t: f64) {
        let dt = match self.previous_time {
            Some(prev) if t > prev => t - prev,
            _ => {
                self.previous_time = Some(t);
                return;
            }
        };
        self.previous_time = Some(t);

        // F = I with the pose block coupled to velocity by dt.
        let mut transition = StateCov::identity();
        for i in 0..6 {
            transition[(i, i + 6)] = dt;
        }

        self.state = transition * self.state;
        for i in 0..3 {
            self.state[i] = normalize_angle(self.state[i]);
        }

        // Process noise from the maximum accelerations: a burst of
        // acceleration `a` over dt moves the pose by a·dt²/2 and the
        // velocity by a·dt.
        let pose_angle_sd = 0.5 * self.config.max_angle_accel * dt * dt;
        let pose_trans_sd = 0.5 * self.config.max_velocity_accel * dt * dt;
        let vel_angle_sd = self.config.max_angle_accel * dt;
        let vel_trans_sd = self.config.max_velocity_accel * dt;

        let mut process_noise = StateCov::zeros();
        for i in 0..3 {
            process_noise[(i, i)] = pose_angle_sd * pose_angle_sd;
            process_noise[(i + 3, i + 3)] = pose_trans_sd * pose_trans_sd;
            process_noise[(i + 6, i + 6)] = vel_angle_sd * vel_angle_sd;
            process_noise[(i + 9, i + 9)] = vel_trans_sd * vel_trans_sd;
        }

        self.covariance = transition * self.covariance * transition.transpose() + process_noise;
    }

    /// Fuse a 6-DoF pose measurement.
    pub fn correct(&mut self, measurement: &Pose6D) {
        let mut h = SMatrix::<f64, 6, 12>::zeros();
        for i in 0..6 {
            h[(i, i)] = 1.0;
        }

        let z = measurement.as_vector();
        let mut innovation = z - h * self.state;
        for i in 0..3 {
            innovation[i] = normalize_angle(innovation[i]);
        }

        let r = SMatrix::<f64, 6, 6>::identity() * self.config.measurement_variance;
        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };

        let gain = self.covariance * h.transpose() * s_inv;
        self.state += gain * innovation;
        for i in 0..3 {
            self.state[i] = normalize_angle(self.state[i]);
        }
        self.covariance = (StateCov::identity() - gain * h) * self.covariance;
        self.n_measures += 1;
    }

    /// Fuse a pose measurement plus an external linear-velocity hint
    /// (mode 1).
    pub fn correct_with_velocity(&mut self, measurement: &Pose6D, velocity: &Vector3<f64>) {
        let mut h = SMatrix::<f64, 9, 12>::zeros();
        for i in 0..6 {
            h[(i, i)] = 1.0;
        }
        for i in 0..3 {
            h[(6 + i, 9 + i)] = 1.0;
        }

        let mut z = SVector::<f64, 9>::zeros();
        z.fixed_rows_mut::<6>(0).copy_from(&measurement.as_vector());
        z.fixed_rows_mut::<3>(6).copy_from(velocity);

        let mut innovation = z - h * self.state;
        for i in 0..3 {
            innovation[i] = normalize_angle(innovation[i]);
        }

        let mut r = SMatrix::<f64, 9, 9>::zeros();
        for i in 0..6 {
            r[(i, i)] = self.config.measurement_variance;
        }
        for i in 6..9 {
            r[(i, i)] = self.config.velocity_measurement_variance;
        }

        let s = h * self.covariance * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };

        let gain = self.covariance * h.transpose() * s_inv;
        self.state += gain * innovation;
        for i in 0..3 {
            self.state[i] = normalize_angle(self.state[i]);
        }
        self.covariance = (StateCov::identity() - gain * h) * self.covariance;
        self.n_measures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filter() -> MotionFilter {
        MotionFilter::new(MotionFilterConfig::default(), FilterMode::MotionModel)
    }

    #[test]
    fn test_first_predict_latches_time() {
        let mut kf = filter();
        kf.predict(10.0);
        assert_relative_eq!(kf.state().norm(), 0.0);
    }

    #[test]
    fn test_tracks_constant_velocity() {
        let mut kf = filter();
        // Sensor moving at 1 m/s along x, one pose measurement per 0.1 s.
        for step in 0..50 {
            let t = step as f64 * 0.1;
            kf.predict(t);
            kf.correct(&Pose6D::new(0.0, 0.0, 0.0, t * 1.0, 0.0, 0.0));
        }

        // Velocity estimate converges to 1 m/s.
        assert_relative_eq!(kf.linear_velocity().x, 1.0, epsilon = 0.05);

        // Prediction continues the track without a measurement.
        kf.predict(5.1);
        assert_relative_eq!(kf.pose().tx, 5.1, epsilon = 0.05);
    }

    #[test]
    fn test_correct_pulls_state_toward_measurement() {
        let mut kf = filter();
        kf.predict(0.0);
        // A second of unobserved motion inflates the pose uncertainty, so
        // the measurement dominates the update.
        kf.predict(1.0);
        kf.correct(&Pose6D::new(0.0, 0.0, 0.1, 1.0, 0.0, 0.0));
        assert!(kf.pose().tx > 0.9);
        assert!(kf.pose().rz > 0.09);
        assert_eq!(kf.measure_count(), 1);
    }

    #[test]
    fn test_angle_innovation_wraps() {
        let mut kf = filter();
        let mut state = SVector::<f64, 12>::zeros();
        state[2] = std::f64::consts::PI - 0.05;
        let mut cov = SMatrix::<f64, 12, 12>::identity() * 1e-2;
        for i in 6..12 {
            cov[(i, i)] = 1.0;
        }
        kf.reset(state, cov);

        // Measurement just across the ±π seam.
        kf.correct(&Pose6D::new(0.0, 0.0, -std::f64::consts::PI + 0.05, 0.0, 0.0, 0.0));

        // The state moved the short way around, not through zero.
        assert!(kf.pose().rz.abs() > std::f64::consts::PI - 0.06);
    }

    #[test]
    fn test_velocity_hint_updates_velocity() {
        let mut kf = MotionFilter::new(
            MotionFilterConfig::default(),
            FilterMode::MotionModelWithVelocity,
        );
        kf.predict(0.0);
        kf.correct_with_velocity(&Pose6D::identity(), &Vector3::new(2.0, 0.0, 0.0));
        assert!(kf.linear_velocity().x > 1.0);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut kf = filter();
        kf.predict(0.0);
        kf.correct(&Pose6D::new(0.0, 0.0, 0.0, 1.0, 0.0, 0.0));
        kf.reset(SVector::zeros(), SMatrix::identity());
        assert_eq!(kf.measure_count(), 0);
        assert_relative_eq!(kf.state().norm(), 0.0);
    }

    #[test]
    fn test_covariance_grows_on_predict() {
        let mut kf = filter();
        kf.predict(0.0);
        let before = kf.covariance[(3, 3)];
        kf.predict(1.0);
        assert!(kf.covariance[(3, 3)] > before);
    }
}
