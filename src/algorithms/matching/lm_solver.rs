//! Levenberg–Marquardt minimization of point-to-primitive residuals.
//!
//! Minimizes `F(θ) = Σ wᵢ·rᵢᵀAᵢrᵢ` with `rᵢ = R(sᵢ·θ_rot)·Xᵢ + sᵢ·t − Pᵢ`
//! over `θ = (rx, ry, rz, tx, ty, tz)`. The normal equations are built
//! with analytic ZYX-Euler rotation derivatives; the damped system
//! `(H + λ·diag(H))Δ = −g` is solved by Cholesky factorization. Accepted
//! steps shrink λ, rejected steps grow it. Correspondences are refreshed
//! through the provider on the first iteration and every `icp_frequency`
//! iterations after that; in between, the problem is a fixed non-linear
//! least squares.

use log::debug;
use nalgebra::{Matrix3x6, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::core::math;
use crate::core::types::Pose6D;

use super::{CorrespondenceProvider, PointResidual, ResidualSet};

/// Pose parameters has 6 degrees of freedom; fewer residuals than that
/// cannot constrain a step.
const MIN_RESIDUALS: usize = 6;

/// Damping bounds: below the floor the step is effectively Gauss-Newton,
/// above the ceiling the solver is stuck.
const LAMBDA_MIN: f64 = 1e-7;
const LAMBDA_MAX: f64 = 1e7;

/// Tuning for one optimization pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    /// Maximum LM iterations.
    pub max_iter: usize,

    /// Re-run matching every this many iterations (1 = every iteration).
    pub icp_frequency: usize,

    /// Initial damping value.
    pub lambda_0: f64,

    /// Multiplicative damping update on accept / reject.
    pub lambda_ratio: f64,

    /// Stop when the accepted step norm falls below this.
    pub step_tolerance: f64,

    /// Stop when the relative cost decrease of an accepted step falls
    /// below this.
    pub cost_tolerance: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iter: 25,
            icp_frequency: 5,
            lambda_0: 1e-3,
            lambda_ratio: 10.0,
            step_tolerance: 1e-8,
            cost_tolerance: 1e-9,
        }
    }
}

/// How the optimization ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmStatus {
    /// Step and cost tolerances reached.
    Converged,
    /// Iteration budget exhausted with at least one accepted step.
    MaxIterations,
    /// No step was ever accepted; the initial pose is returned.
    Diverged,
    /// Matching produced fewer residuals than the problem's degrees of
    /// freedom.
    NotEnoughMatches,
}

/// Result of one optimization pass.
#[derive(Debug, Clone, Copy)]
pub struct LmOutcome {
    /// Best pose encountered.
    pub pose: Pose6D,
    /// Cost at that pose, under the last correspondence set.
    pub cost: f64,
    /// Iterations actually run.
    pub iterations: usize,
    /// Residual count of the last matching pass.
    pub matches: usize,
    pub status: LmStatus,
}

impl LmOutcome {
    /// Whether the pose can be trusted at all.
    pub fn usable(&self) -> bool {
        matches!(self.status, LmStatus::Converged | LmStatus::MaxIterations)
    }
}

/// Levenberg–Marquardt solver.
#[derive(Debug, Clone)]
pub struct LmSolver {
    config: LmConfig,
}

impl LmSolver {
    pub fn new(config: LmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    /// Minimize the matching cost starting from `initial`.
    ///
    /// Always returns the best pose seen, even on non-convergence.
    pub fn minimize(
        &self,
        provider: &dyn CorrespondenceProvider,
        initial: Pose6D,
    ) -> LmOutcome {
        let mut residuals = ResidualSet::default();
        let mut pose = initial;
        let mut lambda = self.config.lambda_0;

        provider.collect(&pose, &mut residuals);
        if residuals.len() < MIN_RESIDUALS {
            return LmOutcome {
                pose: initial,
                cost: f64::INFINITY,
                iterations: 0,
                matches: residuals.len(),
                status: LmStatus::NotEnoughMatches,
            };
        }

        let mut cost = total_cost(&residuals, &pose);
        let mut best_pose = pose;
        let mut best_cost = cost;
        let mut accepted_any = false;
        let mut iterations = 0;
        let mut status = LmStatus::MaxIterations;

        for iter in 0..self.config.max_iter {
            iterations = iter + 1;

            if iter > 0 && iter % self.config.icp_frequency.max(1) == 0 {
                provider.collect(&pose, &mut residuals);
                if residuals.len() < MIN_RESIDUALS {
                    debug!("matching collapsed to {} residuals, stopping", residuals.len());
                    break;
                }
                cost = total_cost(&residuals, &pose);
                if cost < best_cost {
                    best_cost = cost;
                    best_pose = pose;
                }
            }

            let (hessian, gradient) = normal_equations(&residuals, &pose);

            let step = match solve_damped(&hessian, &gradient, lambda) {
                Some(step) => step,
                None => {
                    // Singular even with damping: grow λ and try again.
                    lambda = (lambda * self.config.lambda_ratio).min(LAMBDA_MAX);
                    continue;
                }
            };

            // Already at a stationary point: nothing left to gain.
            if step.norm() < self.config.step_tolerance {
                status = LmStatus::Converged;
                break;
            }

            let candidate = Pose6D::from_vector(&(pose.as_vector() + step));
            let candidate_cost = total_cost(&residuals, &candidate);

            if candidate_cost < cost {
                let relative_decrease = (cost - candidate_cost) / cost.max(f64::MIN_POSITIVE);

                pose = candidate;
                cost = candidate_cost;
                lambda = (lambda / self.config.lambda_ratio).max(LAMBDA_MIN);
                accepted_any = true;

                if cost < best_cost {
                    best_cost = cost;
                    best_pose = pose;
                }

                if step.norm() < self.config.step_tolerance
                    || relative_decrease < self.config.cost_tolerance
                {
                    status = LmStatus::Converged;
                    break;
                }
            } else {
                lambda = (lambda * self.config.lambda_ratio).min(LAMBDA_MAX);
            }
        }

        if !accepted_any && status != LmStatus::Converged {
            status = LmStatus::Diverged;
        }

        debug!(
            "lm finished: status={status:?} iterations={iterations} matches={} cost={best_cost:.3e}",
            residuals.len()
        );

        LmOutcome {
            pose: best_pose,
            cost: best_cost,
            iterations,
            matches: residuals.len(),
            status,
        }
    }
}

/// Residual vector of one correspondence at the given pose.
#[inline]
fn residual_vector(item: &PointResidual, pose: &Pose6D) -> Vector3<f64> {
    let interpolated = pose.scaled(item.time_ratio);
    interpolated.transform_point(&item.current) - item.reference
}

/// Total weighted cost `Σ wᵢ·rᵢᵀAᵢrᵢ`.
fn total_cost(residuals: &ResidualSet, pose: &Pose6D) -> f64 {
    residuals
        .items
        .iter()
        .map(|item| {
            let r = residual_vector(item, pose);
            item.weight * (r.transpose() * item.metric * r)[(0, 0)]
        })
        .sum()
}

/// Accumulate the Gauss-Newton normal equations `H = Σ w·JᵀAJ`,
/// `g = Σ w·JᵀA·r`.
fn normal_equations(residuals: &ResidualSet, pose: &Pose6D) -> (Matrix6<f64>, Vector6<f64>) {
    let mut hessian = Matrix6::zeros();
    let mut gradient = Vector6::zeros();

    for item in &residuals.items {
        let s = item.time_ratio;
        let (rx, ry, rz) = (pose.rx * s, pose.ry * s, pose.rz * s);

        // Chain rule: the pose enters through s·θ, so every derivative
        // carries a factor s.
        let d_rx = math::rotation_derivative_rx(rx, ry, rz) * s;
        let d_ry = math::rotation_derivative_ry(rx, ry, rz) * s;
        let d_rz = math::rotation_derivative_rz(rx, ry, rz) * s;

        let mut jacobian = Matrix3x6::zeros();
        jacobian.fixed_view_mut::<3, 1>(0, 0).copy_from(&(d_rx * item.current));
        jacobian.fixed_view_mut::<3, 1>(0, 1).copy_from(&(d_ry * item.current));
        jacobian.fixed_view_mut::<3, 1>(0, 2).copy_from(&(d_rz * item.current));
        jacobian[(0, 3)] = s;
        jacobian[(1, 4)] = s;
        jacobian[(2, 5)] = s;

        let r = residual_vector(item, pose);
        let weighted = jacobian.transpose() * item.metric * item.weight;
        hessian += weighted * jacobian;
        gradient += weighted * r;
    }

    (hessian, gradient)
}

/// Solve `(H + λ·diag(H))Δ = −g`; `None` when the damped system is not
/// positive definite.
fn solve_damped(
    hessian: &Matrix6<f64>,
    gradient: &Vector6<f64>,
    lambda: f64,
) -> Option<Vector6<f64>> {
    // Floor relative to the problem scale: directions the residuals do
    // not constrain (degenerate geometry) must stay damped, or rounding
    // noise in the gradient blows up along them.
    let floor = hessian.trace().abs().max(1.0) * 1e-9;

    let mut damped = *hessian;
    for i in 0..6 {
        damped[(i, i)] += lambda * hessian[(i, i)].max(floor);
    }

    damped.cholesky().map(|chol| chol.solve(&(-gradient)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Pose6D;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    /// Provider that always reports the same correspondences.
    struct FixedResiduals(Vec<PointResidual>);

    impl CorrespondenceProvider for FixedResiduals {
        fn collect(&self, _pose: &Pose6D, residuals: &mut ResidualSet) {
            residuals.clear();
            for item in &self.0 {
                residuals.push_plane(*item);
            }
        }
    }

    /// Plane residuals sampled from three orthogonal planes, consistent
    /// with `truth` being the aligning transform.
    fn orthogonal_plane_residuals(truth: &Pose6D) -> Vec<PointResidual> {
        let normals = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let inverse = truth.inverse();
        let mut residuals = Vec::new();

        for (axis, normal) in normals.iter().enumerate() {
            for i in 0..8 {
                // Reference points on the plane through 5·normal, spread
                // in the in-plane directions.
                let u = normals[(axis + 1) % 3];
                let v = normals[(axis + 2) % 3];
                let on_plane =
                    normal * 5.0 + u * (0.3 * i as f64 - 1.0) + v * (0.17 * i as f64 - 0.5);
                residuals.push(PointResidual {
                    metric: normal * normal.transpose(),
                    current: inverse.transform_point(&on_plane),
                    reference: on_plane + u * 0.05 - v * 0.02,
                    time_ratio: 1.0,
                    weight: 1.0,
                });
            }
        }
        residuals
    }

    fn line_residuals(truth: &Pose6D) -> Vec<PointResidual> {
        let directions = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let anchors = [
            Vector3::new(0.0, 2.0, 1.0),
            Vector3::new(3.0, 0.0, -1.0),
            Vector3::new(-2.0, 1.0, 0.0),
        ];
        let inverse = truth.inverse();
        let mut residuals = Vec::new();

        for (direction, anchor) in directions.iter().zip(&anchors) {
            let projector = Matrix3::identity() - direction * direction.transpose();
            let metric = projector.transpose() * projector;
            for i in 0..6 {
                let on_line = anchor + direction * (0.4 * i as f64);
                residuals.push(PointResidual {
                    metric,
                    current: inverse.transform_point(&on_line),
                    // Reference shifted along the line: irrelevant to the
                    // point-to-line distance.
                    reference: on_line + direction * 0.3,
                    time_ratio: 1.0,
                    weight: 1.0,
                });
            }
        }
        residuals
    }

    fn assert_pose_close(a: &Pose6D, b: &Pose6D, epsilon: f64) {
        assert_relative_eq!(a.as_vector(), b.as_vector(), epsilon = epsilon);
    }

    #[test]
    fn test_recovers_translation_from_planes() {
        let truth = Pose6D::new(0.0, 0.0, 0.0, 0.3, -0.2, 0.1);
        let provider = FixedResiduals(orthogonal_plane_residuals(&truth));
        let solver = LmSolver::new(LmConfig::default());

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert!(outcome.usable());
        assert_pose_close(&outcome.pose, &truth, 1e-6);
    }

    #[test]
    fn test_recovers_rotation_from_planes() {
        let truth = Pose6D::new(0.02, -0.03, 0.05, 0.1, 0.0, -0.1);
        let provider = FixedResiduals(orthogonal_plane_residuals(&truth));
        let solver = LmSolver::new(LmConfig::default());

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert!(outcome.usable());
        assert_pose_close(&outcome.pose, &truth, 1e-5);
    }

    #[test]
    fn test_recovers_pose_from_lines() {
        let truth = Pose6D::new(0.01, 0.02, -0.04, 0.2, 0.1, -0.15);
        let provider = FixedResiduals(line_residuals(&truth));
        let solver = LmSolver::new(LmConfig {
            max_iter: 50,
            ..LmConfig::default()
        });

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert!(outcome.usable());
        assert_pose_close(&outcome.pose, &truth, 1e-5);
    }

    #[test]
    fn test_not_enough_matches() {
        let truth = Pose6D::new(0.0, 0.0, 0.0, 0.1, 0.0, 0.0);
        let few = orthogonal_plane_residuals(&truth).into_iter().take(4).collect();
        let provider = FixedResiduals(few);
        let solver = LmSolver::new(LmConfig::default());

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert_eq!(outcome.status, LmStatus::NotEnoughMatches);
        assert_pose_close(&outcome.pose, &Pose6D::identity(), 1e-15);
    }

    #[test]
    fn test_cost_not_worse_than_initial() {
        let truth = Pose6D::new(0.02, 0.01, 0.03, 0.2, -0.1, 0.05);
        let items = orthogonal_plane_residuals(&truth);
        let provider = FixedResiduals(items.clone());
        let solver = LmSolver::new(LmConfig::default());

        let mut set = ResidualSet::default();
        provider.collect(&Pose6D::identity(), &mut set);
        let initial_cost = total_cost(&set, &Pose6D::identity());

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert!(outcome.cost <= initial_cost);
    }

    #[test]
    fn test_already_converged_input() {
        let truth = Pose6D::new(0.0, 0.0, 0.0, 0.25, 0.0, 0.0);
        let provider = FixedResiduals(orthogonal_plane_residuals(&truth));
        let solver = LmSolver::new(LmConfig::default());

        let outcome = solver.minimize(&provider, truth);
        assert!(outcome.usable());
        assert_pose_close(&outcome.pose, &truth, 1e-9);
    }

    #[test]
    fn test_time_scaled_residuals() {
        // All residuals at half sweep time: the recovered full-sweep
        // transform is twice the apparent one.
        let apparent = Pose6D::new(0.0, 0.0, 0.0, 0.1, 0.05, 0.0);
        let mut items = orthogonal_plane_residuals(&apparent);
        for item in &mut items {
            item.time_ratio = 0.5;
        }
        let provider = FixedResiduals(items);
        let solver = LmSolver::new(LmConfig {
            max_iter: 60,
            ..LmConfig::default()
        });

        let outcome = solver.minimize(&provider, Pose6D::identity());
        assert!(outcome.usable());
        assert_relative_eq!(outcome.pose.tx, 0.2, epsilon = 1e-5);
        assert_relative_eq!(outcome.pose.ty, 0.1, epsilon = 1e-5);
    }
}
