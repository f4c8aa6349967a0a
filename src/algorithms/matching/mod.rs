//! Keypoint-to-feature matching and pose optimization.
//!
//! Matching turns keypoints into weighted point-to-line / point-to-plane
//! residuals of the form `w·(R·X + t − P)ᵀ·A·(R·X + t − P)`; the
//! Levenberg–Marquardt solver minimizes their sum over the 6 pose
//! parameters. The solver periodically re-runs matching through the
//! [`CorrespondenceProvider`] seam so that correspondences follow the
//! improving pose estimate.

pub mod feature_matcher;
pub mod lm_solver;

pub use feature_matcher::{FeatureMatcher, MatchingConfig, NeighborMode, TargetCloud};
pub use lm_solver::{LmConfig, LmOutcome, LmSolver, LmStatus};

use nalgebra::{Matrix3, Vector3};

/// One matched keypoint, ready for the solver.
///
/// The residual it contributes is `w·(R(s·θ)·X + s·t − P)ᵀ·A·(…)`, with
/// `A = nnᵀ` for plane matches and `A = (I − ddᵀ)ᵀ(I − ddᵀ)` for line
/// matches.
#[derive(Debug, Clone, Copy)]
pub struct PointResidual {
    /// Distance metric of the matched primitive (PSD 3×3).
    pub metric: Matrix3<f64>,
    /// Keypoint position in the frame being aligned.
    pub current: Vector3<f64>,
    /// Reference point on the matched primitive (neighborhood centroid).
    pub reference: Vector3<f64>,
    /// Sweep-time fraction of the keypoint; 1 when undistortion is off.
    pub time_ratio: f64,
    /// Outlier attenuation weight in (0, 1].
    pub weight: f64,
}

/// Accumulator for the residuals of one matching pass.
#[derive(Debug, Clone, Default)]
pub struct ResidualSet {
    pub items: Vec<PointResidual>,
    /// How many items came from line matches.
    pub n_lines: usize,
    /// How many items came from plane matches.
    pub n_planes: usize,
    /// How many items came from blob matches.
    pub n_blobs: usize,
}

impl ResidualSet {
    pub fn clear(&mut self) {
        self.items.clear();
        self.n_lines = 0;
        self.n_planes = 0;
        self.n_blobs = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_line(&mut self, residual: PointResidual) {
        self.items.push(residual);
        self.n_lines += 1;
    }

    pub fn push_plane(&mut self, residual: PointResidual) {
        self.items.push(residual);
        self.n_planes += 1;
    }

    pub fn push_blob(&mut self, residual: PointResidual) {
        self.items.push(residual);
        self.n_blobs += 1;
    }
}

/// Source of correspondences for the solver.
///
/// Implementations match the current keypoints against their target
/// features (previous frame or local map) under the given pose estimate.
pub trait CorrespondenceProvider {
    fn collect(&self, pose: &crate::core::types::Pose6D, residuals: &mut ResidualSet);
}
