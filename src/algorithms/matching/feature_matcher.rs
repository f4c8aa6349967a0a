//! Line / plane / blob fitting over k-d tree neighborhoods.
//!
//! For every keypoint of the frame being aligned, the matcher looks up
//! nearest neighbors in a target cloud (previous-frame keypoints or a
//! local-map submap), checks that the neighborhood actually looks like the
//! expected primitive through its covariance eigenvalues, and produces the
//! `(P, A)` parameters of the point-to-primitive distance together with an
//! outlier attenuation weight.

use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;

/// Bucket size large enough to tolerate many points sharing a coordinate on
/// one axis (e.g. same-elevation LiDAR scan-line points), which the crate
/// default of 32 is too small for.
type PointTree = KdTree<f64, u64, 3, 4096, u32>;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::math;
use crate::core::types::{LidarPoint, PointCloud3D, Pose6D};

use super::{CorrespondenceProvider, PointResidual, ResidualSet};

/// Spread below which a neighborhood is considered collapsed and its
/// correspondence dropped.
const MIN_NEIGHBORHOOD_SPREAD: f64 = 1e-10;

/// Eigenvalue clamp ratio for blob covariance inversion.
const BLOB_EIGENVALUE_FLOOR: f64 = 1e-3;

/// How neighbors are vetted before fitting a line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NeighborMode {
    /// Neighbors must span at least two scan lines. Used scan-to-scan,
    /// where same-laser neighbors are trivially collinear.
    TwoScanLines,
    /// Leave-one-out consensus: neighbors farther than this from the
    /// fitted primitive are discarded and the primitive refitted. Used
    /// scan-to-map.
    SampleConsensus {
        /// Inlier distance bound in meters.
        max_dist_inlier: f64,
    },
}

/// Tuning for one matching pass (scan-to-scan or scan-to-map).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Neighbors fetched for a line fit.
    pub line_nb_neighbors: usize,

    /// Minimum neighbors (within distance) required for a line fit.
    pub min_line_neighbors: usize,

    /// Largest eigenvalue must exceed this factor times the second
    /// largest for the neighborhood to count as a line.
    pub line_distance_factor: f64,

    /// Neighbors fetched for a plane fit.
    pub plane_nb_neighbors: usize,

    /// Lower bound factor: `λ₂ ≥ f₁·λ₃` required for a plane.
    pub plane_distance_factor_1: f64,

    /// Upper bound factor: `λ₁ ≤ f₂·λ₂` required for a plane.
    pub plane_distance_factor_2: f64,

    /// Reject line neighborhoods whose usable neighbors sit farther than
    /// this from the query (meters).
    pub max_line_distance: f64,

    /// Reject plane neighborhoods whose farthest neighbor exceeds this
    /// distance from the query (meters).
    pub max_plane_distance: f64,

    /// Neighbors fetched for a blob fit.
    pub blob_nb_neighbors: usize,

    /// Scale applied to the blob uncertainty radius.
    pub incertitude_coef: f64,

    /// Neighbor vetting mode.
    pub neighbor_mode: NeighborMode,
}

impl MatchingConfig {
    /// Defaults for the scan-to-scan (ego-motion) pass.
    pub fn scan_to_scan() -> Self {
        Self {
            line_nb_neighbors: 10,
            min_line_neighbors: 4,
            line_distance_factor: 5.0,
            plane_nb_neighbors: 5,
            plane_distance_factor_1: 35.0,
            plane_distance_factor_2: 8.0,
            // Wide gates: scan-to-scan starts from a constant-velocity
            // guess that can be off by the full inter-frame motion.
            max_line_distance: 5.0,
            max_plane_distance: 5.0,
            blob_nb_neighbors: 25,
            incertitude_coef: 1.0,
            neighbor_mode: NeighborMode::TwoScanLines,
        }
    }

    /// Defaults for the scan-to-map (mapping) pass.
    pub fn scan_to_map() -> Self {
        Self {
            line_nb_neighbors: 10,
            min_line_neighbors: 4,
            line_distance_factor: 5.0,
            plane_nb_neighbors: 5,
            plane_distance_factor_1: 35.0,
            plane_distance_factor_2: 8.0,
            // Tight gates: mapping starts from the ego-motion prediction
            // and matches against a leaf-filtered map.
            max_line_distance: 1.0,
            max_plane_distance: 1.0,
            blob_nb_neighbors: 25,
            incertitude_coef: 1.0,
            neighbor_mode: NeighborMode::SampleConsensus {
                max_dist_inlier: 0.10,
            },
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self::scan_to_scan()
    }
}

/// A target point cloud with its k-d tree.
pub struct TargetCloud {
    cloud: PointCloud3D,
    tree: PointTree,
}

impl TargetCloud {
    /// Index a cloud for nearest-neighbor queries.
    pub fn build(cloud: PointCloud3D) -> Self {
        let mut tree: PointTree = KdTree::new();
        for (i, point) in cloud.iter().enumerate() {
            tree.add(&[point.x, point.y, point.z], i as u64);
        }
        Self { cloud, tree }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cloud.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cloud.is_empty()
    }

    #[inline]
    pub fn cloud(&self) -> &PointCloud3D {
        &self.cloud
    }
}

/// Result of fitting a primitive around a query point.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveMatch {
    /// Reference point on the primitive.
    pub reference: Vector3<f64>,
    /// Distance metric of the primitive.
    pub metric: Matrix3<f64>,
    /// Outlier attenuation weight.
    pub weight: f64,
}

/// Keypoint-to-primitive matcher.
#[derive(Debug, Clone)]
pub struct FeatureMatcher {
    config: MatchingConfig,
    /// Scale of the outlier weight `exp(−d²/scale²)`, meters.
    weight_scale: f64,
}

impl FeatureMatcher {
    pub fn new(config: MatchingConfig, weight_scale: f64) -> Self {
        Self {
            config,
            weight_scale,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    #[inline]
    fn outlier_weight(&self, distance: f64) -> f64 {
        (-(distance * distance) / (self.weight_scale * self.weight_scale)).exp()
    }

    /// Match a query position against an edge-line neighborhood.
    pub fn match_edge(&self, query: &Vector3<f64>, target: &TargetCloud) -> Option<PrimitiveMatch> {
        let k = self.config.line_nb_neighbors;
        let neighbors = target
            .tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k);

        let max_dist_sq = self.config.max_line_distance * self.config.max_line_distance;
        let close: Vec<usize> = neighbors
            .iter()
            .filter(|n| n.distance <= max_dist_sq)
            .map(|n| n.item as usize)
            .collect();
        if close.len() < self.config.min_line_neighbors {
            return None;
        }

        let mut positions: Vec<Vector3<f64>> =
            close.iter().map(|&i| target.cloud.point_at(i).position()).collect();

        match self.config.neighbor_mode {
            NeighborMode::TwoScanLines => {
                let first_line = target.cloud.point_at(close[0]).scan_line;
                if close
                    .iter()
                    .all(|&i| target.cloud.point_at(i).scan_line == first_line)
                {
                    return None;
                }
            }
            NeighborMode::SampleConsensus { max_dist_inlier } => {
                // Pre-filter on the unchecked principal direction, so a
                // stray neighbor cannot poison the acceptance test below.
                let (centroid, direction) = principal_direction(&positions)?;
                let metric = line_metric(&direction);
                positions.retain(|p| (metric * (p - centroid)).norm() <= max_dist_inlier);
                if positions.len() < self.config.min_line_neighbors {
                    return None;
                }
            }
        }

        let (centroid, direction) = fit_line(&positions, self.config.line_distance_factor)?;
        let metric = line_metric(&direction);
        let distance = (metric * (query - centroid)).norm();
        Some(PrimitiveMatch {
            reference: centroid,
            metric,
            weight: self.outlier_weight(distance),
        })
    }

    /// Match a query position against a planar neighborhood.
    pub fn match_plane(&self, query: &Vector3<f64>, target: &TargetCloud) -> Option<PrimitiveMatch> {
        let k = self.config.plane_nb_neighbors;
        let neighbors = target
            .tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k);
        if neighbors.len() < k {
            return None;
        }

        // Neighbors come back sorted; the farthest one gates the whole
        // neighborhood.
        let max_dist_sq = self.config.max_plane_distance * self.config.max_plane_distance;
        if neighbors.last().map_or(true, |n| n.distance > max_dist_sq) {
            return None;
        }

        let positions: Vec<Vector3<f64>> = neighbors
            .iter()
            .map(|n| target.cloud.point_at(n.item as usize).position())
            .collect();

        let (centroid, normal) = fit_plane(
            &positions,
            self.config.plane_distance_factor_1,
            self.config.plane_distance_factor_2,
        )?;

        let metric = normal * normal.transpose();
        let distance = normal.dot(&(query - centroid)).abs();
        Some(PrimitiveMatch {
            reference: centroid,
            metric,
            weight: self.outlier_weight(distance),
        })
    }

    /// Match a query position against a blob neighborhood.
    ///
    /// The metric is the eigenvalue-clamped inverse covariance, scaled so
    /// its largest eigenvalue is 1; the neighborhood's uncertainty radius
    /// softens the outlier weight.
    pub fn match_blob(&self, query: &Vector3<f64>, target: &TargetCloud) -> Option<PrimitiveMatch> {
        let k = self.config.blob_nb_neighbors;
        let neighbors = target
            .tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k);

        let max_dist_sq = self.config.max_plane_distance * self.config.max_plane_distance;
        let positions: Vec<Vector3<f64>> = neighbors
            .iter()
            .filter(|n| n.distance <= max_dist_sq * 4.0)
            .map(|n| target.cloud.point_at(n.item as usize).position())
            .collect();
        if positions.len() < self.config.min_line_neighbors {
            return None;
        }

        let (centroid, cov) = math::point_covariance(&positions);
        let (values, vectors) = math::sorted_symmetric_eigen(&cov);
        if values[0] < MIN_NEIGHBORHOOD_SPREAD {
            return None;
        }

        // Clamp small eigenvalues so the inverse stays bounded, then
        // normalize the metric to unit largest eigenvalue.
        let floor = values[0] * BLOB_EIGENVALUE_FLOOR;
        let clamped = [
            values[0].max(floor),
            values[1].max(floor),
            values[2].max(floor),
        ];
        let mut metric = Matrix3::zeros();
        for i in 0..3 {
            metric += (clamped[2] / clamped[i]) * (vectors[i] * vectors[i].transpose());
        }

        let radius = self.config.incertitude_coef * values[0].sqrt();
        let distance = ((query - centroid).norm() - radius).max(0.0);
        Some(PrimitiveMatch {
            reference: centroid,
            metric,
            weight: self.outlier_weight(distance),
        })
    }
}

/// Centroid and principal direction of a neighborhood, with no shape
/// acceptance test beyond non-zero spread.
fn principal_direction(points: &[Vector3<f64>]) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let (centroid, cov) = math::point_covariance(points);
    let (values, vectors) = math::sorted_symmetric_eigen(&cov);
    if values[0] < MIN_NEIGHBORHOOD_SPREAD {
        return None;
    }
    Some((centroid, vectors[0]))
}

/// Fit a line by PCA. Accepts the neighborhood when the largest
/// eigenvalue dominates the second by `factor`.
fn fit_line(points: &[Vector3<f64>], factor: f64) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let (centroid, cov) = math::point_covariance(points);
    let (values, vectors) = math::sorted_symmetric_eigen(&cov);

    if values[0] < MIN_NEIGHBORHOOD_SPREAD {
        return None;
    }
    if values[0] <= factor * values[1] {
        return None;
    }
    Some((centroid, vectors[0]))
}

/// Fit a plane by PCA. Accepts when `λ₂ ≥ f₁·λ₃` and `λ₁ ≤ f₂·λ₂`.
fn fit_plane(points: &[Vector3<f64>], f1: f64, f2: f64) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let (centroid, cov) = math::point_covariance(points);
    let (values, vectors) = math::sorted_symmetric_eigen(&cov);

    if values[1] < MIN_NEIGHBORHOOD_SPREAD {
        return None;
    }
    if values[1] < f1 * values[2] || values[0] > f2 * values[1] {
        return None;
    }
    Some((centroid, vectors[2]))
}

/// Line distance metric `(I − ddᵀ)ᵀ(I − ddᵀ)`.
fn line_metric(direction: &Vector3<f64>) -> Matrix3<f64> {
    let projector = Matrix3::identity() - direction * direction.transpose();
    projector.transpose() * projector
}

/// Scan-to-scan correspondence provider: current keypoints against the
/// previous frame's keypoints.
pub struct ScanToScanMatcher<'a> {
    pub matcher: &'a FeatureMatcher,
    pub current_edges: &'a PointCloud3D,
    pub current_planars: &'a PointCloud3D,
    pub target_edges: &'a TargetCloud,
    pub target_planars: &'a TargetCloud,
    /// Apply per-point sweep-time interpolation to the pose.
    pub undistortion: bool,
}

impl ScanToScanMatcher<'_> {
    #[inline]
    fn time_ratio(&self, point: &LidarPoint) -> f64 {
        if self.undistortion {
            point.time_offset
        } else {
            1.0
        }
    }
}

impl CorrespondenceProvider for ScanToScanMatcher<'_> {
    fn collect(&self, pose: &Pose6D, residuals: &mut ResidualSet) {
        residuals.clear();

        for point in self.current_edges.iter() {
            let s = self.time_ratio(point);
            let query = pose.scaled(s).transform_point(&point.position());
            if let Some(m) = self.matcher.match_edge(&query, self.target_edges) {
                residuals.push_line(PointResidual {
                    metric: m.metric,
                    current: point.position(),
                    reference: m.reference,
                    time_ratio: s,
                    weight: m.weight,
                });
            }
        }

        for point in self.current_planars.iter() {
            let s = self.time_ratio(point);
            let query = pose.scaled(s).transform_point(&point.position());
            if let Some(m) = self.matcher.match_plane(&query, self.target_planars) {
                residuals.push_plane(PointResidual {
                    metric: m.metric,
                    current: point.position(),
                    reference: m.reference,
                    time_ratio: s,
                    weight: m.weight,
                });
            }
        }
    }
}

/// Scan-to-map correspondence provider: current keypoints against the
/// rolling-map submaps. The pose being optimized is the world pose, so
/// points are applied rigidly.
pub struct ScanToMapMatcher<'a> {
    pub matcher: &'a FeatureMatcher,
    pub current_edges: &'a PointCloud3D,
    pub current_planars: &'a PointCloud3D,
    pub current_blobs: &'a PointCloud3D,
    pub map_edges: &'a TargetCloud,
    pub map_planars: &'a TargetCloud,
    pub map_blobs: Option<&'a TargetCloud>,
}

impl CorrespondenceProvider for ScanToMapMatcher<'_> {
    fn collect(&self, pose: &Pose6D, residuals: &mut ResidualSet) {
        residuals.clear();

        for point in self.current_edges.iter() {
            let query = pose.transform_point(&point.position());
            if let Some(m) = self.matcher.match_edge(&query, self.map_edges) {
                residuals.push_line(PointResidual {
                    metric: m.metric,
                    current: point.position(),
                    reference: m.reference,
                    time_ratio: 1.0,
                    weight: m.weight,
                });
            }
        }

        for point in self.current_planars.iter() {
            let query = pose.transform_point(&point.position());
            if let Some(m) = self.matcher.match_plane(&query, self.map_planars) {
                residuals.push_plane(PointResidual {
                    metric: m.metric,
                    current: point.position(),
                    reference: m.reference,
                    time_ratio: 1.0,
                    weight: m.weight,
                });
            }
        }

        if let Some(map_blobs) = self.map_blobs {
            for point in self.current_blobs.iter() {
                let query = pose.transform_point(&point.position());
                if let Some(m) = self.matcher.match_blob(&query, map_blobs) {
                    residuals.push_blob(PointResidual {
                        metric: m.metric,
                        current: point.position(),
                        reference: m.reference,
                        time_ratio: 1.0,
                        weight: m.weight,
                    });
                }
            }
        }
    }
}
