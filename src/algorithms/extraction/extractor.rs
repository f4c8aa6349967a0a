//! Per-scan-line keypoint extraction.
//!
//! Each scan line is treated independently. Points are projected onto the
//! sensor XY plane and rescaled radially so that lines fired at different
//! vertical angles become comparable, then a symmetric window around each
//! point yields a curvature score and a depth-gap score. Points failing
//! validity criteria (too close to the sensor, grazing incidence, far side
//! of an occlusion) are discarded; the rest are labeled edge, planar or
//! blob with greedy per-line non-maximum suppression.
//!
//! # Algorithm
//!
//! ```text
//! For each scan line:
//! 1. p'_i = p_xy_i · |p_i| / |p_xy_i|          (radial rescale)
//! 2. a_i  = |Σ_{j∈N}(p'_j − p'_i)|² / (|N|²·|p'_i|²)
//!    g_i  = max_{j∈N} |r_j − r_i|
//! 3. Invalidate: range < min_distance_to_sensor, grazing beams,
//!    occlusion far sides
//! 4. Edge   if a_i ≥ edge threshold or g_i ≥ depth-gap threshold
//!    Planar if a_i ≤ plane threshold
//!    Blob   if window eigen-spread is isotropic (optional)
//! 5. Greedy selection in score order, suppressing the window around
//!    each accepted keypoint, capped per line
//! ```

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::math;
use crate::core::types::{PointCloud3D, SweepFrame};

/// Minimum sine of the angle between the local scan-line chord and the
/// viewing ray. Below this, the beam grazes the surface and the returns
/// are unreliable.
const MIN_BEAM_SURFACE_SIN: f64 = 0.087; // sin(5°)

/// Classification of a point after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeypointLabel {
    /// Eligible but not selected as a keypoint.
    #[default]
    Unlabeled,
    /// High-curvature or depth-gap keypoint.
    Edge,
    /// Low-curvature keypoint.
    Planar,
    /// Isotropic-neighborhood keypoint.
    Blob,
    /// Rejected by a validity criterion.
    Invalid,
}

/// Tuning for keypoint extraction.
///
/// The curvature score is normalized by the window population and the
/// point range, so its magnitude scales with the squared angular subtense
/// of the window. The angle thresholds below are calibrated for a sensor
/// with ~0.4° azimuthal resolution and `neighbor_width = 4`; scale them
/// with the square of the resolution for other sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypointConfig {
    /// Half-width of the differential window, in points.
    pub neighbor_width: usize,

    /// Azimuthal step between consecutive points on a line, in radians.
    pub angle_resolution: f64,

    /// Points closer than this to the sensor are invalid (meters).
    pub min_distance_to_sensor: f64,

    /// Cap on edge keypoints per scan line.
    pub max_edges_per_line: usize,

    /// Cap on planar keypoints per scan line.
    pub max_planars_per_line: usize,

    /// Curvature score at or above which a point is an edge candidate.
    pub edge_sin_angle_threshold: f64,

    /// Curvature score at or below which a point is a planar candidate.
    pub plane_sin_angle_threshold: f64,

    /// Range jump (meters) that makes a point an edge candidate and marks
    /// an occlusion boundary.
    pub edge_depth_gap_threshold: f64,

    /// Whether to extract blob keypoints.
    pub use_blobs: bool,

    /// Minimum ratio of smallest to largest window eigenvalue for a blob.
    pub sphericity_threshold: f64,
}

impl Default for KeypointConfig {
    fn default() -> Self {
        Self {
            neighbor_width: 4,
            angle_resolution: 0.4_f64.to_radians(),
            min_distance_to_sensor: 3.0,
            max_edges_per_line: 200,
            max_planars_per_line: 300,
            edge_sin_angle_threshold: 1e-4,
            plane_sin_angle_threshold: 2e-6,
            edge_depth_gap_threshold: 0.25,
            use_blobs: false,
            sphericity_threshold: 0.35,
        }
    }
}

/// Per-point diagnostic arrays, one inner vector per scan line.
///
/// Produced on request for display and debugging; the pipeline itself
/// never reads them back.
#[derive(Debug, Clone, Default)]
pub struct ScanDiagnostics {
    pub curvature: Vec<Vec<f64>>,
    pub depth_gap: Vec<Vec<f64>>,
    pub labels: Vec<Vec<KeypointLabel>>,
    pub valid: Vec<Vec<bool>>,
}

/// Output of one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct ExtractedKeypoints {
    /// Edge keypoints across all scan lines.
    pub edges: PointCloud3D,
    /// Planar keypoints across all scan lines.
    pub planars: PointCloud3D,
    /// Blob keypoints (empty unless blobs are enabled).
    pub blobs: PointCloud3D,
    /// Every valid point; the mapping step uses these as planar
    /// candidates when it is not restricted to the sparse set.
    pub dense: PointCloud3D,
    /// Per-point arrays, present when diagnostics were requested.
    pub diagnostics: Option<ScanDiagnostics>,
}

/// Scan-line keypoint extractor.
#[derive(Debug, Clone)]
pub struct KeypointExtractor {
    config: KeypointConfig,
    collect_diagnostics: bool,
}

impl KeypointExtractor {
    pub fn new(config: KeypointConfig) -> Self {
        Self {
            config,
            collect_diagnostics: false,
        }
    }

    pub fn config(&self) -> &KeypointConfig {
        &self.config
    }

    /// Enable or disable the per-point diagnostic arrays.
    pub fn set_diagnostics(&mut self, enabled: bool) {
        self.collect_diagnostics = enabled;
    }

    /// Extract keypoints from a sweep frame.
    ///
    /// Deterministic: selection order is score rank, with ties broken by
    /// scan line then point index.
    pub fn extract(&self, frame: &SweepFrame) -> ExtractedKeypoints {
        let mut out = ExtractedKeypoints::default();
        let mut diagnostics = self.collect_diagnostics.then(ScanDiagnostics::default);

        for line_idx in 0..frame.n_lines() {
            let line = frame.line(line_idx);
            let scratch = self.process_line(line);

            for (i, &label) in scratch.labels.iter().enumerate() {
                match label {
                    KeypointLabel::Edge => out.edges.push(*line.point_at(i)),
                    KeypointLabel::Planar => out.planars.push(*line.point_at(i)),
                    KeypointLabel::Blob => out.blobs.push(*line.point_at(i)),
                    _ => {}
                }
                if label != KeypointLabel::Invalid {
                    out.dense.push(*line.point_at(i));
                }
            }

            if let Some(diag) = diagnostics.as_mut() {
                diag.valid
                    .push(scratch.labels.iter().map(|&l| l != KeypointLabel::Invalid).collect());
                diag.curvature.push(scratch.curvature);
                diag.depth_gap.push(scratch.depth_gap);
                diag.labels.push(scratch.labels);
            }
        }

        out.diagnostics = diagnostics;
        out
    }
}

/// Working buffers for one scan line.
struct LineScratch {
    curvature: Vec<f64>,
    depth_gap: Vec<f64>,
    labels: Vec<KeypointLabel>,
}

impl KeypointExtractor {
    fn process_line(&self, line: &PointCloud3D) -> LineScratch {
        let m = line.len();
        let w = self.config.neighbor_width;

        let mut scratch = LineScratch {
            curvature: vec![0.0; m],
            depth_gap: vec![0.0; m],
            labels: vec![KeypointLabel::Unlabeled; m],
        };

        if m < 2 * w + 1 {
            return scratch;
        }

        let ranges: Vec<f64> = line.iter().map(|p| p.range()).collect();

        // Radial rescale: project onto the sensor XY plane and stretch to
        // the full range, which removes the vertical beam divergence from
        // the per-line geometry.
        let projected: Vec<Vector3<f64>> = line
            .iter()
            .zip(&ranges)
            .map(|(p, &r)| {
                let planar_norm = (p.x * p.x + p.y * p.y).sqrt();
                if planar_norm < 1e-12 {
                    Vector3::zeros()
                } else {
                    Vector3::new(p.x, p.y, 0.0) * (r / planar_norm)
                }
            })
            .collect();

        self.compute_scores(&projected, &ranges, &mut scratch);
        self.invalidate_bad_points(line, &ranges, &mut scratch);
        self.label_line(line, &mut scratch);

        scratch
    }

    fn compute_scores(&self, projected: &[Vector3<f64>], ranges: &[f64], scratch: &mut LineScratch) {
        let m = projected.len();
        let w = self.config.neighbor_width;
        let window_len = (2 * w) as f64;

        for i in w..m - w {
            let mut sum = Vector3::zeros();
            let mut gap: f64 = 0.0;

            for j in i - w..=i + w {
                if j == i {
                    continue;
                }
                sum += projected[j] - projected[i];
                gap = gap.max((ranges[j] - ranges[i]).abs());
            }

            let range_sq = ranges[i] * ranges[i];
            scratch.curvature[i] = if range_sq > 1e-12 {
                sum.norm_squared() / (window_len * window_len * range_sq)
            } else {
                0.0
            };
            scratch.depth_gap[i] = gap;
        }
    }

    fn invalidate_bad_points(
        &self,
        line: &PointCloud3D,
        ranges: &[f64],
        scratch: &mut LineScratch,
    ) {
        let m = ranges.len();
        let w = self.config.neighbor_width;

        // Too close to the sensor.
        for i in 0..m {
            if ranges[i] < self.config.min_distance_to_sensor {
                scratch.labels[i] = KeypointLabel::Invalid;
            }
        }

        // Occlusion boundaries: across a one-sided range jump, the far
        // side points look like edges but belong to a surface cut by the
        // occluder. Invalidate the window on the far side.
        for i in 0..m - 1 {
            let jump = ranges[i] - ranges[i + 1];
            if jump > self.config.edge_depth_gap_threshold {
                // Far side is behind us: i and its trailing window.
                let start = i.saturating_sub(w - 1);
                for label in &mut scratch.labels[start..=i] {
                    *label = KeypointLabel::Invalid;
                }
            } else if -jump > self.config.edge_depth_gap_threshold {
                // Far side is ahead: i+1 and its leading window.
                let end = (i + w).min(m - 1);
                for label in &mut scratch.labels[i + 1..=end] {
                    *label = KeypointLabel::Invalid;
                }
            }
        }

        // Grazing incidence: local chord nearly parallel to the viewing
        // ray.
        for i in w..m - w {
            if scratch.labels[i] == KeypointLabel::Invalid {
                continue;
            }
            let chord = line.point_at(i + w).position() - line.point_at(i - w).position();
            let chord_norm = chord.norm();
            if chord_norm < 1e-12 || ranges[i] < 1e-12 {
                continue;
            }
            let ray = line.point_at(i).position() / ranges[i];
            let sin_angle = chord.cross(&ray).norm() / chord_norm;
            if sin_angle < MIN_BEAM_SURFACE_SIN {
                scratch.labels[i] = KeypointLabel::Invalid;
            }
        }
    }

    fn label_line(&self, line: &PointCloud3D, scratch: &mut LineScratch) {
        let m = line.len();
        let w = self.config.neighbor_width;
        let eligible = |labels: &[KeypointLabel], i: usize| {
            i >= w && i < m - w && labels[i] == KeypointLabel::Unlabeled
        };

        // Edge candidates ranked by decreasing max(curvature, depth gap).
        let mut edge_candidates: Vec<(f64, usize)> = (w..m - w)
            .filter(|&i| {
                scratch.labels[i] == KeypointLabel::Unlabeled
                    && (scratch.curvature[i] >= self.config.edge_sin_angle_threshold
                        || scratch.depth_gap[i] >= self.config.edge_depth_gap_threshold)
            })
            .map(|i| (scratch.curvature[i].max(scratch.depth_gap[i]), i))
            .collect();
        edge_candidates
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

        let mut suppressed = vec![false; m];
        let mut n_edges = 0;
        for &(_, i) in &edge_candidates {
            if n_edges >= self.config.max_edges_per_line {
                break;
            }
            if suppressed[i] || !eligible(&scratch.labels, i) {
                continue;
            }
            scratch.labels[i] = KeypointLabel::Edge;
            n_edges += 1;
            for s in &mut suppressed[i.saturating_sub(w)..=(i + w).min(m - 1)] {
                *s = true;
            }
        }

        // Planar candidates ranked by increasing curvature.
        let mut planar_candidates: Vec<(f64, usize)> = (w..m - w)
            .filter(|&i| {
                scratch.labels[i] == KeypointLabel::Unlabeled
                    && scratch.curvature[i] <= self.config.plane_sin_angle_threshold
            })
            .map(|i| (scratch.curvature[i], i))
            .collect();
        planar_candidates
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

        suppressed.iter_mut().for_each(|s| *s = false);
        let mut n_planars = 0;
        for &(_, i) in &planar_candidates {
            if n_planars >= self.config.max_planars_per_line {
                break;
            }
            if suppressed[i] || !eligible(&scratch.labels, i) {
                continue;
            }
            scratch.labels[i] = KeypointLabel::Planar;
            n_planars += 1;
            for s in &mut suppressed[i.saturating_sub(w)..=(i + w).min(m - 1)] {
                *s = true;
            }
        }

        if self.config.use_blobs {
            self.label_blobs(line, scratch, &mut suppressed);
        }
    }

    /// Blob labeling: a window whose 3D covariance is close to isotropic.
    fn label_blobs(&self, line: &PointCloud3D, scratch: &mut LineScratch, suppressed: &mut [bool]) {
        let m = line.len();
        let w = self.config.neighbor_width;

        let mut candidates: Vec<(f64, usize)> = Vec::new();
        for i in w..m - w {
            if scratch.labels[i] != KeypointLabel::Unlabeled {
                continue;
            }
            let window: Vec<Vector3<f64>> = (i - w..=i + w)
                .map(|j| line.point_at(j).position())
                .collect();
            let (_, cov) = math::point_covariance(&window);
            let (values, _) = math::sorted_symmetric_eigen(&cov);
            if values[0] <= 1e-12 {
                continue;
            }
            let sphericity = values[2] / values[0];
            if sphericity >= self.config.sphericity_threshold {
                candidates.push((sphericity, i));
            }
        }
        candidates
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

        suppressed.iter_mut().for_each(|s| *s = false);
        for &(_, i) in &candidates {
            if suppressed[i] || scratch.labels[i] != KeypointLabel::Unlabeled {
                continue;
            }
            scratch.labels[i] = KeypointLabel::Blob;
            for s in &mut suppressed[i.saturating_sub(w)..=(i + w).min(m - 1)] {
                *s = true;
            }
        }
    }
}
