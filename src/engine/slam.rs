//! Frame-by-frame SLAM orchestration.
//!
//! `process_frame` runs the full pipeline on one sweep: scan-line
//! partitioning, keypoint extraction, scan-to-scan ego-motion, world-pose
//! prediction, scan-to-map refinement, optional motion-model filtering,
//! and map insertion. Degradations never abort a frame: a failed
//! ego-motion skips the mapping step and emits the constant-velocity
//! prediction, a failed mapping step keeps the predicted pose and skips
//! insertion, and the emitted trajectory always grows by exactly one
//! pose per processed frame.

use log::{debug, info, warn};
use nalgebra::{Matrix4, Vector3};

use crate::algorithms::extraction::{
    ExtractedKeypoints, KeypointConfig, KeypointExtractor,
};
use crate::algorithms::localization::{FilterMode, MotionFilter, MotionFilterConfig};
use crate::algorithms::mapping::{RollingGrid, RollingGridConfig};
use crate::algorithms::matching::feature_matcher::{ScanToMapMatcher, ScanToScanMatcher};
use crate::algorithms::matching::{
    FeatureMatcher, LmConfig, LmSolver, LmStatus, MatchingConfig, TargetCloud,
};
use crate::algorithms::undistortion;
use crate::core::types::{LidarPoint, PointCloud3D, Pose6D, SweepFrame};
use crate::error::SlamError;
use crate::io::trajectory::export_trajectory;

/// External pose source (GPS/IMU interpolator or similar).
///
/// Used to initialize the world pose on the first frame and, in
/// [`FilterMode::MotionModelWithVelocity`], to derive a linear-velocity
/// hint for the motion filter.
pub trait PoseInterpolator {
    fn pose_at(&self, t: f64) -> Option<Pose6D>;
}

/// Stage observer, invoked after each pipeline stage.
///
/// Replaces in-band diagnostic arrays: implementations can forward data
/// to displays or logs without the engine carrying display state.
pub trait SlamObserver {
    fn on_keypoints(&mut self, _t: f64, _keypoints: &ExtractedKeypoints) {}
    fn on_ego_motion(&mut self, _t: f64, _relative: &Pose6D, _status: &StepStatus) {}
    fn on_mapping(&mut self, _t: f64, _world: &Pose6D, _status: &StepStatus) {}
    fn on_frame_done(&mut self, _summary: &FrameSummary) {}
}

/// Outcome of one optimization stage of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The stage converged or ran out of iterations with a usable pose.
    Success {
        iterations: usize,
        matches: usize,
    },
    /// Too few correspondences to constrain the pose.
    NotEnoughKeypoints,
    /// No optimization step was ever accepted.
    Diverged,
    /// The result moved farther than physically plausible and was
    /// discarded.
    ExcessiveMotion,
    /// The stage did not run (first frame, or insufficient map).
    Skipped,
}

impl StepStatus {
    /// Whether the stage produced a pose that should be trusted.
    pub fn succeeded(&self) -> bool {
        matches!(self, StepStatus::Success { .. })
    }
}

/// Per-frame report.
#[derive(Debug, Clone)]
pub struct FrameSummary {
    /// Frame timestamp, seconds.
    pub time: f64,
    /// Emitted world pose.
    pub pose: Pose6D,
    /// Frame-to-frame transform recovered by ego-motion.
    pub relative: Pose6D,
    pub ego_motion: StepStatus,
    pub mapping: StepStatus,
    pub n_edges: usize,
    pub n_planars: usize,
    pub n_blobs: usize,
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct SlamConfig {
    /// Largest plausible sensor displacement between two frames, meters.
    /// Results beyond this are discarded as failures.
    pub max_dist_between_two_frames: f64,

    /// Scale of the matching outlier weight `exp(−d²/scale²)`, meters.
    pub max_distance_for_icp_matching: f64,

    /// When set, mapping reuses the sparse ego-motion planar keypoints;
    /// otherwise every valid non-keypoint return is matched as a planar
    /// candidate.
    pub fast_slam: bool,

    /// Per-point sweep-time undistortion under the constant-velocity
    /// model.
    pub undistortion: bool,

    /// Motion-model filtering; `None` disables the Kalman filter.
    pub motion_model: Option<FilterMode>,

    /// Produce per-point diagnostic arrays for observers.
    pub display_mode: bool,

    /// Half extent of the map query box around the predicted sensor
    /// position, meters. Matches the range of the farthest useful
    /// keypoint.
    pub farest_keypoint_dist: f64,

    pub keypoint: KeypointConfig,
    pub ego_motion_matching: MatchingConfig,
    pub ego_motion_lm: LmConfig,
    pub mapping_matching: MatchingConfig,
    pub mapping_lm: LmConfig,
    pub rolling_grid: RollingGridConfig,
    pub motion_filter: MotionFilterConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            max_dist_between_two_frames: 10.0,
            max_distance_for_icp_matching: 20.0,
            fast_slam: true,
            undistortion: false,
            motion_model: None,
            display_mode: false,
            farest_keypoint_dist: 100.0,
            keypoint: KeypointConfig::default(),
            ego_motion_matching: MatchingConfig::scan_to_scan(),
            ego_motion_lm: LmConfig {
                max_iter: 15,
                ..LmConfig::default()
            },
            mapping_matching: MatchingConfig::scan_to_map(),
            mapping_lm: LmConfig {
                max_iter: 20,
                ..LmConfig::default()
            },
            rolling_grid: RollingGridConfig::default(),
            motion_filter: MotionFilterConfig::default(),
        }
    }
}

/// LOAM-style SLAM engine.
///
/// Owns the rolling feature maps, the previous-frame keypoints and the
/// motion filter; frames are processed strictly sequentially.
pub struct SlamEngine {
    config: SlamConfig,
    extractor: KeypointExtractor,
    ego_solver: LmSolver,
    map_solver: LmSolver,

    laser_id_mapping: Option<Vec<u16>>,

    edges_map: RollingGrid,
    planars_map: RollingGrid,
    blobs_map: RollingGrid,

    /// Previous-frame keypoints, already indexed for matching. Swapped,
    /// not copied, at the end of each frame.
    previous_edges: Option<TargetCloud>,
    previous_planars: Option<TargetCloud>,

    relative: Pose6D,
    world: Pose6D,
    trajectory: Vec<(f64, Pose6D)>,

    motion_filter: Option<MotionFilter>,
    interpolator: Option<Box<dyn PoseInterpolator>>,
    observer: Option<Box<dyn SlamObserver>>,

    previous_time: Option<f64>,
    n_frames: usize,
}

impl SlamEngine {
    pub fn new(config: SlamConfig) -> Self {
        let mut extractor = KeypointExtractor::new(config.keypoint.clone());
        extractor.set_diagnostics(config.display_mode);

        let motion_filter = config
            .motion_model
            .map(|mode| MotionFilter::new(config.motion_filter.clone(), mode));

        Self {
            extractor,
            ego_solver: LmSolver::new(config.ego_motion_lm.clone()),
            map_solver: LmSolver::new(config.mapping_lm.clone()),
            laser_id_mapping: None,
            edges_map: RollingGrid::new(config.rolling_grid.clone()),
            planars_map: RollingGrid::new(config.rolling_grid.clone()),
            blobs_map: RollingGrid::new(config.rolling_grid.clone()),
            previous_edges: None,
            previous_planars: None,
            relative: Pose6D::identity(),
            world: Pose6D::identity(),
            trajectory: Vec::new(),
            motion_filter,
            interpolator: None,
            observer: None,
            previous_time: None,
            n_frames: 0,
            config,
        }
    }

    /// Provide the laser-id to scan-line-rank mapping. Required before
    /// the first frame.
    pub fn set_sensor_calibration(&mut self, laser_id_mapping: Vec<u16>) {
        info!("sensor calibration set: {} lasers", laser_id_mapping.len());
        self.laser_id_mapping = Some(laser_id_mapping);
    }

    pub fn is_calibrated(&self) -> bool {
        self.laser_id_mapping.is_some()
    }

    /// Attach an external pose source.
    pub fn set_interpolator(&mut self, interpolator: Box<dyn PoseInterpolator>) {
        self.interpolator = Some(interpolator);
    }

    /// Attach a stage observer.
    pub fn set_observer(&mut self, observer: Box<dyn SlamObserver>) {
        self.observer = Some(observer);
    }

    /// Current world pose of the sensor.
    pub fn world_pose(&self) -> Pose6D {
        self.world
    }

    /// Current world pose as a homogeneous matrix.
    pub fn world_matrix(&self) -> Matrix4<f64> {
        self.world.matrix4()
    }

    /// All emitted poses, one per processed frame.
    pub fn trajectory(&self) -> &[(f64, Pose6D)] {
        &self.trajectory
    }

    pub fn frames_processed(&self) -> usize {
        self.n_frames
    }

    /// Total points stored across the three feature maps.
    pub fn map_size(&self) -> usize {
        self.edges_map.len() + self.planars_map.len() + self.blobs_map.len()
    }

    /// Write the trajectory to a text file.
    pub fn export_trajectory<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), SlamError> {
        export_trajectory(path, &self.trajectory)
    }

    /// Log the active configuration.
    pub fn log_parameters(&self) {
        info!("slam configuration: {:#?}", self.config);
    }

    /// Erase maps, trajectory and all frame-to-frame state. The sensor
    /// calibration is kept.
    pub fn reset(&mut self) {
        info!("engine reset: dropping maps and trajectory");
        self.edges_map.clear();
        self.planars_map.clear();
        self.blobs_map.clear();
        self.previous_edges = None;
        self.previous_planars = None;
        self.relative = Pose6D::identity();
        self.world = Pose6D::identity();
        self.trajectory.clear();
        self.previous_time = None;
        self.n_frames = 0;
        if let Some(filter) = self.motion_filter.as_mut() {
            *filter = MotionFilter::new(self.config.motion_filter.clone(), filter.mode());
        }
    }

    /// Run keypoint extraction only, without touching engine state.
    pub fn keypoints_only(&self, points: &[LidarPoint]) -> Result<ExtractedKeypoints, SlamError> {
        let mapping = self
            .laser_id_mapping
            .as_ref()
            .ok_or(SlamError::CalibrationMissing)?;
        let frame = SweepFrame::from_points(points, mapping);
        Ok(self.extractor.extract(&frame))
    }

    /// Process one sweep and emit its world pose.
    pub fn process_frame(
        &mut self,
        points: &[LidarPoint],
        t: f64,
    ) -> Result<FrameSummary, SlamError> {
        let mapping = self
            .laser_id_mapping
            .as_ref()
            .ok_or(SlamError::CalibrationMissing)?;

        let frame = SweepFrame::from_points(points, mapping);
        if frame.is_empty() {
            return Err(SlamError::EmptyFrame { time: t });
        }
        if frame.len() < points.len() {
            debug!(
                "dropped {} points outside the calibration mapping",
                points.len() - frame.len()
            );
        }

        // Stage 1: keypoints.
        let keypoints = self.extractor.extract(&frame);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_keypoints(t, &keypoints);
        }
        debug!(
            "frame {}: {} edges, {} planars, {} blobs, {} dense",
            self.n_frames,
            keypoints.edges.len(),
            keypoints.planars.len(),
            keypoints.blobs.len(),
            keypoints.dense.len()
        );

        // Stage 2: ego-motion against the previous frame.
        let ego_status = self.compute_ego_motion(&keypoints);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_ego_motion(t, &self.relative, &ego_status);
        }

        // Stage 3: predict the world pose from the relative motion.
        let previous_world = self.world;
        let predicted_world = if self.n_frames == 0 {
            self.initial_world_pose(t)
        } else {
            previous_world.compose(&self.relative)
        };

        // Stage 4: refine against the rolling maps. A failed ego-motion
        // skips this entirely: the predicted pose is emitted as-is and
        // the map is not matched against a bad prior.
        let mapping_planars = if self.config.fast_slam {
            &keypoints.planars
        } else {
            &keypoints.dense
        };
        let ego_usable = matches!(
            ego_status,
            StepStatus::Success { .. } | StepStatus::Skipped
        );
        let (mapping_status, refined_world) = if ego_usable {
            self.compute_mapping(&keypoints.edges, mapping_planars, &keypoints.blobs, predicted_world)
        } else {
            warn!("ego-motion failed ({ego_status:?}): skipping the mapping step");
            (StepStatus::Skipped, predicted_world)
        };
        self.world = refined_world;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_mapping(t, &self.world, &mapping_status);
        }

        // Stage 5: motion-model filtering.
        self.apply_motion_filter(t);

        // Stage 6: map update. Ego-motion and mapping failures both keep
        // the map untouched.
        let insert = ego_usable
            && matches!(
                mapping_status,
                StepStatus::Success { .. } | StepStatus::Skipped
            );
        if insert {
            self.insert_into_maps(&keypoints.edges, mapping_planars, &keypoints.blobs);
        } else if ego_usable {
            warn!("mapping step failed ({mapping_status:?}): keeping map untouched");
        }

        // Stage 7: bookkeeping for the next frame.
        self.store_previous_keypoints(&keypoints);
        self.trajectory.push((t, self.world));
        self.previous_time = Some(t);
        self.n_frames += 1;

        let summary = FrameSummary {
            time: t,
            pose: self.world,
            relative: self.relative,
            ego_motion: ego_status,
            mapping: mapping_status,
            n_edges: keypoints.edges.len(),
            n_planars: keypoints.planars.len(),
            n_blobs: keypoints.blobs.len(),
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.on_frame_done(&summary);
        }
        Ok(summary)
    }

    /// World pose of the very first frame: external source if available,
    /// identity otherwise (the world frame coincides with it).
    fn initial_world_pose(&self, t: f64) -> Pose6D {
        if let Some(interp) = self.interpolator.as_ref() {
            if let Some(pose) = interp.pose_at(t) {
                info!("initializing world pose from external source");
                return pose;
            }
        }
        Pose6D::identity()
    }

    /// Scan-to-scan optimization. Updates `self.relative`; on failure the
    /// previous relative transform is kept (constant-velocity fallback).
    fn compute_ego_motion(&mut self, keypoints: &ExtractedKeypoints) -> StepStatus {
        let (Some(target_edges), Some(target_planars)) =
            (self.previous_edges.as_ref(), self.previous_planars.as_ref())
        else {
            return StepStatus::Skipped;
        };
        if target_edges.is_empty() && target_planars.is_empty() {
            return StepStatus::Skipped;
        }

        let matcher = FeatureMatcher::new(
            self.config.ego_motion_matching.clone(),
            self.config.max_distance_for_icp_matching,
        );
        let provider = ScanToScanMatcher {
            matcher: &matcher,
            current_edges: &keypoints.edges,
            current_planars: &keypoints.planars,
            target_edges,
            target_planars,
            undistortion: self.config.undistortion,
        };

        let outcome = self.ego_solver.minimize(&provider, self.relative);

        match outcome.status {
            LmStatus::NotEnoughMatches => {
                warn!(
                    "ego-motion: only {} matches, keeping constant-velocity prediction",
                    outcome.matches
                );
                StepStatus::NotEnoughKeypoints
            }
            LmStatus::Diverged => {
                warn!("ego-motion diverged, keeping constant-velocity prediction");
                StepStatus::Diverged
            }
            _ => {
                if outcome.pose.translation_norm() > self.config.max_dist_between_two_frames {
                    warn!(
                        "ego-motion translation {:.2} m exceeds the {:.2} m bound, discarding",
                        outcome.pose.translation_norm(),
                        self.config.max_dist_between_two_frames
                    );
                    StepStatus::ExcessiveMotion
                } else {
                    self.relative = outcome.pose;
                    StepStatus::Success {
                        iterations: outcome.iterations,
                        matches: outcome.matches,
                    }
                }
            }
        }
    }

    /// Scan-to-map optimization. Returns the stage status and the world
    /// pose to adopt.
    fn compute_mapping(
        &self,
        edges: &PointCloud3D,
        planars: &PointCloud3D,
        blobs: &PointCloud3D,
        predicted_world: Pose6D,
    ) -> (StepStatus, Pose6D) {
        if self.edges_map.is_empty() && self.planars_map.is_empty() {
            return (StepStatus::Skipped, predicted_world);
        }

        // Submaps around the predicted sensor position.
        let center = predicted_world.translation();
        let half = Vector3::repeat(self.config.farest_keypoint_dist);
        let edge_submap = TargetCloud::build(self.edges_map.query(&(center - half), &(center + half)));
        let planar_submap =
            TargetCloud::build(self.planars_map.query(&(center - half), &(center + half)));
        let blob_submap = (self.config.keypoint.use_blobs && !self.blobs_map.is_empty())
            .then(|| TargetCloud::build(self.blobs_map.query(&(center - half), &(center + half))));

        if edge_submap.is_empty() && planar_submap.is_empty() {
            return (StepStatus::Skipped, predicted_world);
        }

        let matcher = FeatureMatcher::new(
            self.config.mapping_matching.clone(),
            self.config.max_distance_for_icp_matching,
        );
        let provider = ScanToMapMatcher {
            matcher: &matcher,
            current_edges: edges,
            current_planars: planars,
            current_blobs: blobs,
            map_edges: &edge_submap,
            map_planars: &planar_submap,
            map_blobs: blob_submap.as_ref(),
        };

        let outcome = self.map_solver.minimize(&provider, predicted_world);

        match outcome.status {
            LmStatus::NotEnoughMatches => {
                warn!(
                    "mapping: only {} matches, keeping predicted pose",
                    outcome.matches
                );
                (StepStatus::NotEnoughKeypoints, predicted_world)
            }
            LmStatus::Diverged => {
                warn!("mapping diverged, keeping predicted pose");
                (StepStatus::Diverged, predicted_world)
            }
            _ => {
                let correction = (outcome.pose.translation() - predicted_world.translation()).norm();
                if correction > self.config.max_dist_between_two_frames {
                    warn!(
                        "mapping correction {:.2} m exceeds the {:.2} m bound, discarding",
                        correction, self.config.max_dist_between_two_frames
                    );
                    (StepStatus::ExcessiveMotion, predicted_world)
                } else {
                    (
                        StepStatus::Success {
                            iterations: outcome.iterations,
                            matches: outcome.matches,
                        },
                        outcome.pose,
                    )
                }
            }
        }
    }

    /// Kalman predict/correct around the refined pose.
    fn apply_motion_filter(&mut self, t: f64) {
        let Some(filter) = self.motion_filter.as_mut() else {
            return;
        };

        filter.predict(t);

        let velocity_hint = if filter.mode() == FilterMode::MotionModelWithVelocity {
            self.interpolator.as_ref().and_then(|interp| {
                let previous_time = self.previous_time?;
                let dt = t - previous_time;
                if dt <= 0.0 {
                    return None;
                }
                let now = interp.pose_at(t)?;
                let before = interp.pose_at(previous_time)?;
                Some((now.translation() - before.translation()) / dt)
            })
        } else {
            None
        };

        match velocity_hint {
            Some(velocity) => filter.correct_with_velocity(&self.world, &velocity),
            None => filter.correct(&self.world),
        }

        self.world = filter.pose();
    }

    /// Express keypoints at end-of-sweep, push world-frame copies into
    /// the rolling maps and recenter them on the sensor.
    fn insert_into_maps(
        &mut self,
        edges: &PointCloud3D,
        planars: &PointCloud3D,
        blobs: &PointCloud3D,
    ) {
        let world_cloud = |cloud: &PointCloud3D| -> PointCloud3D {
            cloud
                .iter()
                .map(|p| {
                    let at_end = if self.config.undistortion {
                        undistortion::transform_to_end(p, &self.relative)
                    } else {
                        *p
                    };
                    undistortion::transform_to_world(&at_end, &self.world)
                })
                .collect()
        };

        let position = self.world.translation();
        self.edges_map.insert(&world_cloud(edges));
        self.edges_map.recenter_to(&position);
        self.planars_map.insert(&world_cloud(planars));
        self.planars_map.recenter_to(&position);
        if self.config.keypoint.use_blobs {
            self.blobs_map.insert(&world_cloud(blobs));
            self.blobs_map.recenter_to(&position);
        }
    }

    /// Index the current keypoints as next frame's matching targets.
    /// With undistortion on, they are first expressed at end-of-sweep,
    /// which is the reference frame of the next relative transform.
    fn store_previous_keypoints(&mut self, keypoints: &ExtractedKeypoints) {
        let end_cloud = |cloud: &PointCloud3D| -> PointCloud3D {
            if self.config.undistortion {
                cloud
                    .iter()
                    .map(|p| undistortion::transform_to_end(p, &self.relative))
                    .collect()
            } else {
                cloud.clone()
            }
        };

        self.previous_edges = Some(TargetCloud::build(end_cloud(&keypoints.edges)));
        self.previous_planars = Some(TargetCloud::build(end_cloud(&keypoints.planars)));
    }
}
