//! GatiSLAM - LOAM-style LiDAR odometry and mapping.
//!
//! Ingests sweeps from a rotating multi-beam range sensor and produces,
//! per sweep, a 6-DoF world pose together with an incrementally
//! maintained map of geometric keypoints.
//!
//! # Architecture
//!
//! The crate is organized into 4 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Persistence
//! │                  (trajectory)                       │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │                 (slam pipeline)                     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  algorithms/                        │  ← Core algorithms
//! │   (extraction, matching, mapping, localization,     │
//! │                undistortion)                        │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                 (types, math)                       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! Per frame: sort points into scan lines → per-line curvature and
//! validity → edge/planar/blob labels → scan-to-scan ego-motion
//! (Levenberg–Marquardt over line and plane residuals) → world-pose
//! prediction → scan-to-map refinement against rolling voxel maps →
//! optional 12-state motion filter → undistort and insert keypoints into
//! the maps → emit the world pose.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Algorithms (depends on core)
// ============================================================================
pub mod algorithms;

// ============================================================================
// Layer 3: Engine (depends on core, algorithms)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 4: I/O (depends on all layers)
// ============================================================================
pub mod io;

pub mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use crate::core::types::{LidarPoint, PointCloud3D, Pose6D, SweepFrame};

// Algorithms - Extraction
pub use algorithms::extraction::{
    ExtractedKeypoints, KeypointConfig, KeypointExtractor, KeypointLabel, ScanDiagnostics,
};

// Algorithms - Matching
pub use algorithms::matching::{
    FeatureMatcher, LmConfig, LmOutcome, LmSolver, LmStatus, MatchingConfig, NeighborMode,
    TargetCloud,
};

// Algorithms - Mapping
pub use algorithms::mapping::{RollingGrid, RollingGridConfig};

// Algorithms - Localization
pub use algorithms::localization::{FilterMode, MotionFilter, MotionFilterConfig};

// Engine
pub use engine::{
    FrameSummary, PoseInterpolator, SlamConfig, SlamEngine, SlamObserver, StepStatus,
};

// Errors
pub use error::SlamError;

// I/O
pub use io::{export_trajectory, import_trajectory};
