//! Crate-level error types.
//!
//! Only hard failures surface as errors. Per-frame degradations (a failed
//! ego-motion or mapping step) are reported through
//! [`crate::engine::FrameSummary`] so a pose is still emitted for every
//! frame.

use thiserror::Error;

/// Errors surfaced to the caller.
#[derive(Debug, Error)]
pub enum SlamError {
    /// A frame was submitted before the sensor calibration was provided.
    #[error("sensor calibration must be set before processing frames")]
    CalibrationMissing,

    /// The submitted frame contains no usable points.
    #[error("frame at t={time}s contains no points after calibration mapping")]
    EmptyFrame {
        /// Frame timestamp in seconds.
        time: f64,
    },

    /// Trajectory file could not be read or written.
    #[error("trajectory io failed")]
    TrajectoryIo(#[from] std::io::Error),

    /// Trajectory file contents are not in the expected format.
    #[error("malformed trajectory line {line}: {reason}")]
    TrajectoryFormat {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },
}
