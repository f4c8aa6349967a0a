//! Core data types shared by all pipeline stages.

pub mod frame;
pub mod point;
pub mod pose;

pub use frame::SweepFrame;
pub use point::{LidarPoint, PointCloud3D};
pub use pose::Pose6D;
