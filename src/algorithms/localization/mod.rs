//! Motion-model state estimation.

pub mod motion_filter;

pub use motion_filter::{FilterMode, MotionFilter, MotionFilterConfig};
