//! Pipeline orchestration.

pub mod slam;

pub use slam::{
    FrameSummary, PoseInterpolator, SlamConfig, SlamEngine, SlamObserver, StepStatus,
};
