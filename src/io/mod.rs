//! Persistence of engine outputs.

pub mod trajectory;

pub use trajectory::{export_trajectory, import_trajectory};
