//! Map maintenance: the rolling feature grids.

pub mod rolling_grid;

pub use rolling_grid::{RollingGrid, RollingGridConfig};
