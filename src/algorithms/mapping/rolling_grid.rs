//! Bounded sliding voxel map of feature points.
//!
//! The grid covers `grid_nb_voxel` voxels per axis around a moving anchor.
//! Cells are keyed by world voxel index, so recentering never touches
//! stored coordinates; it only moves the admission window and evicts the
//! cells that scrolled out. Inside a cell, a leaf-size occupancy filter
//! caps density: the first point to claim a leaf voxel wins, which keeps
//! insertion deterministic and memory bounded.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::types::PointCloud3D;

/// Geometry of the rolling grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingGridConfig {
    /// Edge length of one grid cell, meters.
    pub voxel_size: f64,

    /// Grid extent in cells per axis.
    pub grid_nb_voxel: [usize; 3],

    /// Per-cell capacity lattice: a cell never stores more points than
    /// the product of these counts, whatever the leaf filter admits.
    pub pointcloud_nb_voxel: [usize; 3],

    /// Edge length of the in-cell downsampling leaf, meters.
    pub leaf_voxel_filter_size: f64,
}

impl Default for RollingGridConfig {
    fn default() -> Self {
        Self {
            voxel_size: 10.0,
            grid_nb_voxel: [30, 30, 30],
            pointcloud_nb_voxel: [30, 30, 30],
            leaf_voxel_filter_size: 0.6,
        }
    }
}

impl RollingGridConfig {
    /// Upper bound on stored points per cell.
    pub fn max_points_per_cell(&self) -> usize {
        let leaves_per_axis = (self.voxel_size / self.leaf_voxel_filter_size).ceil() as usize + 1;
        let capacity: usize = self.pointcloud_nb_voxel.iter().product();
        leaves_per_axis.pow(3).min(capacity)
    }
}

#[derive(Debug, Default, Clone)]
struct GridCell {
    points: PointCloud3D,
    occupied_leaves: HashSet<(i64, i64, i64)>,
}

/// Sliding bounded voxel map.
#[derive(Debug, Clone)]
pub struct RollingGrid {
    config: RollingGridConfig,
    /// World voxel index of the grid center.
    anchor: [i64; 3],
    cells: HashMap<(i64, i64, i64), GridCell>,
    n_points: usize,
}

impl RollingGrid {
    pub fn new(config: RollingGridConfig) -> Self {
        Self {
            config,
            anchor: [0, 0, 0],
            cells: HashMap::new(),
            n_points: 0,
        }
    }

    pub fn config(&self) -> &RollingGridConfig {
        &self.config
    }

    /// Total stored points.
    #[inline]
    pub fn len(&self) -> usize {
        self.n_points
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_points == 0
    }

    /// Drop all stored points and reset the anchor.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.n_points = 0;
        self.anchor = [0, 0, 0];
    }

    #[inline]
    fn voxel_of(&self, x: f64, y: f64, z: f64) -> (i64, i64, i64) {
        (
            (x / self.config.voxel_size).floor() as i64,
            (y / self.config.voxel_size).floor() as i64,
            (z / self.config.voxel_size).floor() as i64,
        )
    }

    #[inline]
    fn half_extent(&self, axis: usize) -> i64 {
        (self.config.grid_nb_voxel[axis] / 2) as i64
    }

    #[inline]
    fn in_bounds(&self, voxel: (i64, i64, i64)) -> bool {
        (voxel.0 - self.anchor[0]).abs() <= self.half_extent(0)
            && (voxel.1 - self.anchor[1]).abs() <= self.half_extent(1)
            && (voxel.2 - self.anchor[2]).abs() <= self.half_extent(2)
    }

    /// Insert world-frame points. Points outside the current grid extent
    /// are discarded, points landing in an occupied leaf are absorbed,
    /// and full cells take no more points.
    pub fn insert(&mut self, points: &PointCloud3D) {
        let leaf = self.config.leaf_voxel_filter_size;
        let cell_capacity: usize = self.config.pointcloud_nb_voxel.iter().product();

        for point in points.iter() {
            let voxel = self.voxel_of(point.x, point.y, point.z);
            if !self.in_bounds(voxel) {
                continue;
            }

            let leaf_index = (
                (point.x / leaf).floor() as i64,
                (point.y / leaf).floor() as i64,
                (point.z / leaf).floor() as i64,
            );

            let cell = self.cells.entry(voxel).or_default();
            if cell.points.len() >= cell_capacity {
                continue;
            }
            if cell.occupied_leaves.insert(leaf_index) {
                cell.points.push(*point);
                self.n_points += 1;
            }
        }
    }

    /// Collect the points of every cell overlapping the axis-aligned box
    /// `[min, max]`.
    pub fn query(&self, min: &Vector3<f64>, max: &Vector3<f64>) -> PointCloud3D {
        let lo = self.voxel_of(min.x, min.y, min.z);
        let hi = self.voxel_of(max.x, max.y, max.z);

        let mut out = PointCloud3D::new();
        for vx in lo.0..=hi.0 {
            for vy in lo.1..=hi.1 {
                for vz in lo.2..=hi.2 {
                    if let Some(cell) = self.cells.get(&(vx, vy, vz)) {
                        for point in cell.points.iter() {
                            out.push(*point);
                        }
                    }
                }
            }
        }
        out
    }

    /// Slide the anchor to the voxel containing `position`, evicting the
    /// cells that fall outside the new extent.
    pub fn recenter_to(&mut self, position: &Vector3<f64>) {
        let new_anchor = self.voxel_of(position.x, position.y, position.z);
        if [new_anchor.0, new_anchor.1, new_anchor.2] == self.anchor {
            return;
        }
        self.anchor = [new_anchor.0, new_anchor.1, new_anchor.2];

        let half = [
            self.half_extent(0),
            self.half_extent(1),
            self.half_extent(2),
        ];
        let anchor = self.anchor;
        let mut evicted = 0;
        self.cells.retain(|&(vx, vy, vz), cell| {
            let keep = (vx - anchor[0]).abs() <= half[0]
                && (vy - anchor[1]).abs() <= half[1]
                && (vz - anchor[2]).abs() <= half[2];
            if !keep {
                evicted += cell.points.len();
            }
            keep
        });
        self.n_points -= evicted;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LidarPoint;

    fn small_config() -> RollingGridConfig {
        RollingGridConfig {
            voxel_size: 1.0,
            grid_nb_voxel: [6, 6, 6],
            leaf_voxel_filter_size: 0.25,
            ..RollingGridConfig::default()
        }
    }

    fn cloud_of(positions: &[(f64, f64, f64)]) -> PointCloud3D {
        positions
            .iter()
            .map(|&(x, y, z)| LidarPoint::new(x, y, z))
            .collect()
    }

    #[test]
    fn test_insert_and_query() {
        let mut grid = RollingGrid::new(small_config());
        grid.insert(&cloud_of(&[(0.5, 0.5, 0.5), (1.5, 0.5, 0.5), (-1.5, 0.5, 0.5)]));
        assert_eq!(grid.len(), 3);

        let near = grid.query(&Vector3::new(0.0, 0.0, 0.0), &Vector3::new(0.9, 0.9, 0.9));
        assert_eq!(near.len(), 1);

        let all = grid.query(&Vector3::new(-2.0, 0.0, 0.0), &Vector3::new(2.0, 1.0, 1.0));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_out_of_bounds_discarded() {
        let mut grid = RollingGrid::new(small_config());
        // Extent is ±3 voxels of 1 m around the origin anchor.
        grid.insert(&cloud_of(&[(10.0, 0.0, 0.0), (0.5, 0.5, 0.5)]));
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_leaf_filter_deduplicates() {
        let mut grid = RollingGrid::new(small_config());
        // Both points land in the same 0.25 m leaf.
        grid.insert(&cloud_of(&[(0.50, 0.50, 0.50), (0.51, 0.52, 0.50)]));
        assert_eq!(grid.len(), 1);

        // A point in the next leaf is kept.
        grid.insert(&cloud_of(&[(0.80, 0.50, 0.50)]));
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn test_cell_capacity_cap() {
        let config = RollingGridConfig {
            voxel_size: 1.0,
            grid_nb_voxel: [6, 6, 6],
            pointcloud_nb_voxel: [2, 2, 1],
            leaf_voxel_filter_size: 0.01,
        };
        let mut grid = RollingGrid::new(config);

        // Leaves are tiny, so only the cell capacity of 4 limits storage.
        let positions: Vec<(f64, f64, f64)> =
            (0..10).map(|i| (0.05 + 0.05 * i as f64, 0.5, 0.5)).collect();
        grid.insert(&cloud_of(&positions));
        assert_eq!(grid.len(), 4);
    }

    #[test]
    fn test_recenter_evicts_scrolled_out_cells() {
        let mut grid = RollingGrid::new(small_config());
        grid.insert(&cloud_of(&[(0.5, 0.5, 0.5), (2.5, 0.5, 0.5)]));
        assert_eq!(grid.len(), 2);

        // Move far along +x: the origin cell scrolls out.
        grid.recenter_to(&Vector3::new(5.5, 0.5, 0.5));
        assert_eq!(grid.len(), 1);

        let remaining = grid.query(&Vector3::new(2.0, 0.0, 0.0), &Vector3::new(3.0, 1.0, 1.0));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.point_at(0).x, 2.5);
    }

    #[test]
    fn test_recenter_preserves_world_coordinates() {
        let mut grid = RollingGrid::new(small_config());
        grid.insert(&cloud_of(&[(1.5, 1.5, 0.5)]));

        grid.recenter_to(&Vector3::new(2.5, 2.5, 0.5));
        let found = grid.query(&Vector3::new(1.0, 1.0, 0.0), &Vector3::new(2.0, 2.0, 1.0));
        assert_eq!(found.len(), 1);
        assert_eq!(found.point_at(0).x, 1.5);
        assert_eq!(found.point_at(0).y, 1.5);
    }

    #[test]
    fn test_recenter_enables_insertion_near_new_anchor() {
        let mut grid = RollingGrid::new(small_config());
        // Out of bounds around the origin.
        grid.insert(&cloud_of(&[(10.5, 0.5, 0.5)]));
        assert_eq!(grid.len(), 0);

        grid.recenter_to(&Vector3::new(10.0, 0.0, 0.0));
        grid.insert(&cloud_of(&[(10.5, 0.5, 0.5)]));
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn test_point_count_stays_bounded() {
        let config = RollingGridConfig {
            voxel_size: 1.0,
            grid_nb_voxel: [2, 2, 2],
            leaf_voxel_filter_size: 0.5,
            ..RollingGridConfig::default()
        };
        let bound =
            config.max_points_per_cell() * config.grid_nb_voxel.iter().map(|n| n + 1).product::<usize>();
        let mut grid = RollingGrid::new(config);

        // Hammer the grid with a dense lattice much finer than the leaf.
        let mut cloud = PointCloud3D::new();
        for i in -20..20 {
            for j in -20..20 {
                for k in -20..20 {
                    cloud.push(LidarPoint::new(
                        i as f64 * 0.11,
                        j as f64 * 0.11,
                        k as f64 * 0.11,
                    ));
                }
            }
        }
        grid.insert(&cloud);
        assert!(grid.len() <= bound, "{} > {}", grid.len(), bound);
    }

    #[test]
    fn test_clear() {
        let mut grid = RollingGrid::new(small_config());
        grid.insert(&cloud_of(&[(0.5, 0.5, 0.5)]));
        grid.clear();
        assert!(grid.is_empty());
        assert_eq!(
            grid.query(&Vector3::new(-1.0, -1.0, -1.0), &Vector3::new(1.0, 1.0, 1.0))
                .len(),
            0
        );
    }
}
