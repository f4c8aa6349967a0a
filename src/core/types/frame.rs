//! Sweep frames: one sensor revolution partitioned into scan lines.

use super::point::{LidarPoint, PointCloud3D};

/// One full sweep of a rotating multi-beam sensor, partitioned by scan
/// line.
///
/// Within a scan line, points keep their acquisition (azimuth) order;
/// consecutive points are one angular resolution step apart. The partition
/// is built from the sensor calibration, which maps raw laser ids to
/// vertically-ordered scan-line ranks.
#[derive(Debug, Clone, Default)]
pub struct SweepFrame {
    lines: Vec<PointCloud3D>,
}

impl SweepFrame {
    /// Partition raw points into scan lines.
    ///
    /// `laser_id_mapping[laser_id]` is the scan-line rank of that laser.
    /// Points whose laser id is outside the mapping are dropped. The
    /// `scan_line` field of the stored points is rewritten to the mapped
    /// rank.
    pub fn from_points(points: &[LidarPoint], laser_id_mapping: &[u16]) -> Self {
        let n_lines = laser_id_mapping
            .iter()
            .copied()
            .max()
            .map_or(0, |m| m as usize + 1);
        let mut lines = vec![PointCloud3D::new(); n_lines];

        for point in points {
            let laser_id = point.scan_line as usize;
            if laser_id >= laser_id_mapping.len() {
                continue;
            }
            let rank = laser_id_mapping[laser_id];
            let mut remapped = *point;
            remapped.scan_line = rank;
            lines[rank as usize].push(remapped);
        }

        Self { lines }
    }

    /// Number of scan lines (including empty ones).
    #[inline]
    pub fn n_lines(&self) -> usize {
        self.lines.len()
    }

    /// Points of one scan line, in acquisition order.
    #[inline]
    pub fn line(&self, index: usize) -> &PointCloud3D {
        &self.lines[index]
    }

    /// Total number of points across all lines.
    pub fn len(&self) -> usize {
        self.lines.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    /// Iterate over all points, line by line.
    pub fn iter_points(&self) -> impl Iterator<Item = &LidarPoint> {
        self.lines.iter().flat_map(|l| l.iter())
    }
}
