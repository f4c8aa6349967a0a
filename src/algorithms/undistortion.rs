//! Motion undistortion within a sweep.
//!
//! Under the constant-velocity assumption, the sensor pose at sweep
//! fraction `s` is the full-sweep transform interpolated linearly toward
//! the identity ([`Pose6D::scaled`]). A point measured at `s` can then be
//! re-expressed at sweep start, sweep end, or in the world frame.

use crate::core::types::{LidarPoint, Pose6D};

/// Express a point measured at sweep fraction `point.time_offset` in the
/// sweep-start frame: `R(s·θ)·p + s·t`.
pub fn transform_to_start(point: &LidarPoint, sweep_transform: &Pose6D) -> LidarPoint {
    let interpolated = sweep_transform.scaled(point.time_offset);
    point.with_position(interpolated.transform_point(&point.position()))
}

/// Express a point measured at sweep fraction `point.time_offset` in the
/// sweep-end frame.
///
/// Equivalent to mapping to the sweep-start frame, then applying the
/// inverse of the full-sweep transform.
pub fn transform_to_end(point: &LidarPoint, sweep_transform: &Pose6D) -> LidarPoint {
    let start = transform_to_start(point, sweep_transform);
    point.with_position(
        sweep_transform
            .inverse()
            .transform_point(&start.position()),
    )
}

/// Apply a world pose to an already-undistorted point.
pub fn transform_to_world(point: &LidarPoint, world_pose: &Pose6D) -> LidarPoint {
    point.with_position(world_pose.transform_point(&point.position()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn point_at(x: f64, y: f64, z: f64, s: f64) -> LidarPoint {
        let mut p = LidarPoint::new(x, y, z);
        p.time_offset = s;
        p
    }

    #[test]
    fn test_sweep_start_point_unchanged() {
        let motion = Pose6D::new(0.02, -0.01, 0.05, 0.5, 0.1, 0.0);
        let p = point_at(4.0, 1.0, 0.5, 0.0);
        let moved = transform_to_start(&p, &motion);
        assert_relative_eq!(moved.position(), p.position(), epsilon = 1e-15);
    }

    #[test]
    fn test_sweep_end_point_unchanged_by_to_end() {
        let motion = Pose6D::new(0.02, -0.01, 0.05, 0.5, 0.1, 0.0);
        let p = point_at(4.0, 1.0, 0.5, 1.0);
        let moved = transform_to_end(&p, &motion);
        assert_relative_eq!(moved.position(), p.position(), epsilon = 1e-12);
    }

    #[test]
    fn test_end_point_maps_to_full_transform_at_start() {
        let motion = Pose6D::new(0.0, 0.0, 0.1, 1.0, 0.0, 0.0);
        let p = point_at(2.0, 0.0, 0.0, 1.0);
        let moved = transform_to_start(&p, &motion);
        assert_relative_eq!(
            moved.position(),
            motion.transform_point(&p.position()),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_start_and_end_frames_differ_by_sweep_transform() {
        let motion = Pose6D::new(0.03, 0.01, -0.04, 0.4, -0.2, 0.1);
        let p = point_at(3.0, -1.0, 0.8, 0.37);

        let at_start = transform_to_start(&p, &motion);
        let at_end = transform_to_end(&p, &motion);
        assert_relative_eq!(
            at_start.position(),
            motion.transform_point(&at_end.position()),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_half_sweep_translation_interpolated() {
        let motion = Pose6D::new(0.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        let p = point_at(0.0, 5.0, 0.0, 0.5);
        let moved = transform_to_start(&p, &motion);
        assert_relative_eq!(moved.position(), Vector3::new(0.5, 5.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_world_transform_keeps_attributes() {
        let world = Pose6D::new(0.0, 0.0, std::f64::consts::FRAC_PI_2, 1.0, 0.0, 0.0);
        let mut p = point_at(1.0, 0.0, 0.0, 0.2);
        p.intensity = 9.0;
        p.scan_line = 5;

        let moved = transform_to_world(&p, &world);
        assert_relative_eq!(moved.position(), Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
        assert_eq!(moved.scan_line, 5);
        assert_relative_eq!(moved.intensity, 9.0);
        assert_relative_eq!(moved.time_offset, 0.2);
    }
}
