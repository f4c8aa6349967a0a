//! 6-DoF rigid-body pose.
//!
//! A pose is stored as ZYX Euler angles plus a translation, matching the
//! parameterization of the Levenberg–Marquardt solver. Composition and
//! inversion go through rotation matrices so that angle extraction stays
//! consistent with [`crate::core::math::euler_angles`].

use nalgebra::{Matrix3, Matrix4, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::core::math;

/// A rigid transform in 3D: rotation as ZYX Euler angles, translation in
/// meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose6D {
    /// Rotation about X in radians.
    pub rx: f64,
    /// Rotation about Y in radians.
    pub ry: f64,
    /// Rotation about Z in radians.
    pub rz: f64,
    /// Translation along X in meters.
    pub tx: f64,
    /// Translation along Y in meters.
    pub ty: f64,
    /// Translation along Z in meters.
    pub tz: f64,
}

impl Pose6D {
    pub fn new(rx: f64, ry: f64, rz: f64, tx: f64, ty: f64, tz: f64) -> Self {
        Self {
            rx,
            ry,
            rz,
            tx,
            ty,
            tz,
        }
    }

    /// Identity transform.
    #[inline]
    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
    }

    /// Build from a rotation matrix and a translation vector.
    pub fn from_rotation_translation(r: &Matrix3<f64>, t: &Vector3<f64>) -> Self {
        let (rx, ry, rz) = math::euler_angles(r);
        Self::new(rx, ry, rz, t.x, t.y, t.z)
    }

    /// Rotation part as a matrix.
    #[inline]
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        math::rotation_matrix(self.rx, self.ry, self.rz)
    }

    /// Translation part as a vector.
    #[inline]
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.tx, self.ty, self.tz)
    }

    /// Norm of the translation part.
    #[inline]
    pub fn translation_norm(&self) -> f64 {
        self.translation().norm()
    }

    /// Apply the transform to a point: `R·p + t`.
    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * p + self.translation()
    }

    /// Compose two transforms: `self ∘ other` applies `other` first, then
    /// `self`.
    pub fn compose(&self, other: &Pose6D) -> Pose6D {
        let r = self.rotation_matrix() * other.rotation_matrix();
        let t = self.rotation_matrix() * other.translation() + self.translation();
        Pose6D::from_rotation_translation(&r, &t)
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Pose6D {
        let r_inv = self.rotation_matrix().transpose();
        let t_inv = -(r_inv * self.translation());
        Pose6D::from_rotation_translation(&r_inv, &t_inv)
    }

    /// Interpolate linearly toward the identity: angles and translation
    /// scaled by `s ∈ [0, 1]`.
    ///
    /// Exact for single-axis rotations; second-order accurate in the
    /// rotation magnitude otherwise, which covers the small inter-frame
    /// motions this is used on.
    #[inline]
    pub fn scaled(&self, s: f64) -> Pose6D {
        Pose6D::new(
            self.rx * s,
            self.ry * s,
            self.rz * s,
            self.tx * s,
            self.ty * s,
            self.tz * s,
        )
    }

    /// Homogeneous 4×4 matrix.
    pub fn matrix4(&self) -> Matrix4<f64> {
        let r = self.rotation_matrix();
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation());
        m
    }

    /// Pack as `(rx, ry, rz, tx, ty, tz)`.
    #[inline]
    pub fn as_vector(&self) -> Vector6<f64> {
        Vector6::new(self.rx, self.ry, self.rz, self.tx, self.ty, self.tz)
    }

    /// Unpack from `(rx, ry, rz, tx, ty, tz)`.
    #[inline]
    pub fn from_vector(v: &Vector6<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }
}

impl Default for Pose6D {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(Pose6D::identity().transform_point(&p), p, epsilon = 1e-15);
    }

    #[test]
    fn test_compose_with_identity() {
        let pose = Pose6D::new(0.1, -0.2, 0.3, 1.0, 2.0, 3.0);
        let composed = pose.compose(&Pose6D::identity());
        assert_relative_eq!(composed.as_vector(), pose.as_vector(), epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip() {
        let pose = Pose6D::new(0.4, 0.2, -0.7, 1.5, -2.0, 0.5);
        let round_trip = pose.compose(&pose.inverse());
        assert_relative_eq!(
            round_trip.as_vector(),
            Pose6D::identity().as_vector(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_transform_point_rotation_about_z() {
        let pose = Pose6D::new(0.0, 0.0, FRAC_PI_2, 1.0, 0.0, 0.0);
        let p = pose.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = Pose6D::new(0.1, 0.2, 0.3, 1.0, 0.0, -1.0);
        let b = Pose6D::new(-0.2, 0.1, 0.4, 0.5, 2.0, 0.0);
        let composed = a.compose(&b);
        assert_relative_eq!(
            composed.matrix4(),
            a.matrix4() * b.matrix4(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_scaled_endpoints() {
        let pose = Pose6D::new(0.2, -0.1, 0.3, 1.0, 2.0, 3.0);
        assert_relative_eq!(
            pose.scaled(0.0).as_vector(),
            Pose6D::identity().as_vector(),
            epsilon = 1e-15
        );
        assert_relative_eq!(pose.scaled(1.0).as_vector(), pose.as_vector(), epsilon = 1e-15);
    }

    #[test]
    fn test_rotation_matrix_orthonormal() {
        let pose = Pose6D::new(0.7, -0.6, 2.1, 0.0, 0.0, 0.0);
        let r = pose.rotation_matrix();
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
    }
}
