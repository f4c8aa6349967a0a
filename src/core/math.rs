//! Rotation math for 6-DoF pose estimation.
//!
//! Rotations are parameterized by ZYX Euler angles (`R = Rz·Ry·Rx`), the
//! convention used by the analytic Jacobians of the Levenberg–Marquardt
//! solver. Angle extraction guards against gimbal lock; inter-frame motions
//! stay far from it in practice because excessive motion is rejected
//! upstream.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Vector3};

/// Normalize angle to (-π, π].
#[inline]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a < -PI {
        a += 2.0 * PI;
    }
    a
}

/// Rotation matrix from ZYX Euler angles: `R = Rz(rz)·Ry(ry)·Rx(rx)`.
pub fn rotation_matrix(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    Matrix3::new(
        cy * cz,
        sx * sy * cz - cx * sz,
        cx * sy * cz + sx * sz,
        cy * sz,
        sx * sy * sz + cx * cz,
        cx * sy * sz - sx * cz,
        -sy,
        sx * cy,
        cx * cy,
    )
}

/// Partial derivative of the rotation matrix with respect to `rx`.
pub fn rotation_derivative_rx(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    Matrix3::new(
        0.0,
        cx * sy * cz + sx * sz,
        -sx * sy * cz + cx * sz,
        0.0,
        cx * sy * sz - sx * cz,
        -sx * sy * sz - cx * cz,
        0.0,
        cx * cy,
        -sx * cy,
    )
}

/// Partial derivative of the rotation matrix with respect to `ry`.
pub fn rotation_derivative_ry(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    Matrix3::new(
        -sy * cz,
        sx * cy * cz,
        cx * cy * cz,
        -sy * sz,
        sx * cy * sz,
        cx * cy * sz,
        -cy,
        -sx * sy,
        -cx * sy,
    )
}

/// Partial derivative of the rotation matrix with respect to `rz`.
pub fn rotation_derivative_rz(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    Matrix3::new(
        -cy * sz,
        -sx * sy * sz - cx * cz,
        -cx * sy * sz + sx * cz,
        cy * cz,
        sx * sy * cz - cx * sz,
        cx * sy * cz + sx * sz,
        0.0,
        0.0,
        0.0,
    )
}

/// Recover ZYX Euler angles from a rotation matrix.
///
/// Returns `(rx, ry, rz)`. At gimbal lock (`|ry| = π/2`) the split between
/// `rx` and `rz` is underdetermined; `rz` is fixed to 0 there.
pub fn euler_angles(r: &Matrix3<f64>) -> (f64, f64, f64) {
    let ry = (-r[(2, 0)]).clamp(-1.0, 1.0).asin();

    if ry.cos().abs() > 1e-9 {
        let rx = r[(2, 1)].atan2(r[(2, 2)]);
        let rz = r[(1, 0)].atan2(r[(0, 0)]);
        (rx, ry, rz)
    } else {
        // Gimbal lock: only rx ± rz is observable.
        let rx = r[(0, 1)].atan2(r[(1, 1)]) * ry.signum();
        (rx, ry, 0.0)
    }
}

/// Eigen decomposition of a symmetric 3×3 matrix, sorted by decreasing
/// eigenvalue.
///
/// Returns `(eigenvalues, eigenvectors)` with `eigenvalues[0] >=
/// eigenvalues[1] >= eigenvalues[2]` and `eigenvectors[i]` the unit
/// eigenvector of `eigenvalues[i]`.
pub fn sorted_symmetric_eigen(m: &Matrix3<f64>) -> ([f64; 3], [Vector3<f64>; 3]) {
    let eigen = m.symmetric_eigen();

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let values = [
        eigen.eigenvalues[order[0]],
        eigen.eigenvalues[order[1]],
        eigen.eigenvalues[order[2]],
    ];
    let vectors = [
        eigen.eigenvectors.column(order[0]).into_owned(),
        eigen.eigenvectors.column(order[1]).into_owned(),
        eigen.eigenvectors.column(order[2]).into_owned(),
    ];

    (values, vectors)
}

/// Covariance matrix of a set of 3D points around their centroid.
///
/// Returns `(centroid, covariance)`; the covariance is the mean of outer
/// products, not the unbiased estimate.
pub fn point_covariance(points: &[Vector3<f64>]) -> (Vector3<f64>, Matrix3<f64>) {
    let n = points.len().max(1) as f64;

    let mut centroid = Vector3::zeros();
    for p in points {
        centroid += p;
    }
    centroid /= n;

    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= n;

    (centroid, cov)
}
