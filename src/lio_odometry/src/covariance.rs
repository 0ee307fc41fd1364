//! Pose covariance from registration and matrix hygiene helpers.

use nalgebra::{Matrix3, Matrix6, Rotation3};

use crate::config::VarianceFloor;

/// Laplace approximation of the registration covariance.
///
/// The inverse Gauss-Newton Hessian is scaled, its diagonal floored, and
/// its translation block rotated from the body frame of the result pose
/// into the world frame. Rotation stays in body (right-perturbation)
/// coordinates. A singular Hessian yields unit variances.
pub fn registration_covariance(
    hessian: &Matrix6<f64>,
    rotation: &Rotation3<f64>,
    scale: f64,
    floor: &VarianceFloor,
) -> Matrix6<f64> {
    let laplace = hessian
        .try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .map(|inv| inv * scale)
        .unwrap_or_else(Matrix6::identity);

    let adjusted = adjust_diagonal(&symmetrize(&laplace), floor);
    rotate_translation_block(&adjusted, rotation)
}

/// Raise the translation and rotation variances to at least the floor.
pub fn adjust_diagonal(covariance: &Matrix6<f64>, floor: &VarianceFloor) -> Matrix6<f64> {
    let mut out = *covariance;
    for i in 0..3 {
        out[(i, i)] = out[(i, i)].max(floor.translation);
        out[(i + 3, i + 3)] = out[(i + 3, i + 3)].max(floor.rotation);
    }
    out
}

/// `B C B^T` with `B = blockdiag(R, I)`.
pub fn rotate_translation_block(covariance: &Matrix6<f64>, rotation: &Rotation3<f64>) -> Matrix6<f64> {
    let mut b = Matrix6::identity();
    b.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation.matrix());
    b * covariance * b.transpose()
}

/// `B C B^T` with `B = blockdiag(I, R)`.
pub fn rotate_rotation_block(covariance: &Matrix6<f64>, rotation: &Matrix3<f64>) -> Matrix6<f64> {
    let mut b = Matrix6::identity();
    b.fixed_view_mut::<3, 3>(3, 3).copy_from(rotation);
    b * covariance * b.transpose()
}

pub fn symmetrize(m: &Matrix6<f64>) -> Matrix6<f64> {
    (m + m.transpose()) * 0.5
}

/// Closest symmetric positive semi-definite matrix in Frobenius norm.
///
/// Negative eigenvalues, which only arise from round-off, are clamped to
/// zero.
pub fn nearest_psd(m: &Matrix6<f64>) -> Matrix6<f64> {
    let eigen = symmetrize(m).symmetric_eigen();
    if eigen.eigenvalues.min() >= 0.0 {
        return symmetrize(m);
    }
    let clamped = eigen.eigenvalues.map(|v| v.max(0.0));
    let v = &eigen.eigenvectors;
    symmetrize(&(v * Matrix6::from_diagonal(&clamped) * v.transpose()))
}

pub fn is_symmetric_psd(m: &Matrix6<f64>, tolerance: f64) -> bool {
    let symmetric = (m - m.transpose()).amax() <= tolerance;
    symmetric && m.symmetric_eigen().eigenvalues.min() >= -tolerance
}
