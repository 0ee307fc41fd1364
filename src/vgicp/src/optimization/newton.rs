//! Damped Gauss-Newton step computation.
//!
//! Solves `(H + lambda * I) delta = -g`. Cholesky is tried first since the
//! Gauss-Newton Hessian is positive semi-definite; SVD is the fallback for
//! rank-deficient systems.

use nalgebra::{Matrix6, Vector6};

/// Singular values below this are treated as zero.
const SVD_TOLERANCE: f64 = 1e-10;

/// Compute the damped step, or `None` if the system is singular.
pub fn damped_step(
    gradient: &Vector6<f64>,
    hessian: &Matrix6<f64>,
    lambda: f64,
) -> Option<Vector6<f64>> {
    let damped = hessian + Matrix6::identity() * lambda;
    let neg_gradient = -gradient;

    if let Some(chol) = damped.cholesky() {
        let step = chol.solve(&neg_gradient);
        if step.iter().all(|v| v.is_finite()) {
            return Some(step);
        }
    }

    let svd = damped.svd(true, true);
    if svd.singular_values.max() < SVD_TOLERANCE {
        return None;
    }
    svd.solve(&neg_gradient, SVD_TOLERANCE)
        .ok()
        .filter(|step| step.iter().all(|v| v.is_finite()))
}
