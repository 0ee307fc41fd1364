//! Type definitions for scan-to-map optimization.

use nalgebra::{Isometry3, Matrix3, Matrix6, Translation3, UnitQuaternion, Vector3, Vector6};

/// Configuration for the Gauss-Newton solver.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Maximum number of accepted iterations.
    pub max_iterations: usize,

    /// Convergence threshold on the norm of the pose increment.
    pub transformation_epsilon: f64,

    /// Source points farther than this from every voxel mean are unmatched.
    pub max_correspondence_distance: f64,

    /// Fewer matched points than this is reported as `NoCorrespondences`.
    pub min_correspondences: usize,

    /// Initial Levenberg-Marquardt damping added to the Hessian diagonal.
    pub initial_lambda: f64,

    /// Rejected steps allowed per iteration before giving up on it.
    pub max_inner_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            transformation_epsilon: 0.01,
            max_correspondence_distance: 1.0,
            min_correspondences: 20,
            initial_lambda: 1e-6,
            max_inner_iterations: 10,
        }
    }
}

/// Outcome of an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Increment norm fell below the epsilon.
    Converged,

    /// Iteration cap reached first.
    MaxIterations,

    /// Too few source points found a voxel.
    NoCorrespondences,

    /// The normal equations could not be solved.
    SingularHessian,

    /// No step from the initial guess lowered the cost although the
    /// linearization asked for a large one.
    Stalled,
}

impl ConvergenceStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceStatus::Converged)
    }
}

/// Result of one alignment.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Estimated transform from the source frame into the target frame.
    pub pose: Isometry3<f64>,

    pub status: ConvergenceStatus,

    pub iterations: usize,

    /// Gauss-Newton Hessian `sum(J^T W J)` at the final pose, in the
    /// `[rho, phi]` right-perturbation coordinates.
    pub hessian: Matrix6<f64>,

    pub num_correspondences: usize,

    /// Mean Mahalanobis error per correspondence at the final pose.
    pub fitness: f64,
}

impl RegistrationResult {
    /// Result that leaves the initial guess untouched.
    pub fn no_correspondences(initial_pose: Isometry3<f64>, num_correspondences: usize) -> Self {
        Self {
            pose: initial_pose,
            status: ConvergenceStatus::NoCorrespondences,
            iterations: 0,
            hessian: Matrix6::zeros(),
            num_correspondences,
            fitness: f64::INFINITY,
        }
    }
}

/// Skew-symmetric matrix such that `skew(a) * b == a.cross(&b)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Apply a right-perturbation increment `[rho, phi]` to a pose.
///
/// `t' = t + R * rho` and `R' = R * Exp(phi)`.
pub fn apply_increment(pose: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let rho = delta.fixed_rows::<3>(0).into_owned();
    let phi = delta.fixed_rows::<3>(3).into_owned();

    let translation = pose.translation.vector + pose.rotation * rho;
    let rotation = pose.rotation * UnitQuaternion::from_scaled_axis(phi);
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(!ConvergenceStatus::MaxIterations.is_converged());
        assert!(!ConvergenceStatus::Stalled.is_converged());
    }

    #[test]
    fn test_skew_matches_cross() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 4.0, -1.0);
        assert_relative_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn test_increment_translation_in_body_frame() {
        let pose = Isometry3::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
        );
        let delta = Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);

        let updated = apply_increment(&pose, &delta);
        assert_relative_eq!(
            updated.translation.vector,
            Vector3::new(1.0, 1.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_increment_rotation_composes() {
        let pose = Isometry3::identity();
        let delta = Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.3);
        let updated = apply_increment(&apply_increment(&pose, &delta), &delta);
        assert_relative_eq!(updated.rotation.euler_angles().2, 0.6, epsilon = 1e-12);
    }
}
