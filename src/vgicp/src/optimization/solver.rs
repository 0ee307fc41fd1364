//! Levenberg-Marquardt loop for scan-to-map alignment.

use nalgebra::Isometry3;
use tracing::trace;

use super::linearize::{evaluate_error, linearize};
use super::newton::damped_step;
use super::types::{apply_increment, ConvergenceStatus, RegistrationResult, SolverConfig};
use crate::covariance::SourceCloud;
use crate::voxel_grid::VoxelGrid;

const LOGGER_NAME: &str = "vgicp.solver";

/// Damped Gauss-Newton solver over SE(3).
#[derive(Debug, Clone, Default)]
pub struct GaussNewtonSolver {
    config: SolverConfig,
}

impl GaussNewtonSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Align `source` to `target` starting from `initial_guess`.
    ///
    /// Each iteration linearizes at the current pose, then tries damped
    /// steps until one lowers the cost. A rejected step raises the damping
    /// tenfold; an accepted one lowers it. The loop ends when the accepted
    /// increment is smaller than `transformation_epsilon`.
    ///
    /// When no step lowers the cost, the pose counts as converged only if
    /// the solver already moved or the proposed step was negligible. A
    /// start pose that cannot be improved while the model asks for a large
    /// step is reported as `Stalled`.
    pub fn align(
        &self,
        source: &SourceCloud,
        target: &VoxelGrid,
        initial_guess: Isometry3<f64>,
    ) -> RegistrationResult {
        let cfg = &self.config;
        let mut pose = initial_guess;
        let mut lambda = cfg.initial_lambda;

        let mut lin = linearize(source, target, &pose, cfg.max_correspondence_distance);
        if lin.num_correspondences < cfg.min_correspondences.max(1) {
            return RegistrationResult::no_correspondences(initial_guess, lin.num_correspondences);
        }

        for iteration in 0..cfg.max_iterations {
            let mut accepted = None;
            let mut proposed_norm = None;

            for _ in 0..cfg.max_inner_iterations.max(1) {
                let Some(delta) = damped_step(&lin.gradient, &lin.hessian, lambda) else {
                    return self.finish(pose, ConvergenceStatus::SingularHessian, iteration, lin);
                };
                proposed_norm.get_or_insert(delta.norm());

                let candidate = apply_increment(&pose, &delta);
                let (error, count) =
                    evaluate_error(source, target, &candidate, cfg.max_correspondence_distance);

                if count >= cfg.min_correspondences && error <= lin.error {
                    lambda = (lambda / 10.0).max(1e-12);
                    accepted = Some((candidate, delta));
                    break;
                }
                lambda *= 10.0;
            }

            let Some((candidate, delta)) = accepted else {
                let status = no_descent_status(iteration, proposed_norm, cfg.transformation_epsilon);
                trace!(target: LOGGER_NAME, iteration, lambda, ?status, "no descent step found");
                return self.finish(pose, status, iteration + 1, lin);
            };

            pose = candidate;
            lin = linearize(source, target, &pose, cfg.max_correspondence_distance);
            trace!(
                target: LOGGER_NAME,
                iteration,
                error = lin.error,
                correspondences = lin.num_correspondences,
                delta_norm = delta.norm(),
                "step accepted"
            );

            if lin.num_correspondences < cfg.min_correspondences.max(1) {
                return RegistrationResult::no_correspondences(pose, lin.num_correspondences);
            }

            if delta.norm() < cfg.transformation_epsilon {
                return self.finish(pose, ConvergenceStatus::Converged, iteration + 1, lin);
            }
        }

        self.finish(pose, ConvergenceStatus::MaxIterations, cfg.max_iterations, lin)
    }

    fn finish(
        &self,
        pose: Isometry3<f64>,
        status: ConvergenceStatus,
        iterations: usize,
        lin: super::linearize::Linearization,
    ) -> RegistrationResult {
        let fitness = if lin.num_correspondences > 0 {
            lin.error / lin.num_correspondences as f64
        } else {
            f64::INFINITY
        };

        RegistrationResult {
            pose,
            status,
            iterations,
            hessian: lin.hessian,
            num_correspondences: lin.num_correspondences,
            fitness,
        }
    }
}

/// Outcome when no damped step lowered the cost in `iteration`.
fn no_descent_status(iteration: usize, proposed_norm: Option<f64>, epsilon: f64) -> ConvergenceStatus {
    let negligible = proposed_norm.is_some_and(|norm| norm < epsilon);
    if iteration > 0 || negligible {
        ConvergenceStatus::Converged
    } else {
        ConvergenceStatus::Stalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::{estimate_covariances, CovarianceConfig};
    use crate::filtering::voxel_downsample;
    use crate::test_utils::{make_half_cubic_pcd, transform_points};
    use nalgebra::{Translation3, UnitQuaternion};

    fn target() -> VoxelGrid {
        VoxelGrid::from_points(&make_half_cubic_pcd(20.0, 0.2), 1.0).unwrap()
    }

    /// Scan of the half cube seen from `sensor_pose`.
    fn scan_from(sensor_pose: &Isometry3<f64>) -> SourceCloud {
        let world = voxel_downsample(&make_half_cubic_pcd(20.0, 0.2), 0.5);
        let local = transform_points(&world, &sensor_pose.inverse());
        estimate_covariances(&local, &CovarianceConfig::default())
    }

    #[test]
    fn test_align_identity() {
        let solver = GaussNewtonSolver::default();
        let result = solver.align(&scan_from(&Isometry3::identity()), &target(), Isometry3::identity());

        assert!(result.status.is_converged(), "status {:?}", result.status);
        assert!(result.pose.translation.vector.norm() < 0.02);
        assert!(result.pose.rotation.angle() < 0.005);
    }

    #[test]
    fn test_align_recovers_offset() {
        let truth = Isometry3::from_parts(
            Translation3::new(0.3, -0.2, 0.1),
            UnitQuaternion::from_euler_angles(0.01, -0.01, 0.05),
        );
        let solver = GaussNewtonSolver::default();
        let result = solver.align(&scan_from(&truth), &target(), Isometry3::identity());

        assert!(result.status.is_converged(), "status {:?}", result.status);
        let error = result.pose.inverse() * truth;
        assert!(error.translation.vector.norm() < 0.05, "{error:?}");
        assert!(error.rotation.angle() < 0.01);
        assert!(result.num_correspondences > 100);
    }

    #[test]
    fn test_align_no_correspondences() {
        let solver = GaussNewtonSolver::default();
        let far = Isometry3::translation(1000.0, 1000.0, 1000.0);
        let result = solver.align(&scan_from(&Isometry3::identity()), &target(), far);

        assert_eq!(result.status, ConvergenceStatus::NoCorrespondences);
        assert_eq!(result.pose, far);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_iteration_cap() {
        let solver = GaussNewtonSolver::new(SolverConfig {
            max_iterations: 1,
            transformation_epsilon: 1e-12,
            ..Default::default()
        });
        let truth = Isometry3::translation(0.4, 0.0, 0.0);
        let result = solver.align(&scan_from(&truth), &target(), Isometry3::identity());

        assert!(matches!(
            result.status,
            ConvergenceStatus::MaxIterations | ConvergenceStatus::Converged
        ));
        assert!(result.iterations <= 1);
    }

    #[test]
    fn test_no_descent_from_initial_guess() {
        // Large step rejected before the pose ever moved.
        assert_eq!(no_descent_status(0, Some(0.8), 0.01), ConvergenceStatus::Stalled);
        // Already at the minimum.
        assert_eq!(no_descent_status(0, Some(1e-4), 0.01), ConvergenceStatus::Converged);
        // Earlier iterations made progress.
        assert_eq!(no_descent_status(3, Some(0.8), 0.01), ConvergenceStatus::Converged);
    }
}
