//! Scan-to-map registration with a shared, lock-guarded matcher.
//!
//! The registration object is reachable only through [`ScanMatcher`]. The
//! processing thread aligns under the lock and the map manager installs a
//! rebuilt target under the same lock, so neither ever observes a target
//! in the middle of being replaced.

use std::sync::Arc;

use nalgebra::{Isometry3, Matrix6};
use parking_lot::Mutex;
use tracing::{debug, warn};
use vgicp::{ConvergenceStatus, Vgicp, VoxelGrid};

use crate::config::{LioConfig, VarianceFloor};
use crate::covariance::registration_covariance;
use crate::error::LioError;

const LOGGER_NAME: &str = "lio_odometry.scan_matcher";

/// Outcome of one registration.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Refined pose, or the initial guess when registration failed.
    pub pose: Isometry3<f64>,
    pub success: bool,
    /// `None` when registration could not run at all (no map, empty scan).
    pub status: Option<ConvergenceStatus>,
    pub iterations: usize,
    pub num_correspondences: usize,
    /// Mean weighted residual; lower is better.
    pub fitness: f64,
    /// Pose covariance over `[world position, body rotation]`.
    pub covariance: Matrix6<f64>,
}

impl MatchResult {
    fn failed(initial_guess: Isometry3<f64>, status: Option<ConvergenceStatus>) -> Self {
        Self {
            pose: initial_guess,
            success: false,
            status,
            iterations: 0,
            num_correspondences: 0,
            fitness: f64::INFINITY,
            covariance: Matrix6::identity(),
        }
    }
}

/// Cloneable handle to the shared registration object.
#[derive(Clone)]
pub struct ScanMatcher {
    registration: Arc<Mutex<Vgicp>>,
    min_correspondences: usize,
    max_fitness: f64,
    covariance_scale: f64,
    variance_floor: VarianceFloor,
}

impl std::fmt::Debug for ScanMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanMatcher")
            .field("min_correspondences", &self.min_correspondences)
            .field("max_fitness", &self.max_fitness)
            .field("has_target", &self.has_target())
            .finish()
    }
}

impl ScanMatcher {
    pub fn new(config: &LioConfig) -> Result<Self, LioError> {
        let vgicp = Vgicp::with_config(config.registration_config())
            .map_err(|e| LioError::Matcher(format!("{e:#}")))?;

        Ok(Self {
            registration: Arc::new(Mutex::new(vgicp)),
            min_correspondences: config.min_correspondences,
            max_fitness: config.max_registration_fitness,
            covariance_scale: config.registration_covariance_scale,
            variance_floor: config.min_registration_variance.clone(),
        })
    }

    /// Run `f` with exclusive access to the registration object.
    pub fn with_registration<R>(&self, f: impl FnOnce(&mut Vgicp) -> R) -> R {
        let mut guard = self.registration.lock();
        f(&mut guard)
    }

    pub fn has_target(&self) -> bool {
        self.with_registration(|reg| reg.has_target())
    }

    /// Install a new target grid.
    pub fn set_target_grid(&self, grid: Arc<VoxelGrid>) {
        self.with_registration(|reg| reg.set_target_grid(grid));
    }

    /// Align `points` (sensor frame) to the map starting at `initial_guess`.
    ///
    /// Failure is a value, never an error: the result then carries the
    /// initial guess and `success == false`. A converged alignment is still
    /// rejected when too few points matched or the mean weighted residual
    /// exceeds the fitness cap.
    pub fn align(&self, points: &[[f32; 3]], initial_guess: &Isometry3<f64>) -> MatchResult {
        let aligned = self.with_registration(|reg| {
            if !reg.has_target() || points.is_empty() {
                return None;
            }
            Some(reg.align(points, *initial_guess))
        });

        let result = match aligned {
            None => return MatchResult::failed(*initial_guess, None),
            Some(Err(e)) => {
                warn!(target: LOGGER_NAME, "registration error: {e:#}");
                return MatchResult::failed(*initial_guess, None);
            }
            Some(Ok(result)) => result,
        };

        let success = result.converged
            && result.num_correspondences >= self.min_correspondences
            && result.fitness <= self.max_fitness;
        if !success {
            debug!(
                target: LOGGER_NAME,
                status = ?result.status,
                correspondences = result.num_correspondences,
                fitness = result.fitness,
                iterations = result.iterations,
                "registration rejected"
            );
            return MatchResult {
                iterations: result.iterations,
                num_correspondences: result.num_correspondences,
                fitness: result.fitness,
                ..MatchResult::failed(*initial_guess, Some(result.status))
            };
        }

        let covariance = registration_covariance(
            &result.hessian,
            &result.pose.rotation.to_rotation_matrix(),
            self.covariance_scale,
            &self.variance_floor,
        );

        MatchResult {
            pose: result.pose,
            success,
            status: Some(result.status),
            iterations: result.iterations,
            num_correspondences: result.num_correspondences,
            fitness: result.fitness,
            covariance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::is_symmetric_psd;
    use crate::simulation::make_room;
    use nalgebra::{Translation3, UnitQuaternion};
    use std::f64::consts::PI;
    use vgicp::filtering::voxel_downsample;
    use vgicp::test_utils::{make_half_cubic_pcd, transform_points};

    /// Half cube shifted to x in [10, 30].
    fn room() -> Vec<[f32; 3]> {
        transform_points(
            &make_half_cubic_pcd(20.0, 0.2),
            &Isometry3::translation(10.0, 0.0, 0.0),
        )
    }

    fn matcher_with_room() -> ScanMatcher {
        let matcher = ScanMatcher::new(&LioConfig::default()).unwrap();
        let grid = matcher
            .with_registration(|reg| reg.build_target(&room()))
            .unwrap();
        matcher.set_target_grid(Arc::new(grid));
        matcher
    }

    fn scan_from(pose: &Isometry3<f64>) -> Vec<[f32; 3]> {
        transform_points(&voxel_downsample(&room(), 0.5), &pose.inverse())
    }

    #[test]
    fn test_no_target_fails_gracefully() {
        let matcher = ScanMatcher::new(&LioConfig::default()).unwrap();
        let guess = Isometry3::translation(1.0, 0.0, 0.0);
        let result = matcher.align(&[[0.0, 0.0, 0.0]], &guess);
        assert!(!result.success);
        assert_eq!(result.pose, guess);
        assert!(result.status.is_none());
    }

    #[test]
    fn test_small_offset_succeeds() {
        let matcher = matcher_with_room();
        let truth = Isometry3::from_parts(
            Translation3::new(0.2, -0.1, 0.05),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.02),
        );
        let result = matcher.align(&scan_from(&truth), &Isometry3::identity());

        assert!(result.success, "status {:?}", result.status);
        assert!((result.pose.inverse() * truth).translation.vector.norm() < 0.05);
        assert!(is_symmetric_psd(&result.covariance, 1e-12));
    }

    #[test]
    fn test_half_turn_scan_fails() {
        let matcher = matcher_with_room();
        let flipped = Isometry3::rotation(nalgebra::Vector3::new(0.0, 0.0, PI));
        let guess = Isometry3::identity();
        let result = matcher.align(&scan_from(&flipped), &guess);

        assert!(!result.success);
        assert_eq!(result.pose, guess);
    }

    fn matcher_in_sim_room(config: &LioConfig) -> ScanMatcher {
        let matcher = ScanMatcher::new(config).unwrap();
        let grid = matcher
            .with_registration(|reg| reg.build_target(&make_room(0.25)))
            .unwrap();
        matcher.set_target_grid(Arc::new(grid));
        matcher
    }

    #[test]
    fn test_half_turn_in_sim_room_fails() {
        let matcher = matcher_in_sim_room(&LioConfig::default());
        let flipped = Isometry3::rotation(nalgebra::Vector3::new(0.0, 0.0, PI));
        let scan = transform_points(&voxel_downsample(&make_room(0.25), 0.5), &flipped.inverse());
        let guess = Isometry3::identity();
        let result = matcher.align(&scan, &guess);

        assert!(!result.success);
        assert_eq!(result.status, Some(ConvergenceStatus::Stalled));
        assert_eq!(result.pose, guess);
        assert!(result.num_correspondences > 0);
    }

    #[test]
    fn test_fitness_cap_rejects_converged_match() {
        let scan = voxel_downsample(&make_room(0.25), 0.5);
        let accepted = matcher_in_sim_room(&LioConfig::default()).align(&scan, &Isometry3::identity());
        assert!(accepted.success, "status {:?}", accepted.status);
        assert!(accepted.fitness < 3.0);

        let strict = LioConfig {
            max_registration_fitness: accepted.fitness / 2.0,
            ..LioConfig::default()
        };
        let rejected = matcher_in_sim_room(&strict).align(&scan, &Isometry3::identity());
        assert!(!rejected.success);
        assert_eq!(rejected.status, Some(ConvergenceStatus::Converged));
        approx::assert_relative_eq!(rejected.fitness, accepted.fitness, epsilon = 1e-6);
    }

    #[test]
    fn test_concurrent_target_swap() {
        let matcher = matcher_with_room();
        let swapper = {
            let matcher = matcher.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    let grid = matcher
                        .with_registration(|reg| reg.build_target(&room()))
                        .unwrap();
                    matcher.set_target_grid(Arc::new(grid));
                }
            })
        };
        for _ in 0..3 {
            let result = matcher.align(&scan_from(&Isometry3::identity()), &Isometry3::identity());
            assert!(result.success);
        }
        swapper.join().unwrap();
    }
}
