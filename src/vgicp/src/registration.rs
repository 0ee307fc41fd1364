//! High-level VGICP registration API.
//!
//! ```ignore
//! use vgicp::Vgicp;
//! use nalgebra::Isometry3;
//!
//! let mut vgicp = Vgicp::builder().resolution(1.0).num_threads(4).build()?;
//! vgicp.set_target(&map_points)?;
//! let result = vgicp.align(&scan_points, Isometry3::identity())?;
//! println!("converged: {}, fitness: {}", result.converged, result.fitness);
//! ```

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use nalgebra::{Isometry3, Matrix6};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::covariance::{estimate_covariances, CovarianceConfig};
use crate::optimization::{ConvergenceStatus, GaussNewtonSolver, SolverConfig};
use crate::voxel_grid::{VoxelGrid, VoxelGridConfig};

const LOGGER_NAME: &str = "vgicp";

/// Configuration for [`Vgicp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VgicpConfig {
    /// Target voxel size in meters.
    pub resolution: f32,

    pub max_iterations: usize,

    /// Convergence threshold on the pose increment norm.
    pub transformation_epsilon: f64,

    /// Source points farther than this from every voxel mean are ignored.
    pub max_correspondence_distance: f64,

    /// Neighbours used for per-point source covariances.
    pub correspondence_randomness: usize,

    /// Below this many matched points the alignment is reported as failed.
    pub min_correspondences: usize,

    /// Worker threads, 0 for the rayon default.
    pub num_threads: usize,

    /// Voxels with fewer points carry no distribution.
    pub min_points_per_voxel: usize,
}

impl Default for VgicpConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 30,
            transformation_epsilon: 0.01,
            max_correspondence_distance: 1.0,
            correspondence_randomness: 20,
            min_correspondences: 20,
            num_threads: 0,
            min_points_per_voxel: 5,
        }
    }
}

impl VgicpConfig {
    fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            max_iterations: self.max_iterations,
            transformation_epsilon: self.transformation_epsilon,
            max_correspondence_distance: self.max_correspondence_distance,
            min_correspondences: self.min_correspondences,
            ..Default::default()
        }
    }

    /// Grid settings matching this configuration.
    pub fn voxel_config(&self) -> VoxelGridConfig {
        VoxelGridConfig {
            resolution: self.resolution,
            min_points_per_voxel: self.min_points_per_voxel,
            ..Default::default()
        }
    }

    fn covariance_config(&self) -> CovarianceConfig {
        CovarianceConfig {
            k_neighbors: self.correspondence_randomness,
            search_radius: (self.resolution * 1.5).max(0.5),
        }
    }
}

/// Builder for [`Vgicp`].
#[derive(Debug, Clone, Default)]
pub struct VgicpBuilder {
    config: VgicpConfig,
}

impl VgicpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolution(mut self, resolution: f32) -> Self {
        self.config.resolution = resolution;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn transformation_epsilon(mut self, epsilon: f64) -> Self {
        self.config.transformation_epsilon = epsilon;
        self
    }

    pub fn max_correspondence_distance(mut self, distance: f64) -> Self {
        self.config.max_correspondence_distance = distance;
        self
    }

    pub fn correspondence_randomness(mut self, k: usize) -> Self {
        self.config.correspondence_randomness = k;
        self
    }

    pub fn min_correspondences(mut self, count: usize) -> Self {
        self.config.min_correspondences = count;
        self
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.config.num_threads = num_threads;
        self
    }

    pub fn min_points_per_voxel(mut self, min_points: usize) -> Self {
        self.config.min_points_per_voxel = min_points;
        self
    }

    pub fn build(self) -> Result<Vgicp> {
        Vgicp::with_config(self.config)
    }
}

/// Result of [`Vgicp::align`].
#[derive(Debug, Clone)]
pub struct AlignResult {
    /// Source-to-target transform.
    pub pose: Isometry3<f64>,

    /// Whether the optimizer reached its convergence criterion.
    pub converged: bool,

    pub status: ConvergenceStatus,

    pub iterations: usize,

    /// Gauss-Newton Hessian at the final pose in `[rho, phi]` coordinates.
    pub hessian: Matrix6<f64>,

    pub num_correspondences: usize,

    /// Mean Mahalanobis error per correspondence.
    pub fitness: f64,
}

/// Voxelized GICP scan matcher.
///
/// Holds the target grid behind an `Arc` so a map built elsewhere can be
/// installed without copying.
pub struct Vgicp {
    config: VgicpConfig,
    solver: GaussNewtonSolver,
    pool: ThreadPool,
    target: Option<Arc<VoxelGrid>>,
}

impl std::fmt::Debug for Vgicp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vgicp")
            .field("config", &self.config)
            .field("threads", &self.pool.current_num_threads())
            .field("target_voxels", &self.target.as_ref().map(|t| t.len()))
            .finish()
    }
}

impl Vgicp {
    /// Matcher with default settings and the given resolution.
    pub fn new(resolution: f32) -> Result<Self> {
        Self::with_config(VgicpConfig {
            resolution,
            ..Default::default()
        })
    }

    pub fn with_config(config: VgicpConfig) -> Result<Self> {
        if config.resolution <= 0.0 || !config.resolution.is_finite() {
            bail!("Voxel resolution must be positive, got {}", config.resolution);
        }
        if config.max_correspondence_distance <= 0.0 {
            bail!(
                "Correspondence distance must be positive, got {}",
                config.max_correspondence_distance
            );
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()?;

        Ok(Self {
            solver: GaussNewtonSolver::new(config.solver_config()),
            config,
            pool,
            target: None,
        })
    }

    pub fn builder() -> VgicpBuilder {
        VgicpBuilder::new()
    }

    pub fn config(&self) -> &VgicpConfig {
        &self.config
    }

    pub fn has_target(&self) -> bool {
        self.target.is_some()
    }

    /// Build a target grid from map points without installing it.
    pub fn build_target(&self, points: &[[f32; 3]]) -> Result<VoxelGrid> {
        if points.is_empty() {
            bail!("Target point cloud is empty");
        }
        let config = self.config.voxel_config();
        self.pool
            .install(|| VoxelGrid::from_points_with_config(points, config))
    }

    /// Voxelize `points` and use them as the target.
    pub fn set_target(&mut self, points: &[[f32; 3]]) -> Result<()> {
        let grid = self.build_target(points)?;
        debug!(
            target: LOGGER_NAME,
            points = points.len(),
            voxels = grid.len(),
            "target set"
        );
        self.target = Some(Arc::new(grid));
        Ok(())
    }

    /// Install a prebuilt target grid.
    pub fn set_target_grid(&mut self, grid: Arc<VoxelGrid>) {
        self.target = Some(grid);
    }

    /// Align `source_points` to the target starting from `initial_guess`.
    ///
    /// Fails on missing inputs or a non-finite initial guess. A poor alignment is reported through
    /// `converged` and `status`.
    pub fn align(
        &self,
        source_points: &[[f32; 3]],
        initial_guess: Isometry3<f64>,
    ) -> Result<AlignResult> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| anyhow!("No target set. Call set_target() first."))?;

        if source_points.is_empty() {
            bail!("Source point cloud is empty");
        }

        let guess_finite = initial_guess
            .translation
            .vector
            .iter()
            .chain(initial_guess.rotation.coords.iter())
            .all(|v| v.is_finite());
        if !guess_finite {
            bail!("Initial guess is not finite");
        }

        let covariance_config = self.config.covariance_config();
        let result = self.pool.install(|| {
            let source = estimate_covariances(source_points, &covariance_config);
            self.solver.align(&source, target, initial_guess)
        });

        debug!(
            target: LOGGER_NAME,
            status = ?result.status,
            iterations = result.iterations,
            correspondences = result.num_correspondences,
            fitness = result.fitness,
            "alignment finished"
        );

        Ok(AlignResult {
            pose: result.pose,
            converged: result.status.is_converged(),
            status: result.status,
            iterations: result.iterations,
            hessian: result.hessian,
            num_correspondences: result.num_correspondences,
            fitness: result.fitness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::voxel_downsample;
    use crate::test_utils::{make_half_cubic_pcd, transform_points};
    use nalgebra::{Translation3, UnitQuaternion};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn matcher_with_map() -> Vgicp {
        let mut vgicp = Vgicp::builder().resolution(1.0).num_threads(2).build().unwrap();
        vgicp.set_target(&make_half_cubic_pcd(20.0, 0.2)).unwrap();
        vgicp
    }

    #[test]
    fn test_builder_rejects_bad_resolution() {
        assert!(Vgicp::builder().resolution(0.0).build().is_err());
        assert!(Vgicp::builder().resolution(-2.0).build().is_err());
    }

    #[test]
    fn test_align_without_target_fails() {
        let vgicp = Vgicp::new(1.0).unwrap();
        assert!(!vgicp.has_target());
        assert!(vgicp.align(&[[0.0, 0.0, 0.0]], Isometry3::identity()).is_err());
    }

    #[test]
    fn test_align_empty_source_fails() {
        let vgicp = matcher_with_map();
        assert!(vgicp.align(&[], Isometry3::identity()).is_err());
    }

    #[test]
    fn test_align_non_finite_guess_fails() {
        let vgicp = matcher_with_map();
        let guess = Isometry3::translation(f64::NAN, 0.0, 0.0);
        assert!(vgicp.align(&[[1.0, 2.0, 0.0]], guess).is_err());
    }

    #[test]
    fn test_align_noisy_scan() {
        let vgicp = matcher_with_map();
        let truth = Isometry3::from_parts(
            Translation3::new(0.2, 0.15, -0.1),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.03),
        );

        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0f32, 0.01).unwrap();
        let world: Vec<[f32; 3]> = voxel_downsample(&make_half_cubic_pcd(20.0, 0.2), 0.4)
            .into_iter()
            .map(|p| {
                [
                    p[0] + noise.sample(&mut rng),
                    p[1] + noise.sample(&mut rng),
                    p[2] + noise.sample(&mut rng),
                ]
            })
            .collect();
        let scan = transform_points(&world, &truth.inverse());

        let result = vgicp.align(&scan, Isometry3::identity()).unwrap();
        assert!(result.converged, "status {:?}", result.status);

        let error = result.pose.inverse() * truth;
        assert!(error.translation.vector.norm() < 0.05);
        assert!(error.rotation.angle() < 0.01);
    }

    #[test]
    fn test_far_guess_reports_no_correspondences() {
        let vgicp = matcher_with_map();
        let scan = voxel_downsample(&make_half_cubic_pcd(20.0, 0.2), 1.0);
        let result = vgicp
            .align(&scan, Isometry3::translation(-500.0, 0.0, 0.0))
            .unwrap();

        assert!(!result.converged);
        assert_eq!(result.status, ConvergenceStatus::NoCorrespondences);
    }

    #[test]
    fn test_shared_target_grid() {
        let mut first = Vgicp::new(1.0).unwrap();
        let grid = Arc::new(first.build_target(&make_half_cubic_pcd(20.0, 0.2)).unwrap());
        assert!(!first.has_target());

        let mut second = Vgicp::new(1.0).unwrap();
        first.set_target_grid(Arc::clone(&grid));
        second.set_target_grid(Arc::clone(&grid));
        assert!(first.has_target() && second.has_target());
        assert_eq!(Arc::strong_count(&grid), 3);

        let scan = voxel_downsample(&make_half_cubic_pcd(20.0, 0.2), 0.5);
        let a = first.align(&scan, Isometry3::identity()).unwrap();
        let b = second.align(&scan, Isometry3::identity()).unwrap();
        assert!(a.converged && b.converged);
    }
}
