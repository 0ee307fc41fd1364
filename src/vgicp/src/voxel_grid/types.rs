//! Type definitions for the target voxel grid.

use nalgebra::{Matrix3, Vector3};

/// Configuration for voxel grid construction.
#[derive(Debug, Clone)]
pub struct VoxelGridConfig {
    /// Voxel side length in meters.
    pub resolution: f32,
    /// Minimum number of points for a voxel to carry a distribution.
    /// Sparser voxels are discarded.
    pub min_points_per_voxel: usize,
    /// Small covariance eigenvalues are raised to this fraction of the largest.
    pub eigenvalue_ratio_threshold: f64,
}

impl Default for VoxelGridConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            min_points_per_voxel: 5,
            eigenvalue_ratio_threshold: 0.01,
        }
    }
}

/// Gaussian summary of the map points falling into one voxel.
#[derive(Debug, Clone)]
pub struct Voxel {
    pub mean: Vector3<f64>,
    /// Regularized sample covariance.
    pub covariance: Matrix3<f64>,
    pub point_count: usize,
}

impl Voxel {
    /// Build a voxel from accumulated first and second moments.
    ///
    /// Returns `None` when the voxel is too sparse or its covariance
    /// collapses to zero (all points identical).
    pub fn from_moments(
        sum: &Vector3<f64>,
        sum_outer: &Matrix3<f64>,
        count: usize,
        config: &VoxelGridConfig,
    ) -> Option<Self> {
        if count < config.min_points_per_voxel.max(2) {
            return None;
        }

        let n = count as f64;
        let mean = sum / n;
        let covariance = (sum_outer - mean * mean.transpose() * n) / (n - 1.0);
        let covariance = clamp_eigenvalues(&covariance, config.eigenvalue_ratio_threshold)?;

        Some(Self {
            mean,
            covariance,
            point_count: count,
        })
    }
}

/// Raise eigenvalues below `ratio * max_eigenvalue` and rebuild the matrix.
///
/// Planar voxels otherwise yield a covariance that is singular along the
/// surface normal.
pub fn clamp_eigenvalues(cov: &Matrix3<f64>, ratio: f64) -> Option<Matrix3<f64>> {
    let eigen = cov.symmetric_eigen();
    let max_eigenvalue = eigen.eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    if max_eigenvalue <= 0.0 || !max_eigenvalue.is_finite() {
        return None;
    }

    let floor = max_eigenvalue * ratio;
    let clamped = eigen.eigenvalues.map(|ev| ev.max(floor));
    let v = &eigen.eigenvectors;
    Some(v * Matrix3::from_diagonal(&clamped) * v.transpose())
}

/// Integer voxel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoxelCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Voxel containing `point` for a grid with the given inverse resolution.
    pub fn from_point(point: &[f32; 3], inv_resolution: f32) -> Self {
        Self {
            x: (point[0] * inv_resolution).floor() as i32,
            y: (point[1] * inv_resolution).floor() as i32,
            z: (point[2] * inv_resolution).floor() as i32,
        }
    }
}
