//! Per-point covariance estimation for source scans.
//!
//! Every source point is modelled as a small Gaussian whose shape follows
//! the local surface. The covariance of the k nearest neighbours is
//! normalized to a plane-like distribution (eigenvalues 1, 1, epsilon),
//! which makes the registration cost behave like point-to-plane on flat
//! structure while staying well conditioned.

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::spatial::PointIndex;

/// Eigenvalue assigned along the surface normal after normalization.
const PLANE_EPSILON: f64 = 1e-3;

/// Minimum neighbours for a meaningful local covariance.
const MIN_NEIGHBORS: usize = 5;

/// Covariance estimation settings.
#[derive(Debug, Clone)]
pub struct CovarianceConfig {
    /// Number of nearest neighbours used per point.
    pub k_neighbors: usize,
    /// Neighbours farther than this are ignored.
    pub search_radius: f32,
}

impl Default for CovarianceConfig {
    fn default() -> Self {
        Self {
            k_neighbors: 20,
            search_radius: 1.5,
        }
    }
}

/// Source points in f64 together with their covariances.
#[derive(Debug, Clone)]
pub struct SourceCloud {
    pub points: Vec<Vector3<f64>>,
    pub covariances: Vec<Matrix3<f64>>,
}

impl SourceCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Estimate one covariance per point.
///
/// Points with fewer than five distinct neighbours inside the search
/// radius get an isotropic covariance.
pub fn estimate_covariances(points: &[[f32; 3]], config: &CovarianceConfig) -> SourceCloud {
    let as_f64: Vec<Vector3<f64>> = points
        .iter()
        .map(|p| Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect();

    let Some(index) = PointIndex::from_points(as_f64.iter().copied()) else {
        return SourceCloud {
            covariances: vec![Matrix3::identity(); as_f64.len()],
            points: as_f64,
        };
    };

    let radius = config.search_radius as f64;
    let k = config.k_neighbors.max(MIN_NEIGHBORS);

    let covariances = as_f64
        .par_iter()
        .map(|p| {
            let mut neighbors = index.within(p, radius);
            if neighbors.len() < MIN_NEIGHBORS {
                return Matrix3::identity();
            }
            neighbors.truncate(k);

            let n = neighbors.len() as f64;
            let mean = neighbors
                .iter()
                .fold(Vector3::zeros(), |acc, &(i, _)| acc + as_f64[i])
                / n;
            let cov = neighbors.iter().fold(Matrix3::zeros(), |acc, &(i, _)| {
                let d = as_f64[i] - mean;
                acc + d * d.transpose()
            }) / n;

            normalize_plane(&cov)
        })
        .collect();

    SourceCloud {
        points: as_f64,
        covariances,
    }
}

/// Replace the eigenvalues of `cov` by (epsilon, 1, 1), smallest first.
fn normalize_plane(cov: &Matrix3<f64>) -> Matrix3<f64> {
    let eigen = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let mut values = Vector3::repeat(1.0);
    values[order[0]] = PLANE_EPSILON;

    let v = &eigen.eigenvectors;
    v * Matrix3::from_diagonal(&values) * v.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::voxel_downsample;
    use crate::test_utils::{make_half_cubic_pcd, make_xy_plane};
    use approx::assert_relative_eq;

    #[test]
    fn test_plane_covariance_normal_is_thin() {
        let points = make_xy_plane(4.0, 0.2, 0.0);
        let cloud = estimate_covariances(&points, &CovarianceConfig::default());
        assert_eq!(cloud.covariances.len(), points.len());

        let center = points.len() / 2;
        let cov = cloud.covariances[center];
        assert_relative_eq!(cov[(2, 2)], PLANE_EPSILON, epsilon = 1e-6);
        assert_relative_eq!(cov[(0, 0)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(cov[(1, 1)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_isolated_point_gets_identity() {
        let points = vec![[0.0, 0.0, 0.0], [100.0, 0.0, 0.0]];
        let cloud = estimate_covariances(&points, &CovarianceConfig::default());
        assert_relative_eq!(cloud.covariances[0], Matrix3::identity());
    }

    #[test]
    fn test_noiseless_room_scan() {
        let room = make_half_cubic_pcd(10.0, 0.5);
        let downsampled = voxel_downsample(&room, 0.5);

        for points in [&room, &downsampled] {
            let cloud = estimate_covariances(points, &CovarianceConfig::default());
            assert_eq!(cloud.covariances.len(), points.len());
            assert!(cloud.covariances.iter().all(|c| c.iter().all(|v| v.is_finite())));
        }
    }

    #[test]
    fn test_repeated_points() {
        let mut points = vec![[0.0f32, 0.0, 0.0]; 100];
        points.extend((0..50).map(|i| [i as f32 * 0.05, 0.0, 0.0]));
        points.push([f32::NAN, 0.0, 0.0]);

        let cloud = estimate_covariances(&points, &CovarianceConfig::default());
        assert_eq!(cloud.covariances.len(), points.len());
        // Line points: the thin direction is one of y/z, x stays at 1.
        assert_relative_eq!(cloud.covariances[120][(0, 0)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(cloud.covariances[150], Matrix3::identity());
    }

    #[test]
    fn test_empty_cloud() {
        let cloud = estimate_covariances(&[], &CovarianceConfig::default());
        assert!(cloud.is_empty());
        assert!(cloud.covariances.is_empty());
    }
}
