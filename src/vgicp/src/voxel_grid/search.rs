//! KD-tree index over voxel means.
//!
//! Correspondences are formed between a transformed source point and the
//! voxel whose mean lies closest to it, so the index stores the voxel
//! centroids rather than the raw map points.

use nalgebra::Vector3;

use super::Voxel;
use crate::spatial::PointIndex;

/// Nearest-neighbour search over voxel centroids.
///
/// Planar surfaces put many centroids on one coordinate, which the
/// underlying [`PointIndex`] tolerates.
#[derive(Debug)]
pub struct VoxelSearch {
    index: PointIndex,
}

impl VoxelSearch {
    /// Build the index. Positions returned by queries refer to `voxels`.
    ///
    /// Returns `None` when no voxel has a finite mean.
    pub fn from_voxels(voxels: &[Voxel]) -> Option<Self> {
        let index = PointIndex::from_points(voxels.iter().map(|v| v.mean))?;
        Some(Self { index })
    }

    /// Index and squared distance of the centroid nearest to `point`.
    ///
    /// `None` for a non-finite query.
    pub fn nearest(&self, point: &[f32; 3]) -> Option<(usize, f32)> {
        self.index
            .nearest(&to_vector(point))
            .map(|(i, dist_sq)| (i, dist_sq as f32))
    }

    /// Nearest centroid, if it lies within `radius` of `point`.
    pub fn nearest_within(&self, point: &[f32; 3], radius: f32) -> Option<usize> {
        let (index, dist_sq) = self.nearest(point)?;
        (dist_sq <= radius * radius).then_some(index)
    }

    /// All centroid indices within `radius`, nearest first.
    pub fn within(&self, point: &[f32; 3], radius: f32) -> Vec<usize> {
        self.index
            .within(&to_vector(point), radius as f64)
            .into_iter()
            .map(|(i, _)| i)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn to_vector(p: &[f32; 3]) -> Vector3<f64> {
    Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn voxel_at(mean: [f64; 3]) -> Voxel {
        Voxel {
            mean: Vector3::new(mean[0], mean[1], mean[2]),
            covariance: Matrix3::identity(),
            point_count: 10,
        }
    }

    #[test]
    fn test_empty_voxels() {
        assert!(VoxelSearch::from_voxels(&[]).is_none());
    }

    #[test]
    fn test_nearest_within_radius() {
        let voxels = vec![
            voxel_at([0.0, 0.0, 0.0]),
            voxel_at([2.0, 0.0, 0.0]),
            voxel_at([0.0, 5.0, 0.0]),
        ];
        let search = VoxelSearch::from_voxels(&voxels).unwrap();
        assert_eq!(search.len(), 3);

        assert_eq!(search.nearest_within(&[1.8, 0.1, 0.0], 0.5), Some(1));
        assert_eq!(search.nearest_within(&[0.0, 2.5, 0.0], 1.0), None);
    }

    #[test]
    fn test_coplanar_centroids() {
        // A floor at 0.25 m resolution: thousands of means at z = 0.
        let voxels: Vec<Voxel> = (0..80)
            .flat_map(|i| (0..44).map(move |j| voxel_at([i as f64 * 0.25, j as f64 * 0.25, 0.0])))
            .collect();
        let search = VoxelSearch::from_voxels(&voxels).unwrap();
        assert_eq!(search.len(), voxels.len());

        let index = search.nearest_within(&[10.0, 5.0, 0.1], 0.5).unwrap();
        assert_eq!(voxels[index].mean, Vector3::new(10.0, 5.0, 0.0));
        assert!(search.nearest(&[f32::NAN, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_within_sorted() {
        let voxels = vec![
            voxel_at([0.0, 0.0, 0.0]),
            voxel_at([1.0, 0.0, 0.0]),
            voxel_at([0.4, 0.0, 0.0]),
        ];
        let search = VoxelSearch::from_voxels(&voxels).unwrap();

        let nearby = search.within(&[0.9, 0.0, 0.0], 1.0);
        assert_eq!(nearby, vec![1, 2, 0]);
    }
}
