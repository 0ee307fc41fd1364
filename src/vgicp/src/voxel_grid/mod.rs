//! Gaussian voxel grid used as the registration target.
//!
//! The map is summarized as one normal distribution per occupied voxel.
//! A KD-tree over the voxel means answers nearest-voxel queries during
//! correspondence search.

mod cpu;
mod search;
mod types;

pub use cpu::build_voxels;
pub use search::VoxelSearch;
pub use types::{clamp_eigenvalues, Voxel, VoxelCoord, VoxelGridConfig};

use anyhow::{bail, Result};

/// Immutable voxel grid with its nearest-voxel index.
#[derive(Debug)]
pub struct VoxelGrid {
    config: VoxelGridConfig,
    voxels: Vec<Voxel>,
    search: VoxelSearch,
}

impl VoxelGrid {
    /// Build a grid with default settings and the given resolution.
    pub fn from_points(points: &[[f32; 3]], resolution: f32) -> Result<Self> {
        Self::from_points_with_config(
            points,
            VoxelGridConfig {
                resolution,
                ..Default::default()
            },
        )
    }

    /// Build a grid from map points.
    ///
    /// Fails if the resolution is not positive or no voxel is dense enough
    /// to carry a distribution.
    pub fn from_points_with_config(points: &[[f32; 3]], config: VoxelGridConfig) -> Result<Self> {
        if config.resolution <= 0.0 || !config.resolution.is_finite() {
            bail!("Voxel resolution must be positive, got {}", config.resolution);
        }

        let voxels: Vec<Voxel> = build_voxels(points, &config)
            .into_iter()
            .map(|(_, v)| v)
            .collect();

        let Some(search) = VoxelSearch::from_voxels(&voxels) else {
            bail!(
                "No voxels created from {} target points (too sparse?)",
                points.len()
            );
        };

        Ok(Self {
            config,
            voxels,
            search,
        })
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn resolution(&self) -> f32 {
        self.config.resolution
    }

    pub fn config(&self) -> &VoxelGridConfig {
        &self.config
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    /// Voxel whose mean is nearest to `point`, if within `max_distance`.
    pub fn nearest_within(&self, point: &[f32; 3], max_distance: f32) -> Option<&Voxel> {
        self.search
            .nearest_within(point, max_distance)
            .map(|i| &self.voxels[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_half_cubic_pcd;

    #[test]
    fn test_grid_from_half_cube() {
        let points = make_half_cubic_pcd(10.0, 0.2);
        let grid = VoxelGrid::from_points(&points, 1.0).unwrap();

        assert!(!grid.is_empty());
        assert!(grid.len() < points.len());
        assert_eq!(grid.resolution(), 1.0);
    }

    #[test]
    fn test_grid_rejects_bad_resolution() {
        let points = make_half_cubic_pcd(5.0, 0.2);
        assert!(VoxelGrid::from_points(&points, 0.0).is_err());
        assert!(VoxelGrid::from_points(&points, -1.0).is_err());
    }

    #[test]
    fn test_grid_rejects_empty() {
        assert!(VoxelGrid::from_points(&[], 1.0).is_err());
    }

    #[test]
    fn test_nearest_within() {
        let points = make_half_cubic_pcd(10.0, 0.2);
        let grid = VoxelGrid::from_points(&points, 1.0).unwrap();

        let voxel = grid.nearest_within(&[5.0, 5.0, 0.1], 1.0).unwrap();
        assert!(voxel.mean.z.abs() < 0.05);

        assert!(grid.nearest_within(&[50.0, 50.0, 50.0], 1.0).is_none());
    }
}
