//! Voxel grid construction on the CPU.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use super::types::{Voxel, VoxelCoord, VoxelGridConfig};

/// First and second moments of the points in one voxel.
#[derive(Debug, Clone, Default)]
struct MomentAccumulator {
    sum: Vector3<f64>,
    sum_outer: Matrix3<f64>,
    count: usize,
}

impl MomentAccumulator {
    fn add(&mut self, point: &[f32; 3]) {
        let v = Vector3::new(point[0] as f64, point[1] as f64, point[2] as f64);
        self.sum += v;
        self.sum_outer += v * v.transpose();
        self.count += 1;
    }
}

/// Bin points into voxels and compute one Gaussian per occupied voxel.
///
/// Non-finite points are skipped. The returned voxels are ordered by
/// coordinate so grids built from the same points are identical.
pub fn build_voxels(points: &[[f32; 3]], config: &VoxelGridConfig) -> Vec<(VoxelCoord, Voxel)> {
    let inv_resolution = 1.0 / config.resolution;
    let mut accumulators: HashMap<VoxelCoord, MomentAccumulator> = HashMap::new();

    for point in points.iter().filter(|p| p.iter().all(|c| c.is_finite())) {
        accumulators
            .entry(VoxelCoord::from_point(point, inv_resolution))
            .or_default()
            .add(point);
    }

    let mut voxels: Vec<(VoxelCoord, Voxel)> = accumulators
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .filter_map(|(coord, acc)| {
            Voxel::from_moments(&acc.sum, &acc.sum_outer, acc.count, config).map(|v| (coord, v))
        })
        .collect();

    voxels.sort_unstable_by_key(|(c, _)| (c.x, c.y, c.z));
    voxels
}
