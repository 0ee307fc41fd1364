//! CPU implementations of the point filters.

use std::collections::HashMap;

use super::{CropBox, FilterParams, FilterResult};

/// Run non-finite removal, crop and downsampling in that order.
pub fn filter_points(points: &[[f32; 3]], params: &FilterParams) -> FilterResult {
    let original_count = points.len();

    let mut filtered = remove_non_finite(points);
    let removed_non_finite = original_count - filtered.len();

    let removed_by_crop = match &params.crop_box {
        Some(crop) => {
            let before = filtered.len();
            filtered = crop_points(&filtered, crop);
            before - filtered.len()
        }
        None => 0,
    };

    let removed_by_downsampling = match params.downsample_resolution {
        Some(resolution) => {
            let before = filtered.len();
            filtered = voxel_downsample(&filtered, resolution);
            before - filtered.len()
        }
        None => 0,
    };

    debug_assert_eq!(
        original_count,
        filtered.len() + removed_non_finite + removed_by_crop + removed_by_downsampling
    );

    FilterResult {
        points: filtered,
        removed_non_finite,
        removed_by_crop,
        removed_by_downsampling,
    }
}

pub fn remove_non_finite(points: &[[f32; 3]]) -> Vec<[f32; 3]> {
    points
        .iter()
        .filter(|p| p.iter().all(|c| c.is_finite()))
        .copied()
        .collect()
}

pub fn crop_points(points: &[[f32; 3]], crop: &CropBox) -> Vec<[f32; 3]> {
    points.iter().filter(|p| crop.keeps(p)).copied().collect()
}

/// (sum_x, sum_y, sum_z, count)
type CentroidAccum = (f64, f64, f64, usize);

/// Replace the points of each occupied voxel by their centroid.
///
/// A non-positive resolution returns the input unchanged. Output order
/// follows voxel index order so repeated calls are deterministic.
pub fn voxel_downsample(points: &[[f32; 3]], resolution: f32) -> Vec<[f32; 3]> {
    if points.is_empty() || resolution <= 0.0 {
        return points.to_vec();
    }

    let inv_resolution = 1.0 / resolution;
    let mut voxels: HashMap<(i32, i32, i32), CentroidAccum> = HashMap::new();

    for p in points {
        let key = (
            (p[0] * inv_resolution).floor() as i32,
            (p[1] * inv_resolution).floor() as i32,
            (p[2] * inv_resolution).floor() as i32,
        );
        let entry = voxels.entry(key).or_insert((0.0, 0.0, 0.0, 0));
        entry.0 += p[0] as f64;
        entry.1 += p[1] as f64;
        entry.2 += p[2] as f64;
        entry.3 += 1;
    }

    let mut cells: Vec<_> = voxels.into_iter().collect();
    cells.sort_unstable_by_key(|(key, _)| *key);

    cells
        .into_iter()
        .map(|(_, (sx, sy, sz, count))| {
            let n = count as f64;
            [(sx / n) as f32, (sy / n) as f32, (sz / n) as f32]
        })
        .collect()
}
