//! Point cloud filtering applied before registration.
//!
//! - Crop box filtering (keep or remove points inside an axis-aligned box)
//! - Voxel grid downsampling (one centroid per occupied voxel)
//! - Removal of non-finite points

mod cpu;

pub use cpu::{crop_points, filter_points, remove_non_finite, voxel_downsample};

use serde::{Deserialize, Serialize};

/// Which side of a crop box survives filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropMode {
    /// Keep only points inside the box.
    KeepInside,
    /// Drop points inside the box (e.g. the vehicle body).
    RemoveInside,
}

/// Axis-aligned crop box. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub mode: CropMode,
}

impl CropBox {
    pub fn new(min: [f32; 3], max: [f32; 3], mode: CropMode) -> Self {
        Self { min, max, mode }
    }

    /// Whether min <= max holds on every axis.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.min[i].is_finite() && self.max[i].is_finite() && self.min[i] <= self.max[i])
    }

    pub fn contains(&self, p: &[f32; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    /// Whether `p` survives this filter.
    pub fn keeps(&self, p: &[f32; 3]) -> bool {
        match self.mode {
            CropMode::KeepInside => self.contains(p),
            CropMode::RemoveInside => !self.contains(p),
        }
    }
}

/// Parameters for [`filter_points`].
#[derive(Clone, Debug, Default)]
pub struct FilterParams {
    pub crop_box: Option<CropBox>,
    /// Voxel downsampling leaf size (None = no downsampling).
    pub downsample_resolution: Option<f32>,
}

/// Result of a filtering pass.
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub points: Vec<[f32; 3]>,
    pub removed_non_finite: usize,
    pub removed_by_crop: usize,
    pub removed_by_downsampling: usize,
}
