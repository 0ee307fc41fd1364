//! Scan preprocessing before registration.

use tracing::trace;
use vgicp::{filter_points, CropBox, FilterParams};

use crate::config::LioConfig;

const LOGGER_NAME: &str = "lio_odometry.preprocess";

/// Crop and voxel-downsample raw scans.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    params: FilterParams,
}

impl Preprocessor {
    pub fn new(voxel_size: f64, crop_box: Option<CropBox>) -> Self {
        Self {
            params: FilterParams {
                crop_box,
                downsample_resolution: Some(voxel_size as f32),
            },
        }
    }

    pub fn from_config(config: &LioConfig) -> Self {
        Self::new(config.scan_voxel_size, config.crop_box)
    }

    pub fn voxel_size(&self) -> Option<f32> {
        self.params.downsample_resolution
    }

    pub fn crop_box(&self) -> Option<&CropBox> {
        self.params.crop_box.as_ref()
    }

    /// Drop non-finite points, apply the crop box, then downsample.
    pub fn process(&self, points: &[[f32; 3]]) -> Vec<[f32; 3]> {
        let result = filter_points(points, &self.params);
        trace!(
            target: LOGGER_NAME,
            input = points.len(),
            output = result.points.len(),
            non_finite = result.removed_non_finite,
            cropped = result.removed_by_crop,
            "scan filtered"
        );
        result.points
    }

    /// Drop non-finite points and apply the crop box, keeping full density.
    pub fn crop(&self, points: &[[f32; 3]]) -> Vec<[f32; 3]> {
        let params = FilterParams {
            crop_box: self.params.crop_box,
            downsample_resolution: None,
        };
        filter_points(points, &params).points
    }
}
