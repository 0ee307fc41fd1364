//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! changes. The configuration is validated once when the engine is built
//! and never mutated afterwards.

use serde::{Deserialize, Serialize};
use vgicp::{CropBox, VgicpConfig};

use crate::error::ConfigError;

/// IMU noise model used for covariance propagation.
///
/// Values are continuous-time standard deviations; the discrete process
/// noise of a segment of length `dt` is `sigma^2 * dt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuNoise {
    /// rad/s/sqrt(Hz)
    pub gyro_noise: f64,
    /// m/s^2/sqrt(Hz)
    pub accel_noise: f64,
    pub gyro_bias_walk: f64,
    pub accel_bias_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            gyro_noise: 0.01,
            accel_noise: 0.1,
            gyro_bias_walk: 1e-4,
            accel_bias_walk: 1e-3,
        }
    }
}

/// Lower bounds on the registration covariance diagonal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceFloor {
    /// m^2
    pub translation: f64,
    /// rad^2
    pub rotation: f64,
}

impl Default for VarianceFloor {
    fn default() -> Self {
        Self {
            translation: 1e-4,
            rotation: 1e-5,
        }
    }
}

/// Prior variances of the error state at initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialCovariance {
    pub position: f64,
    pub rotation: f64,
    pub velocity: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
}

impl Default for InitialCovariance {
    fn default() -> Self {
        Self {
            position: 1e-4,
            rotation: 1e-4,
            velocity: 1e-2,
            gyro_bias: 1e-6,
            accel_bias: 1e-4,
        }
    }
}

/// All tunables of the odometry engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LioConfig {
    // Registration
    pub max_correspondence_distance: f64,
    pub transformation_epsilon: f64,
    pub correspondence_randomness: usize,
    pub resolution: f64,
    pub max_iteration: usize,
    pub num_threads: usize,
    pub min_correspondences: usize,
    /// Registrations whose mean weighted residual exceeds this are
    /// rejected even when the solver converged.
    pub max_registration_fitness: f64,

    // Local map
    pub translation_threshold: f64,
    /// Radians.
    pub rotation_threshold: f64,
    pub voxel_map_resolution: f64,
    pub map_removal_distance: f64,
    pub max_submap_size: usize,

    // IMU
    pub imu_calibration_time: f64,
    pub gravity: f64,
    /// Mean squared deviation of the specific force above which the
    /// calibration window is rejected as moving.
    pub static_accel_variance_threshold: f64,
    pub imu_noise: ImuNoise,

    // Synchronization
    /// IMU samples up to this long after a scan are pulled into its window.
    pub imu_lookahead: f64,
    /// Pose priors farther than this from the scan time are not attached.
    pub pose_prior_timeout: f64,

    // Preprocessing
    pub scan_voxel_size: f64,
    pub crop_box: Option<CropBox>,
    pub deskew: bool,

    // Fusion
    pub registration_covariance_scale: f64,
    pub min_registration_variance: VarianceFloor,
    pub initial_covariance: InitialCovariance,

    /// Report poses relative to the starting pose instead of waiting for
    /// an external initial pose.
    pub use_local_coordinates: bool,

    pub max_trajectory_length: usize,
}

impl Default for LioConfig {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 1.0,
            transformation_epsilon: 0.01,
            correspondence_randomness: 20,
            resolution: 1.0,
            max_iteration: 30,
            num_threads: 4,
            min_correspondences: 20,
            max_registration_fitness: 3.0,

            translation_threshold: 1.0,
            rotation_threshold: 0.5,
            voxel_map_resolution: 0.25,
            map_removal_distance: 100.0,
            max_submap_size: 20,

            imu_calibration_time: 3.0,
            gravity: 9.80665,
            static_accel_variance_threshold: 0.1,
            imu_noise: ImuNoise::default(),

            imu_lookahead: 0.02,
            pose_prior_timeout: 0.1,

            scan_voxel_size: 0.5,
            crop_box: None,
            deskew: true,

            registration_covariance_scale: 1.0,
            min_registration_variance: VarianceFloor::default(),
            initial_covariance: InitialCovariance::default(),

            use_local_coordinates: false,

            max_trajectory_length: 10_000,
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

fn nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::ZeroCount { field })
    }
}

impl LioConfig {
    /// Check every field, reporting the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("max_correspondence_distance", self.max_correspondence_distance)?;
        positive("transformation_epsilon", self.transformation_epsilon)?;
        positive("resolution", self.resolution)?;
        nonzero("correspondence_randomness", self.correspondence_randomness)?;
        nonzero("max_iteration", self.max_iteration)?;
        nonzero("num_threads", self.num_threads)?;
        positive("max_registration_fitness", self.max_registration_fitness)?;

        positive("translation_threshold", self.translation_threshold)?;
        positive("rotation_threshold", self.rotation_threshold)?;
        positive("voxel_map_resolution", self.voxel_map_resolution)?;
        positive("map_removal_distance", self.map_removal_distance)?;
        nonzero("max_submap_size", self.max_submap_size)?;

        positive("imu_calibration_time", self.imu_calibration_time)?;
        positive("gravity", self.gravity)?;
        positive(
            "static_accel_variance_threshold",
            self.static_accel_variance_threshold,
        )?;
        positive("imu_noise.gyro_noise", self.imu_noise.gyro_noise)?;
        positive("imu_noise.accel_noise", self.imu_noise.accel_noise)?;
        positive("imu_noise.gyro_bias_walk", self.imu_noise.gyro_bias_walk)?;
        positive("imu_noise.accel_bias_walk", self.imu_noise.accel_bias_walk)?;

        positive("imu_lookahead", self.imu_lookahead)?;
        positive("pose_prior_timeout", self.pose_prior_timeout)?;

        positive("scan_voxel_size", self.scan_voxel_size)?;
        if let Some(crop) = &self.crop_box {
            if !crop.is_valid() {
                return Err(ConfigError::InvalidCropBox {
                    min: crop.min,
                    max: crop.max,
                });
            }
        }

        positive(
            "registration_covariance_scale",
            self.registration_covariance_scale,
        )?;
        let floor = &self.min_registration_variance;
        positive("min_registration_variance.translation", floor.translation)?;
        positive("min_registration_variance.rotation", floor.rotation)?;
        let init = &self.initial_covariance;
        positive("initial_covariance.position", init.position)?;
        positive("initial_covariance.rotation", init.rotation)?;
        positive("initial_covariance.velocity", init.velocity)?;
        positive("initial_covariance.gyro_bias", init.gyro_bias)?;
        positive("initial_covariance.accel_bias", init.accel_bias)?;

        nonzero("max_trajectory_length", self.max_trajectory_length)?;
        Ok(())
    }

    /// Settings for the scan matcher.
    pub fn registration_config(&self) -> VgicpConfig {
        VgicpConfig {
            resolution: self.resolution as f32,
            max_iterations: self.max_iteration,
            transformation_epsilon: self.transformation_epsilon,
            max_correspondence_distance: self.max_correspondence_distance,
            correspondence_randomness: self.correspondence_randomness,
            min_correspondences: self.min_correspondences,
            num_threads: self.num_threads,
            ..Default::default()
        }
    }
}
