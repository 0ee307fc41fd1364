//! Static IMU calibration.
//!
//! While the platform stands still the gyroscope should read zero and the
//! accelerometer should read gravity pointing up. The mean gyro reading is
//! the gyro bias; the direction of the mean specific force gives roll and
//! pitch, and its deviation from the configured gravity magnitude along
//! that direction is the accelerometer bias. Yaw is unobservable and set
//! to zero. A window whose mean specific force is far from gravity cannot
//! come from a sensor at rest and is rejected.

use nalgebra::{UnitQuaternion, Vector3};
use tracing::debug;

use crate::error::CalibrationError;
use crate::types::{ImuBias, ImuSample};

const LOGGER_NAME: &str = "lio_odometry.imu_initializer";

/// Largest accepted deviation of the mean specific force from gravity, as
/// a fraction of gravity.
const MAX_GRAVITY_DEVIATION: f64 = 0.25;

/// Result of a successful calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuCalibration {
    pub bias: ImuBias,
    /// Body-to-world rotation that maps the measured specific force onto +z.
    pub orientation: UnitQuaternion<f64>,
    /// Timestamp of the last sample in the window.
    pub timestamp: f64,
    pub samples: usize,
    pub accel_variance: f64,
}

#[derive(Debug, Clone)]
pub struct ImuInitializer {
    calibration_time: f64,
    gravity: f64,
    variance_threshold: f64,
}

impl ImuInitializer {
    pub fn new(calibration_time: f64, gravity: f64, variance_threshold: f64) -> Self {
        Self {
            calibration_time,
            gravity,
            variance_threshold,
        }
    }

    pub fn calibration_time(&self) -> f64 {
        self.calibration_time
    }

    /// Estimate biases and the gravity-aligned orientation from a window
    /// of samples taken at rest.
    pub fn calibrate(&self, samples: &[ImuSample]) -> Result<ImuCalibration, CalibrationError> {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Err(CalibrationError::Empty);
        };

        let span = last.timestamp - first.timestamp;
        if span < self.calibration_time {
            return Err(CalibrationError::WindowTooShort {
                span,
                required: self.calibration_time,
            });
        }

        let n = samples.len() as f64;
        let gyro_mean = samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s.angular_velocity)
            / n;
        let accel_mean = samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s.linear_acceleration)
            / n;

        let variance = samples
            .iter()
            .map(|s| (s.linear_acceleration - accel_mean).norm_squared())
            .sum::<f64>()
            / n;
        if variance > self.variance_threshold {
            return Err(CalibrationError::ExcessMotion {
                variance,
                threshold: self.variance_threshold,
            });
        }

        let norm = accel_mean.norm();
        if !((norm - self.gravity).abs() <= MAX_GRAVITY_DEVIATION * self.gravity) {
            return Err(CalibrationError::GravityMismatch {
                norm,
                expected: self.gravity,
            });
        }

        let up = Vector3::z();
        let orientation = UnitQuaternion::rotation_between(&accel_mean, &up).unwrap_or_else(|| {
            // Specific force points straight down: the sensor is upside down.
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
        });

        let accel_bias = accel_mean - accel_mean / norm * self.gravity;

        debug!(
            target: LOGGER_NAME,
            samples = samples.len(),
            span,
            variance,
            gyro_bias = ?gyro_mean,
            accel_bias = ?accel_bias,
            "IMU calibrated"
        );

        Ok(ImuCalibration {
            bias: ImuBias {
                gyro: gyro_mean,
                accel: accel_bias,
            },
            orientation,
            timestamp: last.timestamp,
            samples: samples.len(),
            accel_variance: variance,
        })
    }
}
