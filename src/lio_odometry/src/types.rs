//! Sensor samples and the fused navigation state.

use nalgebra::{Isometry3, Matrix4, Matrix6, SMatrix, Translation3, UnitQuaternion, Vector3};

/// Covariance of the 15-dimensional error state.
///
/// Blocks follow the `ERR_*` offsets: world position, body rotation
/// (right perturbation), world velocity, gyro bias, accel bias.
pub type StateCovariance = SMatrix<f64, 15, 15>;

pub const ERR_POS: usize = 0;
pub const ERR_ROT: usize = 3;
pub const ERR_VEL: usize = 6;
pub const ERR_BG: usize = 9;
pub const ERR_BA: usize = 12;

/// One inertial sample. Timestamps are seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    /// Body angular velocity in rad/s.
    pub angular_velocity: Vector3<f64>,
    /// Specific force in m/s^2 (reads `+g` upward when static).
    pub linear_acceleration: Vector3<f64>,
}

impl ImuSample {
    pub fn new(
        timestamp: f64,
        angular_velocity: Vector3<f64>,
        linear_acceleration: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp,
            angular_velocity,
            linear_acceleration,
        }
    }
}

/// A range scan in the sensor frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LidarScan {
    pub timestamp: f64,
    pub points: Vec<[f32; 3]>,
    /// Per-point time offsets in seconds relative to `timestamp`.
    pub point_times: Option<Vec<f32>>,
}

impl LidarScan {
    pub fn new(timestamp: f64, points: Vec<[f32; 3]>) -> Self {
        Self {
            timestamp,
            points,
            point_times: None,
        }
    }

    /// Attach per-point time offsets. Ignored unless one per point.
    pub fn with_point_times(mut self, point_times: Vec<f32>) -> Self {
        self.point_times = Some(point_times);
        self
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// An externally supplied pose, e.g. from a map localizer or an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct PosePrior {
    pub timestamp: f64,
    pub pose: Isometry3<f64>,
    /// Pose covariance over `[x, y, z, roll, pitch, yaw]` in the world frame.
    pub covariance: Option<Matrix6<f64>>,
}

impl PosePrior {
    pub fn new(timestamp: f64, pose: Isometry3<f64>) -> Self {
        Self {
            timestamp,
            pose,
            covariance: None,
        }
    }

    pub fn with_covariance(mut self, covariance: Matrix6<f64>) -> Self {
        self.covariance = Some(covariance);
        self
    }
}

/// One scan with the IMU samples that lead up to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub scan: LidarScan,
    /// Samples ordered by timestamp, covering the scan time.
    pub imu: Vec<ImuSample>,
    pub pose_prior: Option<PosePrior>,
}

impl Measurement {
    pub fn timestamp(&self) -> f64 {
        self.scan.timestamp
    }
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
}

impl Default for ImuBias {
    fn default() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
        }
    }
}

/// Fused estimate of the platform state in the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
}

impl NavState {
    /// State at rest with the given pose.
    pub fn at_rest(timestamp: f64, pose: &Isometry3<f64>, bias: ImuBias) -> Self {
        Self {
            timestamp,
            position: pose.translation.vector,
            orientation: pose.rotation,
            velocity: Vector3::zeros(),
            bias,
        }
    }

    pub fn pose(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position), self.orientation)
    }

    /// Homogeneous 4x4 pose.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.pose().to_homogeneous()
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.orientation.coords.iter().all(|v| v.is_finite())
            && self.bias.gyro.iter().all(|v| v.is_finite())
            && self.bias.accel.iter().all(|v| v.is_finite())
    }
}
