//! Error types for the odometry core.

use thiserror::Error;

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be finite and positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },

    #[error("crop box min {min:?} exceeds max {max:?}")]
    InvalidCropBox { min: [f32; 3], max: [f32; 3] },
}

/// Recoverable failure of the static IMU calibration.
///
/// The caller collects a fresh window and tries again.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("no IMU samples")]
    Empty,

    #[error("calibration window spans {span:.3}s, {required:.3}s required")]
    WindowTooShort { span: f64, required: f64 },

    #[error("acceleration variance {variance:.4} exceeds static threshold {threshold:.4}")]
    ExcessMotion { variance: f64, threshold: f64 },

    /// The mean specific force is too far from the configured gravity to
    /// be a sensor at rest.
    #[error("mean specific force {norm:.4} m/s^2 does not match gravity {expected:.4} m/s^2")]
    GravityMismatch { norm: f64, expected: f64 },
}

/// Failure surfaced by the engine.
#[derive(Debug, Error)]
pub enum LioError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to create scan matcher: {0}")]
    Matcher(String),

    /// The fused state left the finite range. The last valid state is kept.
    #[error("non-finite state at t={timestamp:.6}")]
    NonFiniteState { timestamp: f64 },
}
