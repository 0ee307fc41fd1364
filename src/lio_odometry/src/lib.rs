//! Lidar-inertial odometry core.
//!
//! Fuses high-rate IMU samples with lidar scans registered against a
//! bounded local map, producing a pose stream with covariance.
//!
//! # Architecture
//!
//! Per measurement, leaf components first:
//! - `queue` / `synchronizer`: per-stream ingestion queues and time
//!   alignment into [`Measurement`]s
//! - `preprocess` / `deskew`: crop, downsample and motion-compensate scans
//! - `imu`: static calibration and zero-order-hold preintegration
//! - `matcher`: scan-to-map registration behind a shared lock
//! - `optimizer`: error-state Kalman fusion of prediction and registration
//! - `map`: keyframe window with asynchronous target rebuilds
//!
//! [`LidarInertialOdometry`] drives the cycle and [`LioProcessor`] runs it
//! on a dedicated thread.
//!
//! # Usage
//!
//! ```ignore
//! use lio_odometry::{LidarInertialOdometry, LioConfig, LioProcessor};
//!
//! let engine = LidarInertialOdometry::new(LioConfig::default())?;
//! let (processor, events) = LioProcessor::spawn(engine);
//!
//! let input = processor.input().clone();
//! input.insert_imu(sample);
//! input.insert_points(scan);
//!
//! for event in events {
//!     println!("{:?}", processor.output().get_result());
//! }
//! ```

pub mod config;
pub mod covariance;
pub mod deskew;
pub mod error;
pub mod imu;
pub mod map;
pub mod matcher;
pub mod odometry;
pub mod optimizer;
pub mod preprocess;
pub mod processor;
pub mod queue;
pub mod simulation;
pub mod synchronizer;
pub mod types;

pub use config::{ImuNoise, InitialCovariance, LioConfig, VarianceFloor};
pub use error::{CalibrationError, ConfigError, LioError};
pub use imu::{ImuCalibration, ImuInitializer, ImuIntegrator, Prediction, Preintegration};
pub use map::{Keyframe, LocalMap, MapManager, MapStatus, MapUpdateTrigger, Submap};
pub use matcher::{MatchResult, ScanMatcher};
pub use odometry::{
    CycleEvent, CycleReport, InitStatus, LidarInertialOdometry, OdometryOutput, RejectReason,
    UpdateOutcome,
};
pub use optimizer::{Optimizer, PoseObservation};
pub use preprocess::Preprocessor;
pub use processor::{CycleResult, LioProcessor};
pub use queue::ConcurrentQueue;
pub use synchronizer::{SensorInput, SensorSynchronizer};
pub use types::{ImuBias, ImuSample, LidarScan, Measurement, NavState, PosePrior, StateCovariance};

// Registration primitives, re-exported for configuration.
pub use vgicp::{CropBox, CropMode};
