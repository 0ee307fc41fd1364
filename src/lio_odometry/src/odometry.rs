//! The lidar-inertial odometry engine.
//!
//! One call to [`LidarInertialOdometry::process_next`] advances the engine
//! by one synchronized measurement:
//!
//! ```text
//! Calibrating --(static IMU window + start pose)--> Initialized
//! Initialized: predict -> match -> fuse -> maybe update map
//! ```
//!
//! There is no transition back out of `Initialized`. A failed
//! registration degrades the cycle to propagation-only.

use std::collections::VecDeque;
use std::sync::Arc;

use nalgebra::{Isometry3, Matrix3, Matrix4, Matrix6, Translation3, Vector3};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::LioConfig;
use crate::covariance::rotate_rotation_block;
use crate::deskew::{deskew_scan, BodyTwist};
use crate::error::{CalibrationError, LioError};
use crate::imu::{ImuInitializer, ImuIntegrator, Prediction};
use crate::map::{LocalMap, MapManager, MapStatus, MapUpdateTrigger, SharedLocalMap};
use crate::matcher::{MatchResult, ScanMatcher};
use crate::optimizer::{Optimizer, PoseObservation};
use crate::preprocess::Preprocessor;
use crate::synchronizer::{SensorInput, SensorSynchronizer};
use crate::types::{
    ImuSample, LidarScan, Measurement, NavState, PosePrior, StateCovariance, ERR_BA, ERR_BG,
    ERR_POS, ERR_ROT, ERR_VEL,
};

const LOGGER_NAME: &str = "lio_odometry";

/// Progress of the initialization stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitStatus {
    /// Still collecting a static IMU window.
    Calibrating,
    /// IMU calibrated, but no start pose is available in fixed-frame mode.
    AwaitingPose,
    Initialized(NavState),
}

/// Details of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Committed state.
    pub state: NavState,
    /// IMU-only prediction the cycle started from.
    pub prediction: NavState,
    /// `None` when the preprocessed scan was empty.
    pub registration: Option<MatchResult>,
    pub scan_points: usize,
    pub prior_fused: bool,
    pub map_update: Option<MapUpdateTrigger>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    NotInitialized,
    /// The measurement is not newer than the last fused state.
    StaleMeasurement { timestamp: f64, last: f64 },
}

/// Result of [`LidarInertialOdometry::update`]. Exactly one per call.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Registration succeeded and was fused.
    Updated(CycleReport),
    /// Registration failed; the committed state is the IMU prediction.
    PropagationOnly(CycleReport),
    /// Nothing was committed.
    Rejected(RejectReason),
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }

    pub fn is_propagation_only(&self) -> bool {
        matches!(self, Self::PropagationOnly(_))
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Updated(report) | Self::PropagationOnly(report) => Some(report),
            Self::Rejected(_) => None,
        }
    }

    pub fn state(&self) -> Option<&NavState> {
        self.report().map(|r| &r.state)
    }
}

/// What one processing step did.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    Init(InitStatus),
    Update(UpdateOutcome),
}

impl CycleEvent {
    /// State committed by this step, if any.
    pub fn state(&self) -> Option<&NavState> {
        match self {
            Self::Init(InitStatus::Initialized(state)) => Some(state),
            Self::Init(_) => None,
            Self::Update(outcome) => outcome.state(),
        }
    }
}

#[derive(Debug)]
struct OutputState {
    state: Option<NavState>,
    covariance: Matrix6<f64>,
    trajectory: VecDeque<NavState>,
}

/// Cloneable read handle on the engine output.
///
/// Every accessor returns a copy taken under a read lock, so readers never
/// observe a partially written state.
#[derive(Debug, Clone)]
pub struct OdometryOutput {
    inner: Arc<RwLock<OutputState>>,
    local_map: SharedLocalMap,
    max_trajectory_length: usize,
}

impl OdometryOutput {
    fn new(local_map: SharedLocalMap, max_trajectory_length: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(OutputState {
                state: None,
                covariance: Matrix6::identity(),
                trajectory: VecDeque::with_capacity(max_trajectory_length.min(1024)),
            })),
            local_map,
            max_trajectory_length,
        }
    }

    fn publish(&self, state: NavState, covariance: Matrix6<f64>) {
        let mut inner = self.inner.write();
        inner.state = Some(state);
        inner.covariance = covariance;
        inner.trajectory.push_back(state);
        while inner.trajectory.len() > self.max_trajectory_length {
            inner.trajectory.pop_front();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().state.is_some()
    }

    pub fn get_state(&self) -> Option<NavState> {
        self.inner.read().state
    }

    /// Last fused pose, identity before initialization.
    pub fn get_result(&self) -> Matrix4<f64> {
        self.get_state()
            .map_or_else(Matrix4::identity, |state| state.matrix())
    }

    /// Pose covariance over `[world position, body rotation]`.
    pub fn get_covariance(&self) -> Matrix6<f64> {
        self.inner.read().covariance
    }

    pub fn get_local_map(&self) -> Arc<LocalMap> {
        Arc::clone(&self.local_map.read())
    }

    /// Fused states, oldest first.
    pub fn trajectory(&self) -> Vec<NavState> {
        self.inner.read().trajectory.iter().copied().collect()
    }
}

/// Points of one scan after motion compensation.
struct PreparedScan {
    /// Downsampled, used for registration.
    registration: Vec<[f32; 3]>,
    /// Cropped at full density, folded into the map.
    map: Vec<[f32; 3]>,
}

pub struct LidarInertialOdometry {
    config: LioConfig,
    synchronizer: SensorSynchronizer,
    preprocessor: Preprocessor,
    initializer: ImuInitializer,
    integrator: ImuIntegrator,
    matcher: ScanMatcher,
    map: MapManager,
    optimizer: Optimizer,
    output: OdometryOutput,

    calibration_window: VecDeque<ImuSample>,
    initial_pose: Option<PosePrior>,
}

impl std::fmt::Debug for LidarInertialOdometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LidarInertialOdometry")
            .field("initialized", &self.is_initialized())
            .field("state", &self.optimizer.state())
            .field("map", &self.map.status())
            .finish()
    }
}

impl LidarInertialOdometry {
    /// Validate `config` and build the engine.
    pub fn new(config: LioConfig) -> Result<Self, LioError> {
        config.validate()?;

        let matcher = ScanMatcher::new(&config)?;
        let map = MapManager::new(&config);
        let output = OdometryOutput::new(map.shared_local_map(), config.max_trajectory_length);

        info!(
            target: LOGGER_NAME,
            resolution = config.resolution,
            voxel_map_resolution = config.voxel_map_resolution,
            max_submap_size = config.max_submap_size,
            local = config.use_local_coordinates,
            "odometry engine created"
        );

        Ok(Self {
            synchronizer: SensorSynchronizer::new(
                SensorInput::new(),
                config.imu_lookahead,
                config.pose_prior_timeout,
            ),
            preprocessor: Preprocessor::from_config(&config),
            initializer: ImuInitializer::new(
                config.imu_calibration_time,
                config.gravity,
                config.static_accel_variance_threshold,
            ),
            integrator: ImuIntegrator::new(config.gravity, config.imu_noise.clone()),
            matcher,
            map,
            optimizer: Optimizer::new(),
            output,
            calibration_window: VecDeque::new(),
            initial_pose: None,
            config,
        })
    }

    pub fn config(&self) -> &LioConfig {
        &self.config
    }

    // Ingestion. Safe to call through a `SensorInput` clone from any thread.

    pub fn insert_points(&self, scan: LidarScan) {
        self.synchronizer.input().insert_points(scan);
    }

    pub fn insert_imu(&self, sample: ImuSample) {
        self.synchronizer.input().insert_imu(sample);
    }

    pub fn insert_map_pose(&self, prior: PosePrior) {
        self.synchronizer.input().insert_map_pose(prior);
    }

    pub fn insert_initial_pose(&self, prior: PosePrior) {
        self.synchronizer.input().insert_initial_pose(prior);
    }

    /// Producer handle for other threads.
    pub fn sensor_input(&self) -> SensorInput {
        self.synchronizer.input().clone()
    }

    /// Read handle for other threads.
    pub fn output(&self) -> OdometryOutput {
        self.output.clone()
    }

    pub fn map_status(&self) -> MapStatus {
        self.map.status()
    }

    pub fn sync_measurement(&mut self) -> Option<Measurement> {
        self.synchronizer.sync()
    }

    /// Crop and downsample a scan for registration.
    pub fn preprocess(&self, scan: &LidarScan) -> Vec<[f32; 3]> {
        self.preprocessor.process(&scan.points)
    }

    /// Feed one measurement to the calibration stage.
    ///
    /// IMU samples are accumulated across calls until the window covers the
    /// calibration time. A window with too much motion is discarded. On
    /// success the state is seeded and the scan becomes the first keyframe.
    pub fn initialize(&mut self, measurement: &Measurement) -> InitStatus {
        if let Some(state) = self.optimizer.state() {
            return InitStatus::Initialized(state);
        }
        if let Some(hint) = self.synchronizer.take_initial_pose() {
            debug!(target: LOGGER_NAME, timestamp = hint.timestamp, "initial pose hint received");
            self.initial_pose = Some(hint);
        }

        self.extend_calibration_window(&measurement.imu);
        let calibration = match self
            .initializer
            .calibrate(self.calibration_window.make_contiguous())
        {
            Ok(calibration) => calibration,
            Err(CalibrationError::ExcessMotion { variance, threshold }) => {
                warn!(
                    target: LOGGER_NAME,
                    variance,
                    threshold,
                    "platform moved during IMU calibration, restarting window"
                );
                self.calibration_window.clear();
                return InitStatus::Calibrating;
            }
            Err(CalibrationError::GravityMismatch { norm, expected }) => {
                warn!(
                    target: LOGGER_NAME,
                    norm,
                    expected,
                    "IMU specific force does not match gravity, restarting window"
                );
                self.calibration_window.clear();
                return InitStatus::Calibrating;
            }
            Err(e) => {
                debug!(target: LOGGER_NAME, "calibrating: {e}");
                return InitStatus::Calibrating;
            }
        };

        let start_pose = if self.config.use_local_coordinates {
            Some(Isometry3::from_parts(
                Translation3::identity(),
                calibration.orientation,
            ))
        } else {
            self.initial_pose
                .as_ref()
                .or(measurement.pose_prior.as_ref())
                .map(|prior| prior.pose)
        };
        let Some(pose) = start_pose else {
            debug!(target: LOGGER_NAME, "IMU calibrated, waiting for an initial pose");
            return InitStatus::AwaitingPose;
        };

        let timestamp = measurement.timestamp();
        let state = NavState::at_rest(timestamp, &pose, calibration.bias);
        if !state.is_finite() {
            warn!(target: LOGGER_NAME, timestamp, "seeded state is not finite, restarting calibration");
            self.calibration_window.clear();
            return InitStatus::Calibrating;
        }
        self.optimizer.initialize(state, self.initial_covariance());
        self.output.publish(state, self.optimizer.pose_covariance());

        let scan = self.preprocessor.crop(&measurement.scan.points);
        if scan.is_empty() || !self.map.build_now(&self.matcher, &pose, timestamp, &scan) {
            warn!(target: LOGGER_NAME, "first scan produced no map, registration starts later");
        }

        self.calibration_window.clear();
        self.initial_pose = None;

        info!(
            target: LOGGER_NAME,
            timestamp,
            samples = calibration.samples,
            gyro_bias = ?calibration.bias.gyro,
            accel_bias = ?calibration.bias.accel,
            "odometry initialized"
        );
        InitStatus::Initialized(state)
    }

    /// Propagate the fused state to `timestamp` with `imu`.
    ///
    /// Does not touch the fused state. `None` before initialization.
    pub fn predict(&self, timestamp: f64, imu: &[ImuSample]) -> Option<Prediction> {
        let state = self.optimizer.state()?;
        Some(
            self.integrator
                .predict(&state, self.optimizer.state_covariance(), imu, timestamp),
        )
    }

    /// Register the scan, fuse it with `prediction`, and maybe grow the map.
    ///
    /// Fails when the prediction or the fused state is not finite, in which
    /// case the previous state is kept.
    pub fn update(
        &mut self,
        measurement: &Measurement,
        prediction: &Prediction,
    ) -> Result<UpdateOutcome, LioError> {
        let Some(last) = self.optimizer.state() else {
            return Ok(UpdateOutcome::Rejected(RejectReason::NotInitialized));
        };

        let timestamp = measurement.timestamp();
        if timestamp <= last.timestamp || prediction.state.timestamp <= last.timestamp {
            warn!(
                target: LOGGER_NAME,
                timestamp,
                last = last.timestamp,
                "rejecting measurement older than the fused state"
            );
            return Ok(UpdateOutcome::Rejected(RejectReason::StaleMeasurement {
                timestamp,
                last: last.timestamp,
            }));
        }

        if !prediction.state.is_finite() {
            warn!(target: LOGGER_NAME, timestamp, "prediction is not finite, skipping registration");
            return Err(LioError::NonFiniteState { timestamp });
        }

        self.map.swap_if_ready(&self.matcher);

        let scan = self.prepare_scan(measurement, &prediction.state);
        let registration = (!scan.registration.is_empty())
            .then(|| self.matcher.align(&scan.registration, &prediction.state.pose()));
        let matched = registration.as_ref().filter(|result| result.success);

        let mut observations = Vec::with_capacity(2);
        if let Some(result) = matched {
            observations.push(PoseObservation {
                pose: result.pose,
                covariance: result.covariance,
            });
            observations.extend(measurement.pose_prior.as_ref().and_then(prior_observation));
        }
        let prior_fused = observations.len() > 1;

        let state = self.optimizer.fuse(prediction, &observations)?;
        self.output.publish(state, self.optimizer.pose_covariance());

        let registered = matched.is_some();
        let map_update = self.update_map(&state, registered, &scan.map);

        let report = CycleReport {
            state,
            prediction: prediction.state,
            scan_points: scan.registration.len(),
            prior_fused,
            map_update,
            registration,
        };

        if registered {
            debug!(
                target: LOGGER_NAME,
                timestamp,
                position = ?state.position,
                map_update = ?map_update,
                "cycle updated"
            );
            Ok(UpdateOutcome::Updated(report))
        } else {
            warn!(
                target: LOGGER_NAME,
                timestamp,
                status = ?report.registration.as_ref().and_then(|r| r.status),
                "registration failed, propagation only"
            );
            Ok(UpdateOutcome::PropagationOnly(report))
        }
    }

    /// Run one step: synchronize, then initialize or predict and update.
    ///
    /// `None` when no complete measurement is available yet.
    pub fn process_next(&mut self) -> Option<Result<CycleEvent, LioError>> {
        let measurement = self.sync_measurement()?;

        if !self.is_initialized() {
            return Some(Ok(CycleEvent::Init(self.initialize(&measurement))));
        }

        let Some(prediction) = self.predict(measurement.timestamp(), &measurement.imu) else {
            return Some(Ok(CycleEvent::Update(UpdateOutcome::Rejected(
                RejectReason::NotInitialized,
            ))));
        };
        Some(self.update(&measurement, &prediction).map(CycleEvent::Update))
    }

    /// Block until pending map rebuilds are installed.
    pub fn wait_for_map(&mut self) -> bool {
        self.map.wait_for_rebuild(&self.matcher)
    }

    pub fn is_initialized(&self) -> bool {
        self.optimizer.is_initialized()
    }

    /// Copy of the last fused state.
    pub fn get_state(&self) -> Option<NavState> {
        self.optimizer.state()
    }

    /// Last fused pose, identity before initialization.
    pub fn get_result(&self) -> Matrix4<f64> {
        self.output.get_result()
    }

    pub fn get_covariance(&self) -> Matrix6<f64> {
        self.optimizer.pose_covariance()
    }

    pub fn get_local_map(&self) -> Arc<LocalMap> {
        self.map.local_map()
    }

    fn extend_calibration_window(&mut self, imu: &[ImuSample]) {
        // Consecutive windows overlap; keep each sample once.
        let newest = self.calibration_window.back().map(|s| s.timestamp);
        self.calibration_window.extend(
            imu.iter()
                .filter(|s| !newest.is_some_and(|t| s.timestamp <= t))
                .copied(),
        );

        if let Some(newest) = self.calibration_window.back().map(|s| s.timestamp) {
            let horizon = newest - 2.0 * self.initializer.calibration_time();
            while self
                .calibration_window
                .front()
                .is_some_and(|s| s.timestamp < horizon)
            {
                self.calibration_window.pop_front();
            }
        }
    }

    fn initial_covariance(&self) -> StateCovariance {
        let init = &self.config.initial_covariance;
        let mut covariance = StateCovariance::zeros();
        for (offset, variance) in [
            (ERR_POS, init.position),
            (ERR_ROT, init.rotation),
            (ERR_VEL, init.velocity),
            (ERR_BG, init.gyro_bias),
            (ERR_BA, init.accel_bias),
        ] {
            covariance
                .fixed_view_mut::<3, 3>(offset, offset)
                .copy_from(&(Matrix3::identity() * variance));
        }
        covariance
    }

    fn prepare_scan(&self, measurement: &Measurement, predicted: &NavState) -> PreparedScan {
        let scan = &measurement.scan;
        let points = if self.config.deskew && scan.point_times.is_some() {
            let gyro = measurement
                .imu
                .iter()
                .rev()
                .find(|s| s.timestamp <= scan.timestamp)
                .or(measurement.imu.last())
                .map_or_else(Vector3::zeros, |s| s.angular_velocity - predicted.bias.gyro);
            let twist = BodyTwist {
                linear: predicted.orientation.inverse() * predicted.velocity,
                angular: gyro,
            };
            deskew_scan(scan, &twist)
        } else {
            scan.points.clone()
        };

        PreparedScan {
            registration: self.preprocessor.process(&points),
            map: self.preprocessor.crop(&points),
        }
    }

    /// Fold the scan into the map when warranted.
    ///
    /// Only registered poses create keyframes, except that a map without
    /// a target takes the next scan regardless.
    fn update_map(
        &mut self,
        state: &NavState,
        registered: bool,
        points: &[[f32; 3]],
    ) -> Option<MapUpdateTrigger> {
        if points.is_empty() {
            return None;
        }
        let pose = state.pose();

        if !self.matcher.has_target() && !self.map.is_rebuilding() {
            return self
                .map
                .build_now(&self.matcher, &pose, state.timestamp, points)
                .then_some(MapUpdateTrigger::FirstKeyframe);
        }
        if !registered {
            return None;
        }

        let trigger = self.map.is_update_required(&pose)?;
        self.map.request_update(&pose, state.timestamp, points);
        Some(trigger)
    }
}

/// Pose prior as an observation of the error state.
///
/// Prior covariances carry rotation uncertainty in the world frame; the
/// error state perturbs rotation on the body side.
fn prior_observation(prior: &PosePrior) -> Option<PoseObservation> {
    let covariance = prior.covariance?;
    let world_to_body = prior.pose.rotation.to_rotation_matrix().into_inner().transpose();
    Some(PoseObservation {
        pose: prior.pose,
        covariance: rotate_rotation_block(&covariance, &world_to_body),
    })
}
